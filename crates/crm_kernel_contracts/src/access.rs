#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::contract_id;

contract_id!(
    /// Stable identity of an authenticated CRM user.
    UserId,
    "user_id",
    64
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    CallCenterAgent,
    LicensedSalesAgent,
    UnlicensedSalesAgent,
    SalesManager,
    CallCenterManager,
    SystemAdmin,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::CallCenterAgent,
        Role::LicensedSalesAgent,
        Role::UnlicensedSalesAgent,
        Role::SalesManager,
        Role::CallCenterManager,
        Role::SystemAdmin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::CallCenterAgent => "call_center_agent",
            Role::LicensedSalesAgent => "licensed_sales_agent",
            Role::UnlicensedSalesAgent => "unlicensed_sales_agent",
            Role::SalesManager => "sales_manager",
            Role::CallCenterManager => "call_center_manager",
            Role::SystemAdmin => "system_admin",
        }
    }

    /// Resolves a profile role label. Unknown labels resolve to `None`, which
    /// every permission check treats as "no access".
    pub fn parse(label: &str) -> Option<Role> {
        let label = label.trim();
        Role::ALL.into_iter().find(|role| role.as_str() == label)
    }

    pub fn is_sales_role(self) -> bool {
        matches!(
            self,
            Role::LicensedSalesAgent | Role::UnlicensedSalesAgent | Role::SalesManager
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewAllLeads,
    ViewCallCenterLeads,
    ViewOwnLeads,
    CreateLeads,
    EditAllLeads,
    EditCallCenterLeads,
    EditOwnLeads,
    DeleteLeads,
    AssignLeads,
    ViewPipeline,
    MovePipelineLeads,
    ManagePipelineStages,
    ViewVerification,
    PerformVerification,
    ViewReports,
    ManageUsers,
    ManageCallCenters,
}

impl Permission {
    pub const ALL: [Permission; 17] = [
        Permission::ViewAllLeads,
        Permission::ViewCallCenterLeads,
        Permission::ViewOwnLeads,
        Permission::CreateLeads,
        Permission::EditAllLeads,
        Permission::EditCallCenterLeads,
        Permission::EditOwnLeads,
        Permission::DeleteLeads,
        Permission::AssignLeads,
        Permission::ViewPipeline,
        Permission::MovePipelineLeads,
        Permission::ManagePipelineStages,
        Permission::ViewVerification,
        Permission::PerformVerification,
        Permission::ViewReports,
        Permission::ManageUsers,
        Permission::ManageCallCenters,
    ];
}

/// Informational label attached to each role; never consulted by checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Limited,
    Medium,
    High,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolePermissions {
    pub role: Role,
    pub access_level: AccessLevel,
    pub permissions: BTreeSet<Permission>,
}

impl RolePermissions {
    pub fn contains(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Data-scoping directive used to constrain lead queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "filter_by", rename_all = "snake_case")]
pub enum LeadsViewFilter {
    /// No constraint.
    All,
    /// Leads belonging to the call center of `user_id`.
    CallCenter { user_id: UserId },
    /// Leads whose assigned agent is `user_id`.
    AssignedAgent { user_id: UserId },
    NoAccess,
}

impl LeadsViewFilter {
    pub fn filter_by(&self) -> Option<&'static str> {
        match self {
            LeadsViewFilter::All => Some("all"),
            LeadsViewFilter::CallCenter { .. } => Some("call_center"),
            LeadsViewFilter::AssignedAgent { .. } => Some("assigned_agent_id"),
            LeadsViewFilter::NoAccess => None,
        }
    }

    pub fn value(&self) -> Option<&UserId> {
        match self {
            LeadsViewFilter::CallCenter { user_id } | LeadsViewFilter::AssignedAgent { user_id } => {
                Some(user_id)
            }
            LeadsViewFilter::All | LeadsViewFilter::NoAccess => None,
        }
    }
}
