#![forbid(unsafe_code)]

//! Role → permission table and the predicates every surface consults before
//! rendering an action or scoping a lead query.
//!
//! Every function here is a pure function of the caller's role (and, for lead
//! editing, the lead's ownership columns). An absent role denies everything.

use std::collections::BTreeSet;

use crm_kernel_contracts::access::{
    AccessLevel, LeadsViewFilter, Permission, Role, RolePermissions, UserId,
};
use crm_kernel_contracts::lead::{CallCenterId, LeadRecord};

use Permission::*;

const CALL_CENTER_AGENT: &[Permission] = &[
    ViewOwnLeads,
    CreateLeads,
    EditOwnLeads,
    ViewPipeline,
    ViewVerification,
    PerformVerification,
];

const LICENSED_SALES_AGENT: &[Permission] = &[
    ViewAllLeads,
    ViewPipeline,
    ViewVerification,
    PerformVerification,
];

const UNLICENSED_SALES_AGENT: &[Permission] = &[ViewAllLeads, ViewPipeline, ViewVerification];

const SALES_MANAGER: &[Permission] = &[
    ViewAllLeads,
    AssignLeads,
    ViewPipeline,
    ViewVerification,
    ViewReports,
];

const CALL_CENTER_MANAGER: &[Permission] = &[
    ViewCallCenterLeads,
    CreateLeads,
    EditCallCenterLeads,
    AssignLeads,
    ViewPipeline,
    MovePipelineLeads,
    ViewVerification,
    PerformVerification,
    ViewReports,
    ManageUsers,
];

const SYSTEM_ADMIN: &[Permission] = &Permission::ALL;

fn grants(role: Role) -> (AccessLevel, &'static [Permission]) {
    match role {
        Role::CallCenterAgent => (AccessLevel::Limited, CALL_CENTER_AGENT),
        Role::LicensedSalesAgent => (AccessLevel::Medium, LICENSED_SALES_AGENT),
        Role::UnlicensedSalesAgent => (AccessLevel::Limited, UNLICENSED_SALES_AGENT),
        Role::SalesManager => (AccessLevel::High, SALES_MANAGER),
        Role::CallCenterManager => (AccessLevel::High, CALL_CENTER_MANAGER),
        Role::SystemAdmin => (AccessLevel::Full, SYSTEM_ADMIN),
    }
}

pub fn role_permissions(role: Role) -> RolePermissions {
    let (access_level, permissions) = grants(role);
    RolePermissions {
        role,
        access_level,
        permissions: permissions.iter().copied().collect::<BTreeSet<_>>(),
    }
}

pub fn has_permission(role: Option<Role>, permission: Permission) -> bool {
    match role {
        Some(role) => grants(role).1.contains(&permission),
        None => false,
    }
}

pub fn has_any_permission(role: Option<Role>, permissions: &[Permission]) -> bool {
    permissions.iter().any(|p| has_permission(role, *p))
}

pub fn has_all_permissions(role: Option<Role>, permissions: &[Permission]) -> bool {
    role.is_some() && permissions.iter().all(|p| has_permission(role, *p))
}

/// Scope for lead queries. The widest granted view wins.
pub fn leads_view_filter(role: Option<Role>, user_id: Option<&UserId>) -> LeadsViewFilter {
    let Some(user_id) = user_id else {
        return LeadsViewFilter::NoAccess;
    };
    if has_permission(role, ViewAllLeads) {
        LeadsViewFilter::All
    } else if has_permission(role, ViewCallCenterLeads) {
        LeadsViewFilter::CallCenter {
            user_id: user_id.clone(),
        }
    } else if has_permission(role, ViewOwnLeads) {
        LeadsViewFilter::AssignedAgent {
            user_id: user_id.clone(),
        }
    } else {
        LeadsViewFilter::NoAccess
    }
}

pub fn can_edit_lead(
    role: Option<Role>,
    user_id: Option<&UserId>,
    lead: &LeadRecord,
    _user_call_center_id: Option<&CallCenterId>,
) -> bool {
    let Some(role) = role else {
        return false;
    };
    // Sales roles work leads read-only.
    if role.is_sales_role() {
        return false;
    }
    match role {
        Role::CallCenterAgent => {
            has_permission(Some(role), EditOwnLeads)
                && user_id.is_some()
                && lead.assigned_agent_id.as_ref() == user_id
        }
        _ => has_permission(Some(role), EditAllLeads),
    }
}

pub fn can_create_lead(role: Option<Role>) -> bool {
    has_permission(role, CreateLeads)
}

pub fn can_delete_lead(role: Option<Role>) -> bool {
    has_permission(role, DeleteLeads)
}

pub fn can_assign_leads(role: Option<Role>) -> bool {
    has_permission(role, AssignLeads)
}

pub fn can_drag_drop_in_pipeline(role: Option<Role>) -> bool {
    has_all_permissions(role, &[ViewPipeline, MovePipelineLeads])
}

pub fn is_pipeline_read_only(role: Option<Role>) -> bool {
    has_permission(role, ViewPipeline) && !has_permission(role, MovePipelineLeads)
}

pub fn can_manage_pipeline_stages(role: Option<Role>) -> bool {
    has_permission(role, ManagePipelineStages)
}

pub fn can_see_assignment_section(role: Option<Role>) -> bool {
    has_any_permission(role, &[AssignLeads, EditAllLeads])
}

pub fn can_perform_verification(role: Option<Role>) -> bool {
    has_permission(role, PerformVerification)
}
