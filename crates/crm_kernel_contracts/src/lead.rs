#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::UserId;
use crate::common::{contract_id, validate_text};
use crate::{ContractViolation, Validate};

contract_id!(LeadId, "lead_id", 64);
contract_id!(CallCenterId, "call_center_id", 64);

pub const DEFAULT_PIPELINE_STAGE: &str = "new";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: LeadId,
    pub customer_name: String,
    pub phone_number: Option<String>,
    pub pipeline_stage: String,
    pub assigned_agent_id: Option<UserId>,
    pub call_center_id: Option<CallCenterId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeadRecord {
    pub fn apply_patch(&mut self, patch: &LeadPatch) {
        if let Some(customer_name) = &patch.customer_name {
            self.customer_name = customer_name.clone();
        }
        if let Some(phone_number) = &patch.phone_number {
            self.phone_number = phone_number.clone();
        }
        if let Some(pipeline_stage) = &patch.pipeline_stage {
            self.pipeline_stage = pipeline_stage.clone();
        }
        if let Some(assigned_agent_id) = &patch.assigned_agent_id {
            self.assigned_agent_id = assigned_agent_id.clone();
        }
        if let Some(call_center_id) = &patch.call_center_id {
            self.call_center_id = call_center_id.clone();
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

impl Validate for LeadRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        validate_text("lead_record.customer_name", &self.customer_name, 256)?;
        validate_text("lead_record.pipeline_stage", &self.pipeline_stage, 64)?;
        if self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "lead_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        Ok(())
    }
}

/// Caller-supplied fields for a new lead. Identity and timestamps are assigned
/// by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadInput {
    pub customer_name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub pipeline_stage: Option<String>,
    #[serde(default)]
    pub assigned_agent_id: Option<UserId>,
    #[serde(default)]
    pub call_center_id: Option<CallCenterId>,
}

impl Validate for LeadInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("lead_input.customer_name", &self.customer_name, 256)?;
        if let Some(stage) = &self.pipeline_stage {
            validate_text("lead_input.pipeline_stage", stage, 64)?;
        }
        Ok(())
    }
}

/// Partial update. Outer `None` leaves a column untouched; for nullable
/// columns `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone_number: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_stage: Option<String>,
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_agent_id: Option<Option<UserId>>,
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub call_center_id: Option<Option<CallCenterId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LeadPatch {
    pub fn touches_assignment(&self) -> bool {
        self.assigned_agent_id.is_some() || self.call_center_id.is_some()
    }
}

impl Validate for LeadPatch {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(customer_name) = &self.customer_name {
            validate_text("lead_patch.customer_name", customer_name, 256)?;
        }
        if let Some(stage) = &self.pipeline_stage {
            validate_text("lead_patch.pipeline_stage", stage, 64)?;
        }
        Ok(())
    }
}

/// Storage-level query shape produced from a resolved view filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadQuery {
    All,
    AssignedAgent(UserId),
    CallCenter(CallCenterId),
}

impl LeadQuery {
    pub fn matches(&self, lead: &LeadRecord) -> bool {
        match self {
            LeadQuery::All => true,
            LeadQuery::AssignedAgent(agent) => lead.assigned_agent_id.as_ref() == Some(agent),
            LeadQuery::CallCenter(center) => lead.call_center_id.as_ref() == Some(center),
        }
    }
}
