#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::UserId;
use crate::common::{contract_id, validate_text};
use crate::{ContractViolation, Validate};

contract_id!(VerificationSessionId, "verification_session_id", 64);
contract_id!(VerificationItemId, "verification_item_id", 64);
contract_id!(SubmissionId, "submission_id", 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationSessionStatus {
    Pending,
    InProgress,
    ReadyForTransfer,
    Transferred,
    Completed,
}

impl VerificationSessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationSessionStatus::Pending => "pending",
            VerificationSessionStatus::InProgress => "in_progress",
            VerificationSessionStatus::ReadyForTransfer => "ready_for_transfer",
            VerificationSessionStatus::Transferred => "transferred",
            VerificationSessionStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            VerificationSessionStatus::Transferred | VerificationSessionStatus::Completed => true,
            VerificationSessionStatus::Pending
            | VerificationSessionStatus::InProgress
            | VerificationSessionStatus::ReadyForTransfer => false,
        }
    }

    /// Whether entering this status stamps `completed_at`.
    pub fn stamps_completed_at(self) -> bool {
        self.is_terminal()
    }

    /// Whether entering this status stamps `transferred_at`.
    pub fn stamps_transferred_at(self) -> bool {
        matches!(self, VerificationSessionStatus::Transferred)
    }
}

impl fmt::Display for VerificationSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSessionRecord {
    pub id: VerificationSessionId,
    pub submission_id: SubmissionId,
    pub status: VerificationSessionStatus,
    pub buffer_agent_id: Option<UserId>,
    pub licensed_agent_id: Option<UserId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationSessionRecord {
    /// Shallow merge: only fields present in the patch are overwritten.
    pub fn apply_patch(&mut self, patch: &VerificationSessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(licensed_agent_id) = &patch.licensed_agent_id {
            self.licensed_agent_id = licensed_agent_id.clone();
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(transferred_at) = patch.transferred_at {
            self.transferred_at = Some(transferred_at);
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

impl Validate for VerificationSessionRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        self.submission_id.validate()?;
        if self.transferred_at.is_some() && self.status != VerificationSessionStatus::Transferred
        {
            return Err(ContractViolation::InvalidValue {
                field: "verification_session_record.transferred_at",
                reason: "must be absent unless status=transferred",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VerificationSessionStatus>,
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub licensed_agent_id: Option<Option<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl VerificationSessionPatch {
    /// Status change with the timestamps the new status implies.
    pub fn status_change(status: VerificationSessionStatus, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            licensed_agent_id: None,
            completed_at: status.stamps_completed_at().then_some(now),
            transferred_at: status.stamps_transferred_at().then_some(now),
            updated_at: Some(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationItemRecord {
    pub id: VerificationItemId,
    pub session_id: VerificationSessionId,
    pub field_name: String,
    pub original_value: Option<String>,
    pub verified_value: Option<String>,
    pub is_verified: bool,
    pub is_modified: bool,
    pub notes: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationItemRecord {
    /// Modified flag for a candidate verified value. Exact equality against the
    /// submitted value; no normalization.
    pub fn modified_for(&self, verified_value: Option<&str>) -> bool {
        verified_value != self.original_value.as_deref()
    }

    /// Shallow merge: only fields present in the patch are overwritten.
    pub fn apply_patch(&mut self, patch: &VerificationItemPatch) {
        if let Some(verified_value) = &patch.verified_value {
            self.verified_value = verified_value.clone();
        }
        if let Some(is_verified) = patch.is_verified {
            self.is_verified = is_verified;
        }
        if let Some(is_modified) = patch.is_modified {
            self.is_modified = is_modified;
        }
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
        if let Some(verified_at) = patch.verified_at {
            self.verified_at = verified_at;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

impl Validate for VerificationItemRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        self.session_id.validate()?;
        validate_text("verification_item_record.field_name", &self.field_name, 128)?;
        if self.verified_value.is_some()
            && self.is_modified != self.modified_for(self.verified_value.as_deref())
        {
            return Err(ContractViolation::InvalidValue {
                field: "verification_item_record.is_modified",
                reason: "must equal verified_value != original_value",
            });
        }
        Ok(())
    }
}

/// Partial update of one verification item. Outer `None` leaves a column
/// untouched; for nullable columns `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationItemPatch {
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub verified_value: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_modified: Option<bool>,
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "crate::common::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub verified_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl VerificationItemPatch {
    pub fn with_updated_at(mut self, now: DateTime<Utc>) -> Self {
        self.updated_at = Some(now);
        self
    }
}

/// Seed row for bulk item creation when a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFieldSeed {
    pub field_name: String,
    pub original_value: Option<String>,
}

impl VerificationFieldSeed {
    pub fn new(field_name: impl Into<String>, original_value: Option<&str>) -> Self {
        Self {
            field_name: field_name.into(),
            original_value: original_value.map(str::to_string),
        }
    }
}

impl Validate for VerificationFieldSeed {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("verification_field_seed.field_name", &self.field_name, 128)
    }
}
