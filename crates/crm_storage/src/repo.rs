#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_kernel_contracts::lead::{LeadId, LeadInput, LeadPatch, LeadQuery, LeadRecord};
use crm_kernel_contracts::verification::{
    VerificationItemId, VerificationItemPatch, VerificationItemRecord, VerificationSessionId,
    VerificationSessionPatch, VerificationSessionRecord,
};

use crate::feed::ChangeSubscription;
use crate::store::{InMemoryCrmStore, StorageError};

/// Typed repository interface for lead records.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn list_leads(&self, query: &LeadQuery) -> Result<Vec<LeadRecord>, StorageError>;
    async fn get_lead(&self, lead_id: &LeadId) -> Result<LeadRecord, StorageError>;
    async fn insert_lead(
        &self,
        input: LeadInput,
        now: DateTime<Utc>,
    ) -> Result<LeadRecord, StorageError>;
    async fn update_lead(
        &self,
        lead_id: &LeadId,
        patch: &LeadPatch,
    ) -> Result<LeadRecord, StorageError>;
    async fn delete_lead(&self, lead_id: &LeadId) -> Result<LeadRecord, StorageError>;
}

/// Typed repository interface for verification sessions and their items,
/// including the session-scoped change feeds.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn get_verification_session(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<VerificationSessionRecord, StorageError>;

    /// All items of a session, ordered by creation time ascending.
    async fn list_verification_items(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<Vec<VerificationItemRecord>, StorageError>;

    async fn update_verification_item(
        &self,
        item_id: &VerificationItemId,
        patch: &VerificationItemPatch,
    ) -> Result<VerificationItemRecord, StorageError>;

    async fn update_verification_session(
        &self,
        session_id: &VerificationSessionId,
        patch: &VerificationSessionPatch,
    ) -> Result<VerificationSessionRecord, StorageError>;

    fn subscribe_session(
        &self,
        session_id: &VerificationSessionId,
    ) -> ChangeSubscription<VerificationSessionRecord>;

    fn subscribe_items(
        &self,
        session_id: &VerificationSessionId,
    ) -> ChangeSubscription<VerificationItemRecord>;
}

#[async_trait]
impl LeadStore for InMemoryCrmStore {
    async fn list_leads(&self, query: &LeadQuery) -> Result<Vec<LeadRecord>, StorageError> {
        self.lead_rows(query)
    }

    async fn get_lead(&self, lead_id: &LeadId) -> Result<LeadRecord, StorageError> {
        self.lead_row(lead_id)
    }

    async fn insert_lead(
        &self,
        input: LeadInput,
        now: DateTime<Utc>,
    ) -> Result<LeadRecord, StorageError> {
        self.insert_lead_row(input, now)
    }

    async fn update_lead(
        &self,
        lead_id: &LeadId,
        patch: &LeadPatch,
    ) -> Result<LeadRecord, StorageError> {
        self.update_lead_row(lead_id, patch)
    }

    async fn delete_lead(&self, lead_id: &LeadId) -> Result<LeadRecord, StorageError> {
        self.delete_lead_row(lead_id)
    }
}

#[async_trait]
impl VerificationStore for InMemoryCrmStore {
    async fn get_verification_session(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<VerificationSessionRecord, StorageError> {
        self.verification_session_row(session_id)
    }

    async fn list_verification_items(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<Vec<VerificationItemRecord>, StorageError> {
        self.verification_item_rows(session_id)
    }

    async fn update_verification_item(
        &self,
        item_id: &VerificationItemId,
        patch: &VerificationItemPatch,
    ) -> Result<VerificationItemRecord, StorageError> {
        self.update_verification_item_row(item_id, patch)
    }

    async fn update_verification_session(
        &self,
        session_id: &VerificationSessionId,
        patch: &VerificationSessionPatch,
    ) -> Result<VerificationSessionRecord, StorageError> {
        self.update_verification_session_row(session_id, patch)
    }

    fn subscribe_session(
        &self,
        session_id: &VerificationSessionId,
    ) -> ChangeSubscription<VerificationSessionRecord> {
        self.subscribe_session_rows(session_id.clone())
    }

    fn subscribe_items(
        &self,
        session_id: &VerificationSessionId,
    ) -> ChangeSubscription<VerificationItemRecord> {
        self.subscribe_item_rows(session_id.clone())
    }
}
