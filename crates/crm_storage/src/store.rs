#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use crm_kernel_contracts::access::UserId;
use crm_kernel_contracts::change_feed::ChangeEvent;
use crm_kernel_contracts::lead::{
    LeadId, LeadInput, LeadPatch, LeadQuery, LeadRecord, DEFAULT_PIPELINE_STAGE,
};
use crm_kernel_contracts::verification::{
    SubmissionId, VerificationFieldSeed, VerificationItemId, VerificationItemPatch,
    VerificationItemRecord, VerificationSessionId, VerificationSessionPatch,
    VerificationSessionRecord, VerificationSessionStatus,
};
use crm_kernel_contracts::{ContractViolation, Validate};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::feed::{ChangeSubscription, FEED_CAPACITY};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table}: foreign key {key} does not resolve")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

const LEADS_TABLE: &str = "leads";
const SESSIONS_TABLE: &str = "verification_sessions";
const ITEMS_TABLE: &str = "verification_items";

#[derive(Debug, Clone)]
struct StoredItem {
    seq: u64,
    record: VerificationItemRecord,
}

#[derive(Debug, Default)]
struct CrmTables {
    next_seq: u64,
    leads: BTreeMap<LeadId, LeadRecord>,
    sessions: BTreeMap<VerificationSessionId, VerificationSessionRecord>,
    items: BTreeMap<VerificationItemId, StoredItem>,
}

impl CrmTables {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// In-process record store standing in for the hosted database.
///
/// Tables sit behind one mutex; every committed write to the verification
/// tables is published on that table's change feed while the lock is held, so
/// feed order matches commit order.
#[derive(Debug)]
pub struct InMemoryCrmStore {
    tables: Mutex<CrmTables>,
    session_feed: broadcast::Sender<ChangeEvent<VerificationSessionRecord>>,
    item_feed: broadcast::Sender<ChangeEvent<VerificationItemRecord>>,
}

impl Default for InMemoryCrmStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl InMemoryCrmStore {
    pub fn new_in_memory() -> Self {
        let (session_feed, _) = broadcast::channel(FEED_CAPACITY);
        let (item_feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tables: Mutex::new(CrmTables::default()),
            session_feed,
            item_feed,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CrmTables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn session_subscriber_count(&self) -> usize {
        self.session_feed.receiver_count()
    }

    pub fn item_subscriber_count(&self) -> usize {
        self.item_feed.receiver_count()
    }

    pub(crate) fn subscribe_session_rows(
        &self,
        session_id: VerificationSessionId,
    ) -> ChangeSubscription<VerificationSessionRecord> {
        ChangeSubscription::new(session_id, self.session_feed.subscribe())
    }

    pub(crate) fn subscribe_item_rows(
        &self,
        session_id: VerificationSessionId,
    ) -> ChangeSubscription<VerificationItemRecord> {
        ChangeSubscription::new(session_id, self.item_feed.subscribe())
    }

    // ---- leads ----

    pub fn insert_lead_row(
        &self,
        input: LeadInput,
        now: DateTime<Utc>,
    ) -> Result<LeadRecord, StorageError> {
        input.validate()?;
        let record = LeadRecord {
            id: LeadId::new(Uuid::new_v4().to_string())?,
            customer_name: input.customer_name,
            phone_number: input.phone_number,
            pipeline_stage: input
                .pipeline_stage
                .unwrap_or_else(|| DEFAULT_PIPELINE_STAGE.to_string()),
            assigned_agent_id: input.assigned_agent_id,
            call_center_id: input.call_center_id,
            created_at: now,
            updated_at: now,
        };
        record.validate()?;
        let mut tables = self.lock()?;
        if tables.leads.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey {
                table: LEADS_TABLE,
                key: record.id.to_string(),
            });
        }
        tables.leads.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn lead_row(&self, lead_id: &LeadId) -> Result<LeadRecord, StorageError> {
        let tables = self.lock()?;
        tables
            .leads
            .get(lead_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                table: LEADS_TABLE,
                key: lead_id.to_string(),
            })
    }

    /// Leads matching `query`, oldest first.
    pub fn lead_rows(&self, query: &LeadQuery) -> Result<Vec<LeadRecord>, StorageError> {
        let tables = self.lock()?;
        let mut rows: Vec<LeadRecord> = tables
            .leads
            .values()
            .filter(|lead| query.matches(lead))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    pub fn update_lead_row(
        &self,
        lead_id: &LeadId,
        patch: &LeadPatch,
    ) -> Result<LeadRecord, StorageError> {
        patch.validate()?;
        let mut tables = self.lock()?;
        let lead = tables
            .leads
            .get_mut(lead_id)
            .ok_or_else(|| StorageError::NotFound {
                table: LEADS_TABLE,
                key: lead_id.to_string(),
            })?;
        let mut updated = lead.clone();
        updated.apply_patch(patch);
        updated.validate()?;
        *lead = updated.clone();
        Ok(updated)
    }

    pub fn delete_lead_row(&self, lead_id: &LeadId) -> Result<LeadRecord, StorageError> {
        let mut tables = self.lock()?;
        tables
            .leads
            .remove(lead_id)
            .ok_or_else(|| StorageError::NotFound {
                table: LEADS_TABLE,
                key: lead_id.to_string(),
            })
    }

    // ---- verification ----

    /// Creates a session in `pending` together with one item per field seed.
    /// Items share the session's creation time and keep seed order.
    pub fn start_verification_session(
        &self,
        submission_id: SubmissionId,
        buffer_agent_id: Option<UserId>,
        fields: Vec<VerificationFieldSeed>,
        now: DateTime<Utc>,
    ) -> Result<(VerificationSessionRecord, Vec<VerificationItemRecord>), StorageError> {
        for seed in &fields {
            seed.validate()?;
        }
        let session = VerificationSessionRecord {
            id: VerificationSessionId::new(Uuid::new_v4().to_string())?,
            submission_id,
            status: VerificationSessionStatus::Pending,
            buffer_agent_id,
            licensed_agent_id: None,
            started_at: now,
            completed_at: None,
            transferred_at: None,
            created_at: now,
            updated_at: now,
        };
        session.validate()?;

        let mut tables = self.lock()?;
        tables.sessions.insert(session.id.clone(), session.clone());
        let _ = self.session_feed.send(ChangeEvent::insert(session.clone()));

        let mut items = Vec::with_capacity(fields.len());
        for seed in fields {
            let item = new_item(&session.id, seed, now)?;
            let seq = tables.bump_seq();
            tables.items.insert(
                item.id.clone(),
                StoredItem {
                    seq,
                    record: item.clone(),
                },
            );
            let _ = self.item_feed.send(ChangeEvent::insert(item.clone()));
            items.push(item);
        }
        Ok((session, items))
    }

    pub fn insert_verification_item(
        &self,
        session_id: &VerificationSessionId,
        seed: VerificationFieldSeed,
        now: DateTime<Utc>,
    ) -> Result<VerificationItemRecord, StorageError> {
        seed.validate()?;
        let mut tables = self.lock()?;
        if !tables.sessions.contains_key(session_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: ITEMS_TABLE,
                key: session_id.to_string(),
            });
        }
        let item = new_item(session_id, seed, now)?;
        let seq = tables.bump_seq();
        tables.items.insert(
            item.id.clone(),
            StoredItem {
                seq,
                record: item.clone(),
            },
        );
        let _ = self.item_feed.send(ChangeEvent::insert(item.clone()));
        Ok(item)
    }

    pub fn verification_session_row(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<VerificationSessionRecord, StorageError> {
        let tables = self.lock()?;
        tables
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                table: SESSIONS_TABLE,
                key: session_id.to_string(),
            })
    }

    /// Items of one session ordered by creation time ascending; ties keep
    /// insertion order.
    pub fn verification_item_rows(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<Vec<VerificationItemRecord>, StorageError> {
        let tables = self.lock()?;
        let mut rows: Vec<&StoredItem> = tables
            .items
            .values()
            .filter(|stored| &stored.record.session_id == session_id)
            .collect();
        rows.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        Ok(rows.into_iter().map(|stored| stored.record.clone()).collect())
    }

    pub fn update_verification_item_row(
        &self,
        item_id: &VerificationItemId,
        patch: &VerificationItemPatch,
    ) -> Result<VerificationItemRecord, StorageError> {
        let mut tables = self.lock()?;
        let stored = tables
            .items
            .get_mut(item_id)
            .ok_or_else(|| StorageError::NotFound {
                table: ITEMS_TABLE,
                key: item_id.to_string(),
            })?;
        let old = stored.record.clone();
        let mut updated = old.clone();
        updated.apply_patch(patch);
        updated.validate()?;
        stored.record = updated.clone();
        let _ = self.item_feed.send(ChangeEvent::update(old, updated.clone()));
        Ok(updated)
    }

    pub fn update_verification_session_row(
        &self,
        session_id: &VerificationSessionId,
        patch: &VerificationSessionPatch,
    ) -> Result<VerificationSessionRecord, StorageError> {
        let mut tables = self.lock()?;
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound {
                table: SESSIONS_TABLE,
                key: session_id.to_string(),
            })?;
        let old = session.clone();
        let mut updated = old.clone();
        updated.apply_patch(patch);
        updated.validate()?;
        *session = updated.clone();
        let _ = self
            .session_feed
            .send(ChangeEvent::update(old, updated.clone()));
        Ok(updated)
    }

    pub fn delete_verification_item_row(
        &self,
        item_id: &VerificationItemId,
    ) -> Result<VerificationItemRecord, StorageError> {
        let mut tables = self.lock()?;
        let stored = tables
            .items
            .remove(item_id)
            .ok_or_else(|| StorageError::NotFound {
                table: ITEMS_TABLE,
                key: item_id.to_string(),
            })?;
        let _ = self
            .item_feed
            .send(ChangeEvent::delete(stored.record.clone()));
        Ok(stored.record)
    }
}

fn new_item(
    session_id: &VerificationSessionId,
    seed: VerificationFieldSeed,
    now: DateTime<Utc>,
) -> Result<VerificationItemRecord, StorageError> {
    let item = VerificationItemRecord {
        id: VerificationItemId::new(Uuid::new_v4().to_string())?,
        session_id: session_id.clone(),
        field_name: seed.field_name,
        original_value: seed.original_value,
        verified_value: None,
        is_verified: false,
        is_modified: false,
        notes: None,
        verified_at: None,
        created_at: now,
        updated_at: now,
    };
    item.validate()?;
    Ok(item)
}
