#![forbid(unsafe_code)]

//! Reconciliation for one mounted verification session.
//!
//! Both mutation paths, local write-through patches and rows pushed by the
//! change feed, go through [`reconcile`]. Feed rows replace the cached row
//! wholesale; local patches merge only the fields that were written.

use crm_kernel_contracts::change_feed::{ChangeEvent, ChangeKind};
use crm_kernel_contracts::verification::{
    VerificationItemId, VerificationItemPatch, VerificationItemRecord, VerificationSessionId,
    VerificationSessionPatch, VerificationSessionRecord, VerificationSessionStatus,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Loading,
    Ready,
    Error,
    RetryPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInput {
    FetchStarted,
    FetchSucceeded {
        requested: VerificationSessionId,
        session: VerificationSessionRecord,
        items: Vec<VerificationItemRecord>,
    },
    FetchFailed {
        requested: VerificationSessionId,
        message: String,
    },
    SessionChanged(ChangeEvent<VerificationSessionRecord>),
    ItemChanged(ChangeEvent<VerificationItemRecord>),
    ItemWritten {
        item_id: VerificationItemId,
        patch: VerificationItemPatch,
    },
    SessionWritten {
        patch: VerificationSessionPatch,
    },
    Reset {
        session_id: VerificationSessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEffect {
    None,
    /// The caller must schedule exactly one delayed re-fetch.
    ScheduleRetry,
    /// A fetch result for a session this state no longer tracks was dropped.
    DiscardedStale,
    /// The input referenced a row this state does not hold.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSyncState {
    session_id: VerificationSessionId,
    phase: SyncPhase,
    session: Option<VerificationSessionRecord>,
    items: Vec<VerificationItemRecord>,
    error: Option<String>,
    retry_used: bool,
}

impl VerificationSyncState {
    pub fn new(session_id: VerificationSessionId) -> Self {
        Self {
            session_id,
            phase: SyncPhase::Loading,
            session: None,
            items: Vec::new(),
            error: None,
            retry_used: false,
        }
    }

    pub fn session_id(&self) -> &VerificationSessionId {
        &self.session_id
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn session(&self) -> Option<&VerificationSessionRecord> {
        self.session.as_ref()
    }

    pub fn items(&self) -> &[VerificationItemRecord] {
        &self.items
    }

    pub fn item(&self, item_id: &VerificationItemId) -> Option<&VerificationItemRecord> {
        self.items.iter().find(|item| &item.id == item_id)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retry_used(&self) -> bool {
        self.retry_used
    }

    pub fn progress(&self) -> VerificationProgress {
        VerificationProgress::of(&self.items)
    }

    fn item_mut(&mut self, item_id: &VerificationItemId) -> Option<&mut VerificationItemRecord> {
        self.items.iter_mut().find(|item| &item.id == item_id)
    }
}

pub fn reconcile(state: &mut VerificationSyncState, input: SyncInput) -> SyncEffect {
    match input {
        SyncInput::FetchStarted => {
            state.phase = SyncPhase::Loading;
            SyncEffect::None
        }
        SyncInput::FetchSucceeded {
            requested,
            session,
            items,
        } => {
            if requested != state.session_id {
                return SyncEffect::DiscardedStale;
            }
            let empty = items.is_empty();
            state.session = Some(session);
            state.items = items;
            state.error = None;
            if empty && !state.retry_used {
                state.retry_used = true;
                state.phase = SyncPhase::RetryPending;
                SyncEffect::ScheduleRetry
            } else {
                state.phase = SyncPhase::Ready;
                SyncEffect::None
            }
        }
        SyncInput::FetchFailed { requested, message } => {
            if requested != state.session_id {
                return SyncEffect::DiscardedStale;
            }
            state.phase = SyncPhase::Error;
            state.error = Some(message);
            SyncEffect::None
        }
        SyncInput::SessionChanged(event) => apply_session_event(state, event),
        SyncInput::ItemChanged(event) => apply_item_event(state, event),
        SyncInput::ItemWritten { item_id, patch } => match state.item_mut(&item_id) {
            Some(item) => {
                item.apply_patch(&patch);
                SyncEffect::None
            }
            None => SyncEffect::Ignored,
        },
        SyncInput::SessionWritten { patch } => match state.session.as_mut() {
            Some(session) => {
                session.apply_patch(&patch);
                SyncEffect::None
            }
            None => SyncEffect::Ignored,
        },
        SyncInput::Reset { session_id } => {
            *state = VerificationSyncState::new(session_id);
            SyncEffect::None
        }
    }
}

fn apply_session_event(
    state: &mut VerificationSyncState,
    event: ChangeEvent<VerificationSessionRecord>,
) -> SyncEffect {
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => match event.new {
            Some(row) if row.id == state.session_id => {
                state.session = Some(row);
                SyncEffect::None
            }
            _ => SyncEffect::Ignored,
        },
        ChangeKind::Delete => match event.old {
            Some(row) if row.id == state.session_id => {
                state.session = None;
                SyncEffect::None
            }
            _ => SyncEffect::Ignored,
        },
    }
}

fn apply_item_event(
    state: &mut VerificationSyncState,
    event: ChangeEvent<VerificationItemRecord>,
) -> SyncEffect {
    match event.kind {
        ChangeKind::Insert => match event.new {
            Some(row) if row.session_id == state.session_id => {
                match state.item_mut(&row.id) {
                    Some(existing) => *existing = row,
                    None => state.items.push(row),
                }
                SyncEffect::None
            }
            _ => SyncEffect::Ignored,
        },
        ChangeKind::Update => match event.new {
            Some(row) => match state.item_mut(&row.id) {
                Some(existing) => {
                    *existing = row;
                    SyncEffect::None
                }
                None => SyncEffect::Ignored,
            },
            None => SyncEffect::Ignored,
        },
        ChangeKind::Delete => match event.old {
            Some(row) => {
                let before = state.items.len();
                state.items.retain(|item| item.id != row.id);
                if state.items.len() == before {
                    SyncEffect::Ignored
                } else {
                    SyncEffect::None
                }
            }
            None => SyncEffect::Ignored,
        },
    }
}

/// Status moves allowed from the current status. Terminal statuses only
/// accept themselves.
pub fn is_allowed_status_transition(
    from: VerificationSessionStatus,
    to: VerificationSessionStatus,
) -> bool {
    from == to || !from.is_terminal()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerificationProgress {
    pub total: usize,
    pub verified: usize,
    pub modified: usize,
}

impl VerificationProgress {
    pub fn of(items: &[VerificationItemRecord]) -> Self {
        Self {
            total: items.len(),
            verified: items.iter().filter(|i| i.is_verified).count(),
            modified: items.iter().filter(|i| i.is_modified).count(),
        }
    }

    /// Whole-number percentage of verified items; an empty checklist is 0.
    pub fn percent_complete(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.verified * 100) / self.total) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.verified == self.total
    }
}
