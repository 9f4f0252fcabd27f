#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::verification::{
    VerificationItemRecord, VerificationSessionId, VerificationSessionRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change with before/after images. Inserts carry only `new`,
/// deletes only `old`, updates both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    pub kind: ChangeKind,
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> ChangeEvent<T> {
    pub fn insert(row: T) -> Self {
        Self {
            kind: ChangeKind::Insert,
            old: None,
            new: Some(row),
        }
    }

    pub fn update(old: T, new: T) -> Self {
        Self {
            kind: ChangeKind::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(row: T) -> Self {
        Self {
            kind: ChangeKind::Delete,
            old: Some(row),
            new: None,
        }
    }
}

/// Rows that belong to exactly one verification session, so a change feed
/// can be scoped with a `session_id = X` predicate.
pub trait SessionScoped {
    fn scope_session_id(&self) -> &VerificationSessionId;
}

impl SessionScoped for VerificationSessionRecord {
    fn scope_session_id(&self) -> &VerificationSessionId {
        &self.id
    }
}

impl SessionScoped for VerificationItemRecord {
    fn scope_session_id(&self) -> &VerificationSessionId {
        &self.session_id
    }
}

impl<T: SessionScoped> ChangeEvent<T> {
    pub fn is_for_session(&self, session_id: &VerificationSessionId) -> bool {
        self.new
            .iter()
            .chain(self.old.iter())
            .any(|row| row.scope_session_id() == session_id)
    }
}
