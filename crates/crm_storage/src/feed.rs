#![forbid(unsafe_code)]

use crm_kernel_contracts::change_feed::{ChangeEvent, SessionScoped};
use crm_kernel_contracts::verification::VerificationSessionId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Per-table buffer. A subscriber that falls further behind than this sees
/// `FeedError::Lagged` and must re-read the table.
pub const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("change feed subscriber lagged by {0} events")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Change-feed subscription scoped to one verification session.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct ChangeSubscription<T> {
    session_id: VerificationSessionId,
    rx: broadcast::Receiver<ChangeEvent<T>>,
}

impl<T> ChangeSubscription<T>
where
    T: SessionScoped + Clone,
{
    pub(crate) fn new(
        session_id: VerificationSessionId,
        rx: broadcast::Receiver<ChangeEvent<T>>,
    ) -> Self {
        Self { session_id, rx }
    }

    pub fn session_id(&self) -> &VerificationSessionId {
        &self.session_id
    }

    /// Waits for the next event matching this subscription's session.
    pub async fn recv(&mut self) -> Result<ChangeEvent<T>, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.is_for_session(&self.session_id) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    /// Returns an already-delivered matching event, or `Ok(None)` when the
    /// buffer holds nothing for this session.
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent<T>>, FeedError> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.is_for_session(&self.session_id) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(TryRecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}
