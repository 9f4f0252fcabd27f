#![forbid(unsafe_code)]

//! Live view of one verification session.
//!
//! A mounted [`VerificationSync`] holds the cached session and items, the two
//! session-scoped change subscriptions and at most one pending retry timer.
//! It is driven from a single task: user writes (`&mut self` methods) and
//! [`VerificationSync::next_event`] never run concurrently, so local patches
//! and pushed rows are applied in the order the driver observes them.

use std::sync::Arc;
use std::time::Duration;

use crm_engines::verification::{
    is_allowed_status_transition, reconcile, SyncEffect, SyncInput, SyncPhase,
    VerificationProgress, VerificationSyncState,
};
use crm_kernel_contracts::change_feed::{ChangeEvent, ChangeKind};
use crm_kernel_contracts::verification::{
    VerificationItemId, VerificationItemPatch, VerificationItemRecord, VerificationSessionId,
    VerificationSessionPatch, VerificationSessionRecord, VerificationSessionStatus,
};
use crm_storage::feed::{ChangeSubscription, FeedError};
use crm_storage::repo::VerificationStore;
use crm_storage::store::StorageError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationSyncConfig {
    /// Delay before the single re-fetch issued when a session loads with no
    /// items yet.
    pub retry_delay: Duration,
}

impl VerificationSyncConfig {
    pub fn mvp_v1() -> Self {
        Self {
            retry_delay: Duration::from_millis(1_000),
        }
    }
}

impl Default for VerificationSyncConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("verification item {0} is not loaded")]
    UnknownItem(VerificationItemId),
    #[error("verification session cannot move from {from} to {to}")]
    StatusTransition {
        from: VerificationSessionStatus,
        to: VerificationSessionStatus,
    },
}

/// What [`VerificationSync::next_event`] applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncNotice {
    SessionChanged(ChangeKind),
    ItemChanged(ChangeKind),
    /// The delayed re-fetch ran.
    Retried,
    /// A subscription fell behind and the session was re-read.
    Resynced { missed: u64 },
}

struct SessionFeeds {
    session: ChangeSubscription<VerificationSessionRecord>,
    items: ChangeSubscription<VerificationItemRecord>,
}

enum Wake {
    Session(Result<ChangeEvent<VerificationSessionRecord>, FeedError>),
    Item(Result<ChangeEvent<VerificationItemRecord>, FeedError>),
    Retry,
}

pub struct VerificationSync<S: VerificationStore + ?Sized, C: Clock = SystemClock> {
    store: Arc<S>,
    clock: C,
    config: VerificationSyncConfig,
    state: VerificationSyncState,
    feeds: Option<SessionFeeds>,
    retry_at: Option<Instant>,
}

impl<S: VerificationStore + ?Sized, C: Clock> VerificationSync<S, C> {
    /// Opens both subscriptions before the initial load.
    pub async fn mount(
        store: Arc<S>,
        clock: C,
        config: VerificationSyncConfig,
        session_id: VerificationSessionId,
    ) -> Self {
        let mut sync = Self {
            store,
            clock,
            config,
            state: VerificationSyncState::new(session_id),
            feeds: None,
            retry_at: None,
        };
        sync.open_feeds();
        info!(session_id = %sync.state.session_id(), "verification session mounted");
        sync.fetch_session_data().await;
        sync
    }

    pub fn session_id(&self) -> &VerificationSessionId {
        self.state.session_id()
    }

    pub fn state(&self) -> &VerificationSyncState {
        &self.state
    }

    pub fn session(&self) -> Option<&VerificationSessionRecord> {
        self.state.session()
    }

    pub fn items(&self) -> &[VerificationItemRecord] {
        self.state.items()
    }

    pub fn phase(&self) -> SyncPhase {
        self.state.phase()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state.phase(), SyncPhase::Loading)
    }

    pub fn error(&self) -> Option<&str> {
        self.state.error()
    }

    pub fn progress(&self) -> VerificationProgress {
        self.state.progress()
    }

    pub fn is_mounted(&self) -> bool {
        self.feeds.is_some()
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_at.is_some()
    }

    /// Re-reads the session and its items. A failure lands in the sync state
    /// as an error message; it is never returned.
    pub async fn fetch_session_data(&mut self) {
        self.retry_at = None;
        let requested = self.state.session_id().clone();
        reconcile(&mut self.state, SyncInput::FetchStarted);
        let input = match self.load(&requested).await {
            Ok((session, items)) => SyncInput::FetchSucceeded {
                requested,
                session,
                items,
            },
            Err(err) => {
                warn!(session_id = %requested, error = %err, "verification fetch failed");
                SyncInput::FetchFailed {
                    requested,
                    message: format!("failed to load verification session: {err}"),
                }
            }
        };
        self.apply(input);
    }

    /// Waits for the next feed event or the retry timer and applies it.
    /// Returns `None` once unmounted or when the feeds have closed.
    pub async fn next_event(&mut self) -> Option<SyncNotice> {
        let retry_at = self.retry_at;
        let feeds = self.feeds.as_mut()?;
        let wake = tokio::select! {
            event = feeds.session.recv() => Wake::Session(event),
            event = feeds.items.recv() => Wake::Item(event),
            _ = sleep_until_deadline(retry_at) => Wake::Retry,
        };

        match wake {
            Wake::Session(Ok(event)) => {
                let kind = event.kind;
                debug!(?kind, "verification session row pushed");
                self.apply(SyncInput::SessionChanged(event));
                Some(SyncNotice::SessionChanged(kind))
            }
            Wake::Item(Ok(event)) => {
                let kind = event.kind;
                debug!(?kind, "verification item row pushed");
                self.apply(SyncInput::ItemChanged(event));
                Some(SyncNotice::ItemChanged(kind))
            }
            Wake::Session(Err(err)) | Wake::Item(Err(err)) => self.on_feed_error(err).await,
            Wake::Retry => {
                info!(session_id = %self.state.session_id(), "retrying empty verification fetch");
                self.fetch_session_data().await;
                Some(SyncNotice::Retried)
            }
        }
    }

    /// Applies every event already delivered to the subscriptions without
    /// waiting. Returns how many events were applied.
    pub async fn drain_pending(&mut self) -> usize {
        let mut inputs = Vec::new();
        let mut missed = None;
        if let Some(feeds) = self.feeds.as_mut() {
            loop {
                match feeds.session.try_recv() {
                    Ok(Some(event)) => inputs.push(SyncInput::SessionChanged(event)),
                    Ok(None) | Err(FeedError::Closed) => break,
                    Err(FeedError::Lagged(n)) => {
                        missed = Some(n);
                        break;
                    }
                }
            }
            loop {
                match feeds.items.try_recv() {
                    Ok(Some(event)) => inputs.push(SyncInput::ItemChanged(event)),
                    Ok(None) | Err(FeedError::Closed) => break,
                    Err(FeedError::Lagged(n)) => {
                        missed = Some(missed.unwrap_or(0) + n);
                        break;
                    }
                }
            }
        }
        let applied = inputs.len();
        for input in inputs {
            self.apply(input);
        }
        if let Some(missed) = missed {
            warn!(missed, "verification feed lagged; re-reading session");
            self.fetch_session_data().await;
        }
        applied
    }

    /// Writes `patch` (stamped with `updated_at`) to the store, then merges
    /// the written fields into the cached item.
    pub async fn update_verification_item(
        &mut self,
        item_id: &VerificationItemId,
        patch: VerificationItemPatch,
    ) -> Result<VerificationItemRecord, SyncError> {
        let patch = patch.with_updated_at(self.clock.now());
        let stored = self.store.update_verification_item(item_id, &patch).await?;
        if self.apply(SyncInput::ItemWritten {
            item_id: item_id.clone(),
            patch,
        }) == SyncEffect::Ignored
        {
            debug!(item_id = %item_id, "written item is not cached");
        }
        Ok(stored)
    }

    pub async fn toggle_verification(
        &mut self,
        item_id: &VerificationItemId,
        is_verified: bool,
    ) -> Result<VerificationItemRecord, SyncError> {
        let now = self.clock.now();
        let patch = VerificationItemPatch {
            is_verified: Some(is_verified),
            verified_at: Some(is_verified.then_some(now)),
            ..VerificationItemPatch::default()
        };
        self.update_verification_item(item_id, patch).await
    }

    /// Records the agent-confirmed value. The modified flag is computed
    /// against the cached item's original value.
    pub async fn update_verified_value(
        &mut self,
        item_id: &VerificationItemId,
        value: impl Into<String>,
    ) -> Result<VerificationItemRecord, SyncError> {
        let value = value.into();
        let item = self
            .state
            .item(item_id)
            .ok_or_else(|| SyncError::UnknownItem(item_id.clone()))?;
        let is_modified = item.modified_for(Some(&value));
        let patch = VerificationItemPatch {
            verified_value: Some(Some(value)),
            is_modified: Some(is_modified),
            ..VerificationItemPatch::default()
        };
        self.update_verification_item(item_id, patch).await
    }

    pub async fn update_verification_notes(
        &mut self,
        item_id: &VerificationItemId,
        notes: impl Into<String>,
    ) -> Result<VerificationItemRecord, SyncError> {
        let patch = VerificationItemPatch {
            notes: Some(Some(notes.into())),
            ..VerificationItemPatch::default()
        };
        self.update_verification_item(item_id, patch).await
    }

    /// Writes a status change through to the store. The transition rule is
    /// checked against the cached session; with nothing cached (for example
    /// after a failed load) the write goes straight to the store.
    pub async fn update_session_status(
        &mut self,
        status: VerificationSessionStatus,
    ) -> Result<VerificationSessionRecord, SyncError> {
        let current = self.state.session().map(|session| session.status);
        if let Some(current) = current {
            if !is_allowed_status_transition(current, status) {
                return Err(SyncError::StatusTransition {
                    from: current,
                    to: status,
                });
            }
        }
        let session_id = self.state.session_id().clone();
        let patch = VerificationSessionPatch::status_change(status, self.clock.now());
        let stored = self
            .store
            .update_verification_session(&session_id, &patch)
            .await?;
        self.apply(SyncInput::SessionWritten { patch });
        info!(session_id = %session_id, from = ?current, to = %status, "verification status changed");
        Ok(stored)
    }

    /// Drops both subscriptions and any pending retry, then mounts
    /// `session_id` from scratch.
    pub async fn switch_session(&mut self, session_id: VerificationSessionId) {
        self.teardown();
        self.apply(SyncInput::Reset { session_id });
        self.open_feeds();
        info!(session_id = %self.state.session_id(), "verification session switched");
        self.fetch_session_data().await;
    }

    pub fn unmount(mut self) {
        self.teardown();
    }

    fn open_feeds(&mut self) {
        let session_id = self.state.session_id().clone();
        self.feeds = Some(SessionFeeds {
            session: self.store.subscribe_session(&session_id),
            items: self.store.subscribe_items(&session_id),
        });
    }

    fn teardown(&mut self) {
        self.retry_at = None;
        if self.feeds.take().is_some() {
            debug!(session_id = %self.state.session_id(), "verification subscriptions released");
        }
    }

    async fn load(
        &self,
        session_id: &VerificationSessionId,
    ) -> Result<(VerificationSessionRecord, Vec<VerificationItemRecord>), StorageError> {
        let session = self.store.get_verification_session(session_id).await?;
        let items = self.store.list_verification_items(session_id).await?;
        Ok((session, items))
    }

    async fn on_feed_error(&mut self, err: FeedError) -> Option<SyncNotice> {
        match err {
            FeedError::Lagged(missed) => {
                warn!(missed, "verification feed lagged; re-reading session");
                self.fetch_session_data().await;
                Some(SyncNotice::Resynced { missed })
            }
            FeedError::Closed => {
                warn!(session_id = %self.state.session_id(), "verification feed closed");
                self.teardown();
                None
            }
        }
    }

    fn apply(&mut self, input: SyncInput) -> SyncEffect {
        let effect = reconcile(&mut self.state, input);
        match effect {
            SyncEffect::ScheduleRetry => {
                let delay = self.config.retry_delay;
                debug!(?delay, "verification retry scheduled");
                self.retry_at = Some(Instant::now() + delay);
            }
            SyncEffect::DiscardedStale => {
                warn!(
                    session_id = %self.state.session_id(),
                    "discarded fetch for a previous session"
                );
            }
            SyncEffect::None | SyncEffect::Ignored => {}
        }
        effect
    }
}

impl<S: VerificationStore + ?Sized, C: Clock> Drop for VerificationSync<S, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use crm_kernel_contracts::access::UserId;
    use crm_kernel_contracts::verification::{SubmissionId, VerificationFieldSeed};
    use crm_storage::store::InMemoryCrmStore;

    /// Wraps the in-memory store to count reads and inject failures.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryCrmStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        item_fetches: AtomicUsize,
    }

    impl FlakyStore {
        fn injected() -> StorageError {
            StorageError::LockPoisoned
        }
    }

    #[async_trait]
    impl VerificationStore for FlakyStore {
        async fn get_verification_session(
            &self,
            session_id: &VerificationSessionId,
        ) -> Result<VerificationSessionRecord, StorageError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Self::injected());
            }
            self.inner.get_verification_session(session_id).await
        }

        async fn list_verification_items(
            &self,
            session_id: &VerificationSessionId,
        ) -> Result<Vec<VerificationItemRecord>, StorageError> {
            self.item_fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.list_verification_items(session_id).await
        }

        async fn update_verification_item(
            &self,
            item_id: &VerificationItemId,
            patch: &VerificationItemPatch,
        ) -> Result<VerificationItemRecord, StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::injected());
            }
            self.inner.update_verification_item(item_id, patch).await
        }

        async fn update_verification_session(
            &self,
            session_id: &VerificationSessionId,
            patch: &VerificationSessionPatch,
        ) -> Result<VerificationSessionRecord, StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::injected());
            }
            self.inner.update_verification_session(session_id, patch).await
        }

        fn subscribe_session(
            &self,
            session_id: &VerificationSessionId,
        ) -> ChangeSubscription<VerificationSessionRecord> {
            self.inner.subscribe_session(session_id)
        }

        fn subscribe_items(
            &self,
            session_id: &VerificationSessionId,
        ) -> ChangeSubscription<VerificationItemRecord> {
            self.inner.subscribe_items(session_id)
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn start(store: &FlakyStore, fields: Vec<VerificationFieldSeed>) -> VerificationSessionId {
        let (session, _) = store
            .inner
            .start_verification_session(
                SubmissionId::new("sub_1").unwrap(),
                Some(UserId::new("buffer_1").unwrap()),
                fields,
                t0(),
            )
            .unwrap();
        session.id
    }

    fn seeds() -> Vec<VerificationFieldSeed> {
        vec![
            VerificationFieldSeed::new("customer_full_name", Some("Dana Reyes")),
            VerificationFieldSeed::new("date_of_birth", Some("1961-04-02")),
        ]
    }

    async fn mounted(
        fields: Vec<VerificationFieldSeed>,
    ) -> (
        Arc<FlakyStore>,
        VerificationSync<FlakyStore, Arc<ManualClock>>,
        Arc<ManualClock>,
    ) {
        let store = Arc::new(FlakyStore::default());
        let session_id = start(&store, fields);
        let clock = Arc::new(ManualClock::new(t0()));
        let sync = VerificationSync::mount(
            store.clone(),
            clock.clone(),
            VerificationSyncConfig::mvp_v1(),
            session_id,
        )
        .await;
        (store, sync, clock)
    }

    async fn assert_quiet(sync: &mut VerificationSync<FlakyStore, Arc<ManualClock>>) {
        let waited =
            tokio::time::timeout(Duration::from_secs(60), sync.next_event()).await;
        assert!(waited.is_err(), "expected no further sync activity");
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_01_mount_loads_session_and_ordered_items() {
        let (store, sync, _clock) = mounted(seeds()).await;
        assert_eq!(sync.phase(), SyncPhase::Ready);
        assert!(!sync.is_loading());
        assert!(sync.is_mounted());
        assert_eq!(
            sync.session().unwrap().status,
            VerificationSessionStatus::Pending
        );
        let names: Vec<&str> = sync.items().iter().map(|i| i.field_name.as_str()).collect();
        assert_eq!(names, vec!["customer_full_name", "date_of_birth"]);
        assert!(!sync.retry_pending());
        assert_eq!(store.inner.session_subscriber_count(), 1);
        assert_eq!(store.inner.item_subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_02_empty_load_retries_exactly_once() {
        let (store, mut sync, _clock) = mounted(Vec::new()).await;
        assert_eq!(sync.phase(), SyncPhase::RetryPending);
        assert!(sync.retry_pending());
        assert_eq!(store.item_fetches.load(Ordering::SeqCst), 1);

        let before = Instant::now();
        assert_eq!(sync.next_event().await, Some(SyncNotice::Retried));
        assert!(Instant::now() - before >= Duration::from_millis(1_000));
        assert_eq!(store.item_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(sync.phase(), SyncPhase::Ready);
        assert!(sync.items().is_empty());

        assert_quiet(&mut sync).await;
        assert_eq!(store.item_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_03_retry_picks_up_items_created_late() {
        let store = Arc::new(FlakyStore::default());
        let session_id = start(&store, Vec::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let mut sync = VerificationSync::mount(
            store.clone(),
            clock,
            VerificationSyncConfig {
                retry_delay: Duration::from_millis(250),
            },
            session_id.clone(),
        )
        .await;
        assert!(sync.items().is_empty());

        store
            .inner
            .insert_verification_item(
                &session_id,
                VerificationFieldSeed::new("carrier", Some("Acme Life")),
                t0(),
            )
            .unwrap();
        assert_eq!(
            sync.next_event().await,
            Some(SyncNotice::ItemChanged(ChangeKind::Insert))
        );
        assert_eq!(sync.items().len(), 1);

        assert_eq!(sync.next_event().await, Some(SyncNotice::Retried));
        assert_eq!(sync.items().len(), 1);
        assert_eq!(sync.items()[0].field_name, "carrier");
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_04_toggle_stamps_and_clears_verified_at() {
        let (store, mut sync, clock) = mounted(seeds()).await;
        let item_id = sync.items()[0].id.clone();

        clock.advance(chrono::Duration::seconds(30));
        let stored = sync.toggle_verification(&item_id, true).await.unwrap();
        let on_at = t0() + chrono::Duration::seconds(30);
        assert!(stored.is_verified);
        assert_eq!(stored.verified_at, Some(on_at));
        assert_eq!(stored.updated_at, on_at);
        assert_eq!(sync.state().item(&item_id), Some(&stored));
        assert_eq!(sync.progress().verified, 1);

        let stored = sync.toggle_verification(&item_id, false).await.unwrap();
        assert!(!stored.is_verified);
        assert_eq!(stored.verified_at, None);
        assert_eq!(sync.state().item(&item_id).unwrap().verified_at, None);

        // Echoes of our own writes leave the cache as written.
        assert_eq!(sync.drain_pending().await, 2);
        let items = store.inner.list_verification_items(sync.session_id()).await.unwrap();
        assert_eq!(sync.items(), items.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_05_verified_value_sets_modified_by_exact_comparison() {
        let (_store, mut sync, _clock) = mounted(seeds()).await;
        let name_id = sync.items()[0].id.clone();

        let stored = sync
            .update_verified_value(&name_id, "Dana M. Reyes")
            .await
            .unwrap();
        assert_eq!(stored.verified_value.as_deref(), Some("Dana M. Reyes"));
        assert!(stored.is_modified);

        let stored = sync
            .update_verified_value(&name_id, "Dana Reyes")
            .await
            .unwrap();
        assert!(!stored.is_modified);

        let stored = sync
            .update_verified_value(&name_id, "dana reyes")
            .await
            .unwrap();
        assert!(stored.is_modified);
        assert_eq!(sync.progress().modified, 1);

        let unknown = VerificationItemId::new("missing").unwrap();
        let err = sync.update_verified_value(&unknown, "x").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownItem(id) if id == unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_06_notes_write_through() {
        let (_store, mut sync, _clock) = mounted(seeds()).await;
        let item_id = sync.items()[1].id.clone();
        let stored = sync
            .update_verification_notes(&item_id, "customer confirmed by phone")
            .await
            .unwrap();
        assert_eq!(stored.notes.as_deref(), Some("customer confirmed by phone"));
        assert_eq!(
            sync.state().item(&item_id).unwrap().notes.as_deref(),
            Some("customer confirmed by phone")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_07_status_changes_stamp_timestamps_and_terminal_is_final() {
        let (_store, mut sync, clock) = mounted(seeds()).await;

        let stored = sync
            .update_session_status(VerificationSessionStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(stored.completed_at, None);

        clock.advance(chrono::Duration::minutes(10));
        let stored = sync
            .update_session_status(VerificationSessionStatus::Transferred)
            .await
            .unwrap();
        let at = t0() + chrono::Duration::minutes(10);
        assert_eq!(stored.status, VerificationSessionStatus::Transferred);
        assert_eq!(stored.completed_at, Some(at));
        assert_eq!(stored.transferred_at, Some(at));
        assert_eq!(sync.session(), Some(&stored));

        let err = sync
            .update_session_status(VerificationSessionStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::StatusTransition {
                from: VerificationSessionStatus::Transferred,
                to: VerificationSessionStatus::Pending,
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_08_failed_write_leaves_cache_untouched() {
        let (store, mut sync, _clock) = mounted(seeds()).await;
        let item_id = sync.items()[0].id.clone();
        let before = sync.state().clone();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = sync.toggle_verification(&item_id, true).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(StorageError::LockPoisoned)));
        let err = sync
            .update_session_status(VerificationSessionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert_eq!(sync.state(), &before);
        assert_eq!(sync.drain_pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_09_fetch_failure_surfaces_as_error_phase() {
        let (store, mut sync, _clock) = mounted(seeds()).await;
        store.fail_reads.store(true, Ordering::SeqCst);
        sync.fetch_session_data().await;
        assert_eq!(sync.phase(), SyncPhase::Error);
        assert!(sync
            .error()
            .unwrap()
            .starts_with("failed to load verification session"));
        assert_eq!(sync.items().len(), 2);

        store.fail_reads.store(false, Ordering::SeqCst);
        sync.fetch_session_data().await;
        assert_eq!(sync.phase(), SyncPhase::Ready);
        assert_eq!(sync.error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_10_rows_pushed_by_other_writers_replace_cache() {
        let (store, mut sync, _clock) = mounted(seeds()).await;
        let item_id = sync.items()[0].id.clone();

        let patch = VerificationItemPatch {
            is_verified: Some(true),
            verified_at: Some(Some(t0())),
            ..VerificationItemPatch::default()
        };
        let written = store
            .inner
            .update_verification_item_row(&item_id, &patch)
            .unwrap();
        assert_eq!(
            sync.next_event().await,
            Some(SyncNotice::ItemChanged(ChangeKind::Update))
        );
        assert_eq!(sync.state().item(&item_id), Some(&written));

        store.inner.delete_verification_item_row(&item_id).unwrap();
        assert_eq!(
            sync.next_event().await,
            Some(SyncNotice::ItemChanged(ChangeKind::Delete))
        );
        assert_eq!(sync.items().len(), 1);
        assert!(sync.state().item(&item_id).is_none());

        let patch = VerificationSessionPatch::status_change(
            VerificationSessionStatus::ReadyForTransfer,
            t0(),
        );
        store
            .inner
            .update_verification_session_row(sync.session_id(), &patch)
            .unwrap();
        assert_eq!(
            sync.next_event().await,
            Some(SyncNotice::SessionChanged(ChangeKind::Update))
        );
        assert_eq!(
            sync.session().unwrap().status,
            VerificationSessionStatus::ReadyForTransfer
        );
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_11_other_sessions_do_not_reach_the_cache() {
        let (store, mut sync, _clock) = mounted(seeds()).await;
        let other = start(&store, seeds());
        store
            .inner
            .insert_verification_item(&other, VerificationFieldSeed::new("ssn_last4", None), t0())
            .unwrap();
        assert_quiet(&mut sync).await;
        assert_eq!(sync.items().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_12_switch_and_unmount_release_subscriptions() {
        let (store, mut sync, _clock) = mounted(seeds()).await;
        let next = start(
            &store,
            vec![VerificationFieldSeed::new("carrier", Some("Acme Life"))],
        );

        sync.switch_session(next.clone()).await;
        assert!(sync.is_mounted());
        assert_eq!(sync.session_id(), &next);
        assert_eq!(sync.items().len(), 1);
        assert_eq!(store.inner.session_subscriber_count(), 1);
        assert_eq!(store.inner.item_subscriber_count(), 1);

        sync.unmount();
        assert_eq!(store.inner.session_subscriber_count(), 0);
        assert_eq!(store.inner.item_subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_13_switch_rearms_the_single_retry() {
        let (store, mut sync, _clock) = mounted(Vec::new()).await;
        assert_eq!(sync.next_event().await, Some(SyncNotice::Retried));
        assert!(sync.state().retry_used());

        let next = start(&store, Vec::new());
        sync.switch_session(next).await;
        assert_eq!(sync.phase(), SyncPhase::RetryPending);
        assert_eq!(sync.next_event().await, Some(SyncNotice::Retried));
        assert_eq!(sync.phase(), SyncPhase::Ready);
        assert_quiet(&mut sync).await;
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_14_dropping_the_sync_unsubscribes() {
        let (store, sync, _clock) = mounted(seeds()).await;
        assert_eq!(store.inner.item_subscriber_count(), 1);
        drop(sync);
        assert_eq!(store.inner.session_subscriber_count(), 0);
        assert_eq!(store.inner.item_subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_15_lagged_feed_rereads_the_session() {
        let (store, mut sync, _clock) = mounted(seeds()).await;
        let item_id = sync.items()[0].id.clone();
        let writes = crm_storage::feed::FEED_CAPACITY + 44;
        for n in 0..writes {
            let patch = VerificationItemPatch {
                is_verified: Some(n % 2 == 0),
                ..VerificationItemPatch::default()
            };
            store
                .inner
                .update_verification_item_row(&item_id, &patch)
                .unwrap();
        }
        let fetches = store.item_fetches.load(Ordering::SeqCst);

        let notice = sync.next_event().await;
        assert!(matches!(notice, Some(SyncNotice::Resynced { missed }) if missed > 0));
        assert_eq!(store.item_fetches.load(Ordering::SeqCst), fetches + 1);
        let stored = store.inner.list_verification_items(sync.session_id()).await.unwrap();
        assert_eq!(sync.items(), stored.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn at_vsync_os_16_status_write_goes_through_after_failed_load() {
        let store = Arc::new(FlakyStore::default());
        let session_id = start(&store, seeds());
        store.fail_reads.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new(t0()));
        let mut sync = VerificationSync::mount(
            store.clone(),
            clock.clone(),
            VerificationSyncConfig::mvp_v1(),
            session_id.clone(),
        )
        .await;
        assert_eq!(sync.phase(), SyncPhase::Error);
        assert!(sync.session().is_none());

        clock.advance(chrono::Duration::minutes(3));
        let stored = sync
            .update_session_status(VerificationSessionStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(stored.status, VerificationSessionStatus::InProgress);
        assert_eq!(stored.updated_at, t0() + chrono::Duration::minutes(3));
        let row = store.inner.verification_session_row(&session_id).unwrap();
        assert_eq!(row.status, VerificationSessionStatus::InProgress);

        store.fail_reads.store(false, Ordering::SeqCst);
        sync.fetch_session_data().await;
        assert_eq!(
            sync.session().map(|s| s.status),
            Some(VerificationSessionStatus::InProgress)
        );
    }
}
