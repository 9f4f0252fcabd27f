#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use crm_kernel_contracts::access::UserId;
use crm_kernel_contracts::change_feed::ChangeKind;
use crm_kernel_contracts::verification::{
    SubmissionId, VerificationFieldSeed, VerificationItemPatch, VerificationSessionPatch,
    VerificationSessionStatus,
};
use crm_storage::feed::FeedError;
use crm_storage::repo::VerificationStore;
use crm_storage::store::{InMemoryCrmStore, StorageError};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn seeds() -> Vec<VerificationFieldSeed> {
    vec![
        VerificationFieldSeed::new("customer_full_name", Some("Dana Reyes")),
        VerificationFieldSeed::new("date_of_birth", Some("1961-04-02")),
        VerificationFieldSeed::new("beneficiary", None),
    ]
}

fn start(store: &InMemoryCrmStore) -> crm_kernel_contracts::verification::VerificationSessionId {
    let (session, _) = store
        .start_verification_session(
            SubmissionId::new("sub_1").unwrap(),
            Some(UserId::new("buffer_1").unwrap()),
            seeds(),
            t0(),
        )
        .unwrap();
    session.id
}

#[tokio::test]
async fn at_verification_db_01_start_creates_pending_session_and_ordered_items() {
    let store = InMemoryCrmStore::new_in_memory();
    let session_id = start(&store);

    let session = store.get_verification_session(&session_id).await.unwrap();
    assert_eq!(session.status, VerificationSessionStatus::Pending);
    assert_eq!(session.completed_at, None);

    let items = store.list_verification_items(&session_id).await.unwrap();
    let names: Vec<&str> = items.iter().map(|i| i.field_name.as_str()).collect();
    assert_eq!(names, vec!["customer_full_name", "date_of_birth", "beneficiary"]);
    assert!(items.iter().all(|i| !i.is_verified && !i.is_modified));
}

#[tokio::test]
async fn at_verification_db_02_items_are_ordered_by_created_at_across_inserts() {
    let store = InMemoryCrmStore::new_in_memory();
    let session_id = start(&store);
    let late = store
        .insert_verification_item(
            &session_id,
            VerificationFieldSeed::new("carrier", Some("Acme Life")),
            t0() + Duration::seconds(30),
        )
        .unwrap();
    let items = store.list_verification_items(&session_id).await.unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items.last().unwrap().id, late.id);
}

#[tokio::test]
async fn at_verification_db_03_item_for_unknown_session_is_foreign_key_violation() {
    let store = InMemoryCrmStore::new_in_memory();
    let missing = crm_kernel_contracts::verification::VerificationSessionId::new("vs_missing")
        .unwrap();
    let err = store
        .insert_verification_item(&missing, VerificationFieldSeed::new("x", None), t0())
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation { .. }));
}

#[tokio::test]
async fn at_verification_db_04_subscription_sees_only_its_session() {
    let store = InMemoryCrmStore::new_in_memory();
    let session_a = start(&store);
    let session_b = start(&store);

    let mut items_a = store.subscribe_items(&session_a);
    assert_eq!(store.item_subscriber_count(), 1);

    let b_item = store.list_verification_items(&session_b).await.unwrap()[0].clone();
    store
        .update_verification_item(
            &b_item.id,
            &VerificationItemPatch {
                is_verified: Some(true),
                ..VerificationItemPatch::default()
            },
        )
        .await
        .unwrap();
    let a_item = store.list_verification_items(&session_a).await.unwrap()[1].clone();
    store
        .update_verification_item(
            &a_item.id,
            &VerificationItemPatch {
                notes: Some(Some("confirmed by phone".to_string())),
                ..VerificationItemPatch::default()
            },
        )
        .await
        .unwrap();

    let event = items_a.try_recv().unwrap().expect("event for session a");
    assert_eq!(event.kind, ChangeKind::Update);
    assert_eq!(event.new.unwrap().id, a_item.id);
    assert_eq!(items_a.try_recv().unwrap(), None);

    drop(items_a);
    assert_eq!(store.item_subscriber_count(), 0);
}

#[tokio::test]
async fn at_verification_db_05_delete_publishes_old_image() {
    let store = InMemoryCrmStore::new_in_memory();
    let session_id = start(&store);
    let mut feed = store.subscribe_items(&session_id);
    let victim = store.list_verification_items(&session_id).await.unwrap()[0].clone();

    store.delete_verification_item_row(&victim.id).unwrap();

    let event = feed.recv().await.unwrap();
    assert_eq!(event.kind, ChangeKind::Delete);
    assert_eq!(event.old.as_ref().map(|i| &i.id), Some(&victim.id));
    assert!(event.new.is_none());
}

#[tokio::test]
async fn at_verification_db_06_session_update_is_published_and_validated() {
    let store = InMemoryCrmStore::new_in_memory();
    let session_id = start(&store);
    let mut feed = store.subscribe_session(&session_id);

    let now = t0() + Duration::seconds(60);
    let updated = store
        .update_verification_session(
            &session_id,
            &VerificationSessionPatch::status_change(VerificationSessionStatus::Transferred, now),
        )
        .await
        .unwrap();
    assert_eq!(updated.transferred_at, Some(now));
    assert_eq!(updated.completed_at, Some(now));

    let event = feed.recv().await.unwrap();
    assert_eq!(event.kind, ChangeKind::Update);
    assert_eq!(
        event.old.unwrap().status,
        VerificationSessionStatus::Pending
    );

    // transferred_at on a non-transferred session violates the record contract.
    let bad = VerificationSessionPatch {
        status: Some(VerificationSessionStatus::InProgress),
        ..VerificationSessionPatch::default()
    };
    let err = store
        .update_verification_session(&session_id, &bad)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
}

#[tokio::test]
async fn at_verification_db_07_lagging_subscriber_is_told_to_refetch() {
    let store = InMemoryCrmStore::new_in_memory();
    let session_id = start(&store);
    let mut feed = store.subscribe_items(&session_id);
    let item = store.list_verification_items(&session_id).await.unwrap()[0].clone();

    for n in 0..(crm_storage::feed::FEED_CAPACITY + 8) {
        store
            .update_verification_item(
                &item.id,
                &VerificationItemPatch {
                    notes: Some(Some(format!("note {n}"))),
                    ..VerificationItemPatch::default()
                },
            )
            .await
            .unwrap();
    }

    assert!(matches!(feed.try_recv(), Err(FeedError::Lagged(_))));
}
