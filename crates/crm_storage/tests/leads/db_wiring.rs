#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use crm_kernel_contracts::access::UserId;
use crm_kernel_contracts::lead::{CallCenterId, LeadInput, LeadPatch, LeadQuery};
use crm_storage::repo::LeadStore;
use crm_storage::store::{InMemoryCrmStore, StorageError};

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn center(id: &str) -> CallCenterId {
    CallCenterId::new(id).unwrap()
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn input(name: &str, agent: Option<&str>, center_id: Option<&str>) -> LeadInput {
    LeadInput {
        customer_name: name.to_string(),
        phone_number: None,
        pipeline_stage: None,
        assigned_agent_id: agent.map(user),
        call_center_id: center_id.map(center),
    }
}

#[tokio::test]
async fn at_leads_db_01_insert_assigns_id_default_stage_and_timestamps() {
    let store = InMemoryCrmStore::new_in_memory();
    let lead = store
        .insert_lead(input("Dana Reyes", Some("agent_1"), Some("center_a")), t0())
        .await
        .unwrap();
    assert_eq!(lead.pipeline_stage, "new");
    assert_eq!(lead.created_at, t0());
    assert_eq!(lead.updated_at, t0());
    assert_eq!(store.get_lead(&lead.id).await.unwrap(), lead);
}

#[tokio::test]
async fn at_leads_db_02_list_applies_query_scope_in_creation_order() {
    let store = InMemoryCrmStore::new_in_memory();
    let a = store
        .insert_lead(input("A", Some("agent_1"), Some("center_a")), t0())
        .await
        .unwrap();
    let b = store
        .insert_lead(
            input("B", Some("agent_2"), Some("center_a")),
            t0() + Duration::seconds(1),
        )
        .await
        .unwrap();
    let c = store
        .insert_lead(
            input("C", Some("agent_1"), Some("center_b")),
            t0() + Duration::seconds(2),
        )
        .await
        .unwrap();

    let all = store.list_leads(&LeadQuery::All).await.unwrap();
    assert_eq!(all, vec![a.clone(), b.clone(), c.clone()]);

    let mine = store
        .list_leads(&LeadQuery::AssignedAgent(user("agent_1")))
        .await
        .unwrap();
    assert_eq!(mine, vec![a.clone(), c]);

    let center_a = store
        .list_leads(&LeadQuery::CallCenter(center("center_a")))
        .await
        .unwrap();
    assert_eq!(center_a, vec![a, b]);
}

#[tokio::test]
async fn at_leads_db_03_update_and_delete_report_missing_rows() {
    let store = InMemoryCrmStore::new_in_memory();
    let lead = store
        .insert_lead(input("Dana", None, None), t0())
        .await
        .unwrap();

    let updated = store
        .update_lead(
            &lead.id,
            &LeadPatch {
                pipeline_stage: Some("quoted".to_string()),
                updated_at: Some(t0() + Duration::seconds(5)),
                ..LeadPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.pipeline_stage, "quoted");

    let deleted = store.delete_lead(&lead.id).await.unwrap();
    assert_eq!(deleted.id, lead.id);
    assert!(matches!(
        store.get_lead(&lead.id).await,
        Err(StorageError::NotFound { table: "leads", .. })
    ));
    assert!(matches!(
        store.delete_lead(&lead.id).await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn at_leads_db_04_contract_violation_is_rejected_before_write() {
    let store = InMemoryCrmStore::new_in_memory();
    let err = store
        .insert_lead(input("   ", None, None), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert!(store.list_leads(&LeadQuery::All).await.unwrap().is_empty());
}
