//! Durability against a SQLite file
//!
//! The database is closed and reopened between "processes", so everything
//! the second runtime sees came off disk.

mod common;

use std::sync::Arc;

use common::{charge, key_for, Harness};
use oncepay_durable::charge::{ChargeOutcome, ChargeWorkflow};
use oncepay_durable::ledger::{IdempotencyLedger, RecordOutcome};
use oncepay_durable::{SqliteDurableStore, WorkflowStatus};
use serde_json::json;

#[test_log::test(tokio::test)]
async fn test_sleep_survives_database_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oncepay.db");

    let store = Arc::new(SqliteDurableStore::open(&path).await.unwrap());
    let mut h = Harness::with_store(store.clone());
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "99.99", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);

    h.advance(4);
    drop(runtime);
    store.close().await;
    drop(store);

    h.advance(2);
    h.store = Arc::new(SqliteDurableStore::open(&path).await.unwrap());
    let runtime = h.restart().await;
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);

    h.advance(5);
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);

    let key = key_for("c1", "99.99", id);
    assert_eq!(h.processor.calls(&key), 1);
    let records = runtime.ledger().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, key);

    let outcome: ChargeOutcome =
        serde_json::from_value(runtime.get_result(id).await.unwrap()).unwrap();
    assert_eq!(outcome.idempotency_key, key);
    assert_eq!(h.count_events(id, "timer_fired").await, 1);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_records_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteDurableStore::open(dir.path().join("ledger.db"))
            .await
            .unwrap(),
    );
    let h = Harness::with_store(store);
    let ledger = IdempotencyLedger::new(h.store.clone(), Arc::new(h.clock.clone()));
    let key = key_for("c1", "10.00", uuid::Uuid::now_v7());

    let attempts = (0..16).map(|i| {
        let ledger = ledger.clone();
        let key = key.clone();
        tokio::spawn(async move { ledger.record(&key, json!({ "writer": i })).await })
    });
    let outcomes: Vec<RecordOutcome> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let inserted: Vec<_> = outcomes.iter().filter(|o| o.is_inserted()).collect();
    assert_eq!(inserted.len(), 1);

    // Every caller sees the winner's payload.
    let winner = inserted[0].record().result.clone();
    assert!(outcomes.iter().all(|o| o.record().result == winner));
    assert_eq!(ledger.list().await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_archive_removes_finished_instances_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteDurableStore::open(dir.path().join("archive.db"))
            .await
            .unwrap(),
    );
    let h = Harness::with_store(store);
    let runtime = h.runtime();
    let done = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "1.00", 0), None)
        .await
        .unwrap();
    let sleeping = runtime
        .start_workflow::<ChargeWorkflow>(charge("c2", "1.00", 100_000), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;
    assert_eq!(h.status(done).await, WorkflowStatus::Completed);

    h.advance(8 * 24 * 60 * 60);
    let archived = runtime
        .archive_completed(runtime.config().retention)
        .await
        .unwrap();
    assert_eq!(archived, 1);

    assert!(h.store.get_workflow_info(done).await.is_err());
    assert!(h.store.load_events(done).await.is_err());
    assert_eq!(h.status(sleeping).await, WorkflowStatus::AwaitingTimer);
    assert_eq!(runtime.ledger().list().await.unwrap().len(), 1);
}
