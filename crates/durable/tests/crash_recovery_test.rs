//! Crash and restart scenarios
//!
//! Each test drops a runtime mid-flight and resumes the instance from the
//! store with a new one.

mod common;

use std::time::Duration;

use common::{charge, key_for, Harness};
use oncepay_durable::charge::{ChargeOutcome, ChargeWorkflow};
use oncepay_durable::ledger::RecordStatus;
use oncepay_durable::WorkflowStatus;

#[test_log::test(tokio::test)]
async fn test_crash_before_sleep_is_scheduled() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "10.00", 10), None)
        .await
        .unwrap();
    // The Start item never runs.
    drop(runtime);
    assert_eq!(h.event_types(id).await, vec!["workflow_started"]);

    let runtime = h.restart().await;
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);

    h.advance(10);
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.count_events(id, "timer_fired").await, 1);
    assert_eq!(h.processor.calls(&key_for("c1", "10.00", id)), 1);
}

#[test_log::test(tokio::test)]
async fn test_crash_during_sleep_keeps_deadline() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "10.00", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;
    drop(runtime);

    // Down for most of the sleep; not yet due on restart.
    h.advance(9);
    let runtime = h.restart().await;
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);
    assert_eq!(h.processor.total_calls(), 0);

    h.advance(1);
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);

    let info = h.store.get_workflow_info(id).await.unwrap();
    let elapsed = info.completed_at.unwrap() - info.created_at;
    assert!(elapsed >= chrono::Duration::seconds(10));
}

#[test_log::test(tokio::test)]
async fn test_crash_after_deadline_while_down() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "10.00", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;
    drop(runtime);

    // Down well past the deadline: the overdue timer fires on the first sweep.
    h.advance(60);
    let runtime = h.restart().await;
    runtime.run_until_idle().await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.count_events(id, "timer_fired").await, 1);
}

#[test_log::test(tokio::test)]
async fn test_crash_between_timer_claim_and_resume() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "10.00", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;

    // The sweep marks the timer fired, then the process dies before the
    // TimerFired item is processed.
    h.advance(10);
    assert_eq!(runtime.dispatcher().sweep_timers().await.unwrap(), 1);
    drop(runtime);

    let runtime = h.restart().await;
    runtime.run_until_idle().await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.count_events(id, "timer_fired").await, 1);
    assert_eq!(h.processor.calls(&key_for("c1", "10.00", id)), 1);
}

#[test_log::test(tokio::test)]
async fn test_charge_scenario_crash_at_four_restart_at_six() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "99.99", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;

    h.advance(4);
    drop(runtime);

    h.advance(2);
    let runtime = h.restart().await;
    runtime.run_until_idle().await;
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);
    assert_eq!(h.processor.total_calls(), 0);

    h.advance(5);
    runtime.run_until_idle().await;

    let key = key_for("c1", "99.99", id);
    assert_eq!(key.to_string(), format!("c1:99.99:{id}"));
    assert_eq!(h.processor.calls(&key), 1);

    let records = runtime.ledger().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, key);
    assert_eq!(records[0].status, RecordStatus::Completed);

    let result = runtime
        .get_result_timeout(id, Duration::from_secs(1))
        .await
        .unwrap();
    let outcome: ChargeOutcome = serde_json::from_value(result).unwrap();
    assert_eq!(outcome.message, "Charged c1 $99.99 successfully");
    assert_eq!(outcome.idempotency_key, key);
    assert_eq!(h.count_events(id, "timer_fired").await, 1);
}

#[test_log::test(tokio::test)]
async fn test_crash_after_effect_before_ledger_commit() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "25.00", 1), None)
        .await
        .unwrap();
    let key = key_for("c1", "25.00", id);
    runtime.run_until_idle().await;

    // The processor takes the money and the worker dies before recording it.
    h.processor.stall_next();
    h.advance(1);
    runtime.dispatcher().sweep_timers().await.unwrap();
    runtime.dispatcher().tick().await;
    for _ in 0..200 {
        if h.processor.calls(&key) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.processor.calls(&key), 1);
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingActivity);
    drop(runtime);

    let runtime = h.restart().await;
    runtime.run_until_idle().await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    // At-least-once residual: the effect ran twice, the ledger holds one record.
    assert_eq!(h.processor.calls(&key), 2);
    assert_eq!(runtime.ledger().list().await.unwrap().len(), 1);
    assert_eq!(h.count_events(id, "activity_completed").await, 1);
}

#[test_log::test(tokio::test)]
async fn test_repeated_restarts_do_not_recharge() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c2", "5.00", 3), None)
        .await
        .unwrap();
    drop(runtime);

    for _ in 0..5 {
        let runtime = h.restart().await;
        runtime.run_until_idle().await;
        h.advance(1);
    }
    let runtime = h.restart().await;
    runtime.run_until_idle().await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.processor.total_calls(), 1);
    assert_eq!(h.count_events(id, "timer_fired").await, 1);
    assert_eq!(h.count_events(id, "workflow_completed").await, 1);
}
