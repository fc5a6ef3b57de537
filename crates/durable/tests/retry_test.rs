//! Activity retries, backoff timers and exhaustion

mod common;

use common::{charge, key_for, Harness};
use oncepay_durable::charge::{ChargeOutcome, ChargeReceipt, ChargeWorkflow};
use oncepay_durable::{ActivityError, HistoryEvent, WorkflowStatus};

#[test_log::test(tokio::test)]
async fn test_transient_failures_then_success_record_once() {
    // max_attempts is 3, so up to two failures still succeed.
    for failures in 0..3usize {
        let h = Harness::in_memory();
        h.processor
            .fail_next(failures, ActivityError::retryable("gateway timeout"));
        let runtime = h.runtime();
        let id = runtime
            .start_workflow::<ChargeWorkflow>(charge("c1", "42.00", 0), None)
            .await
            .unwrap();

        assert_eq!(h.drive_to_terminal(&runtime, id).await, WorkflowStatus::Completed);

        let key = key_for("c1", "42.00", id);
        assert_eq!(h.processor.calls(&key) as usize, failures + 1);

        let records = runtime.ledger().list().await.unwrap();
        assert_eq!(records.len(), 1, "failures = {failures}");

        // The workflow saw the result of the one successful attempt.
        let receipt: ChargeReceipt = serde_json::from_value(records[0].result.clone()).unwrap();
        let outcome: ChargeOutcome =
            serde_json::from_value(runtime.get_result(id).await.unwrap()).unwrap();
        assert_eq!(outcome.charge_id, receipt.charge_id);
        assert_eq!(h.count_events(id, "activity_failed").await, failures);
    }
}

#[test_log::test(tokio::test)]
async fn test_backoff_waits_on_durable_timer() {
    let h = Harness::in_memory();
    h.processor
        .fail_next(2, ActivityError::retryable("connection reset"));
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "1.00", 0), None)
        .await
        .unwrap();
    let key = key_for("c1", "1.00", id);

    runtime.run_until_idle().await;
    assert_eq!(h.processor.calls(&key), 1);
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);

    // First backoff is 5s.
    h.advance(4);
    runtime.run_until_idle().await;
    assert_eq!(h.processor.calls(&key), 1);
    h.advance(1);
    runtime.run_until_idle().await;
    assert_eq!(h.processor.calls(&key), 2);

    // Second backoff doubles to 10s.
    h.advance(9);
    runtime.run_until_idle().await;
    assert_eq!(h.processor.calls(&key), 2);
    h.advance(1);
    runtime.run_until_idle().await;
    assert_eq!(h.processor.calls(&key), 3);
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);

    // Failure and its retry timer were appended together.
    let events = h.store.load_events(id).await.unwrap();
    for (position, event) in &events {
        if let HistoryEvent::ActivityFailed { will_retry: true, .. } = event {
            let next = &events[*position as usize + 1].1;
            assert_eq!(next.event_type(), "timer_scheduled");
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_exhausted_attempts_fail_workflow() {
    let h = Harness::in_memory();
    h.processor
        .fail_next(5, ActivityError::retryable("processor down"));
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "7.50", 0), None)
        .await
        .unwrap();

    assert_eq!(h.drive_to_terminal(&runtime, id).await, WorkflowStatus::Failed);

    let key = key_for("c1", "7.50", id);
    assert_eq!(h.processor.calls(&key), 3);
    assert!(runtime.ledger().list().await.unwrap().is_empty());

    let types = h.event_types(id).await;
    assert_eq!(types.last(), Some(&"workflow_failed"));

    let err = runtime.get_result(id).await.unwrap_err();
    assert!(err.workflow_error().unwrap().message.contains("processor down"));

    // Nothing left to retry.
    h.advance(3600);
    runtime.run_until_idle().await;
    assert_eq!(h.processor.calls(&key), 3);
}

#[test_log::test(tokio::test)]
async fn test_non_retryable_error_fails_immediately() {
    let h = Harness::in_memory();
    h.processor.fail_next(
        1,
        ActivityError::non_retryable("card declined").with_type("declined"),
    );
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "3.00", 0), None)
        .await
        .unwrap();

    assert_eq!(h.drive_to_terminal(&runtime, id).await, WorkflowStatus::Failed);
    assert_eq!(h.processor.total_calls(), 1);
    assert_eq!(h.count_events(id, "timer_scheduled").await, 1);
}

#[test_log::test(tokio::test)]
async fn test_crash_during_backoff_resumes_retry() {
    let h = Harness::in_memory();
    h.processor
        .fail_next(1, ActivityError::retryable("gateway timeout"));
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "9.99", 0), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;
    assert_eq!(h.processor.total_calls(), 1);
    drop(runtime);

    h.advance(5);
    let runtime = h.restart().await;
    runtime.run_until_idle().await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.processor.total_calls(), 2);
    assert_eq!(runtime.ledger().list().await.unwrap().len(), 1);
}
