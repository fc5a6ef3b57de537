//! Replay determinism

mod common;

use common::{charge, Harness};
use oncepay_durable::charge::ChargeWorkflow;
use oncepay_durable::engine::{ExecutorError, ReplayError};
use oncepay_durable::{ActivityError, HistoryEvent, WorkflowAction, WorkflowStatus};

#[test_log::test(tokio::test)]
async fn test_replaying_twice_yields_identical_decisions() {
    let h = Harness::in_memory();
    h.processor
        .fail_next(1, ActivityError::retryable("gateway timeout"));
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "99.99", 10), None)
        .await
        .unwrap();
    assert_eq!(h.drive_to_terminal(&runtime, id).await, WorkflowStatus::Completed);

    let executor = runtime.dispatcher().executor();
    let first = executor.replay_decisions(id).await.unwrap();
    let second = executor.replay_decisions(id).await.unwrap();
    assert_eq!(first, second);

    // A different process replays to the same decisions.
    drop(runtime);
    let runtime = h.runtime();
    let third = runtime
        .dispatcher()
        .executor()
        .replay_decisions(id)
        .await
        .unwrap();
    assert_eq!(first, third);

    let kinds: Vec<_> = first.iter().map(WorkflowAction::kind).collect();
    assert_eq!(kinds, vec!["sleep", "call_activity", "complete"]);
}

#[test_log::test(tokio::test)]
async fn test_replay_is_read_only() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "5.00", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;
    let before = h.event_types(id).await;

    for _ in 0..3 {
        runtime
            .dispatcher()
            .executor()
            .replay_decisions(id)
            .await
            .unwrap();
    }
    assert_eq!(h.event_types(id).await, before);
}

#[test_log::test(tokio::test)]
async fn test_diverging_history_is_rejected() {
    let h = Harness::in_memory();
    let runtime = h.runtime();
    let id = runtime
        .start_workflow::<ChargeWorkflow>(charge("c1", "5.00", 10), None)
        .await
        .unwrap();
    runtime.run_until_idle().await;

    // A history recorded by some other body: it completed without sleeping.
    let other = uuid::Uuid::now_v7();
    let input = serde_json::to_value(charge("c1", "5.00", 10)).unwrap();
    h.store
        .create_workflow(other, "charge", input.clone(), chrono::Utc::now())
        .await
        .unwrap();
    h.store
        .append_events(
            other,
            0,
            vec![
                HistoryEvent::WorkflowStarted { input },
                HistoryEvent::WorkflowCompleted {
                    result: serde_json::json!("done"),
                },
            ],
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    let err = runtime
        .dispatcher()
        .executor()
        .replay_decisions(other)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::NonDeterminism(ReplayError::Mismatch { position: 1, .. })
    ));
    assert_eq!(h.status(id).await, WorkflowStatus::AwaitingTimer);
}
