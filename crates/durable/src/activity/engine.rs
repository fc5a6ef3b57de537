//! Activity execution engine
//!
//! Runs a single attempt of an activity chain. The engine brackets the
//! attempt with the idempotency ledger:
//!
//! ```text
//! lookup(key) ──found──▶ Completed { deduplicated: true }
//!      │
//!    absent
//!      ▼
//! execute (start-to-close timeout)
//!      │ ok                         │ err
//!      ▼                            ▼
//! record(key, result)        RetryPolicy::decide ──▶ Retry | Failed
//!      │
//!      ├─ Inserted      ──▶ Completed { deduplicated: false }
//!      └─ AlreadyExists ──▶ Completed { existing result, deduplicated: true }
//! ```
//!
//! An unavailable ledger, at lookup or at record, yields `Interrupted`: the
//! effect may or may not have happened, so the same attempt runs again and
//! no attempt is spent.
//!
//! Waiting out the backoff is not the engine's job: the executor persists a
//! durable timer for it, so a backoff survives a crash and holds no task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::definition::error_types;
use super::{ActivityContext, ActivityError, ActivityRegistry, CancellationHandle};
use crate::ledger::{IdempotencyKey, IdempotencyLedger, LedgerError, RecordOutcome};
use crate::reliability::{enforce_start_to_close, RetryDecision};
use crate::workflow::ActivityOptions;

/// One attempt of a scheduled activity
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityInvocation {
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub idempotency_key: IdempotencyKey,
    pub options: ActivityOptions,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Result of one attempt, as seen by the executor
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    /// The effect is recorded in the ledger
    Completed {
        result: Value,
        /// The result came from an earlier record rather than this attempt
        deduplicated: bool,
    },

    /// Transient failure; run `next_attempt` after `delay`
    Retry {
        error: ActivityError,
        next_attempt: u32,
        delay: Duration,
    },

    /// Permanent failure, or attempts exhausted
    Failed(ActivityError),

    /// Storage was unavailable around the attempt; run the same attempt again
    Interrupted { error: ActivityError },
}

impl ActivityOutcome {
    /// Whether the chain is finished
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Retry { .. } | Self::Interrupted { .. })
    }
}

/// Executes activity attempts against the registry and the ledger
#[derive(Clone)]
pub struct ActivityEngine {
    registry: Arc<ActivityRegistry>,
    ledger: IdempotencyLedger,
    record_attempts: u32,
    record_backoff: Duration,
}

impl ActivityEngine {
    /// Create an engine; ledger writes are retried 3 times, 50ms apart
    pub fn new(registry: Arc<ActivityRegistry>, ledger: IdempotencyLedger) -> Self {
        Self {
            registry,
            ledger,
            record_attempts: 3,
            record_backoff: Duration::from_millis(50),
        }
    }

    /// Bound the in-attempt retries of an unavailable ledger
    pub fn with_record_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.record_attempts = attempts.max(1);
        self.record_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Run one attempt of `invocation`
    ///
    /// Never returns an error: every failure is folded into the outcome so the
    /// executor can persist it. Storage unavailability never counts against
    /// the retry policy.
    pub async fn execute(&self, invocation: &ActivityInvocation) -> ActivityOutcome {
        self.execute_cancellable(invocation, &CancellationHandle::new())
            .await
    }

    /// [`execute`](Self::execute) with the attempt's context tied to `cancellation`
    #[instrument(
        skip(self, invocation, cancellation),
        fields(
            workflow_id = %invocation.workflow_id,
            activity_id = %invocation.activity_id,
            attempt = invocation.attempt,
        )
    )]
    pub async fn execute_cancellable(
        &self,
        invocation: &ActivityInvocation,
        cancellation: &CancellationHandle,
    ) -> ActivityOutcome {
        let key = &invocation.idempotency_key;

        match self.ledger.lookup(key).await {
            Ok(Some(record)) => {
                info!(key = %key, "effect already recorded, skipping activity");
                return ActivityOutcome::Completed {
                    result: record.result,
                    deduplicated: true,
                };
            }
            Ok(None) => {}
            Err(err) => return self.failed(invocation, ledger_failure(err)),
        }

        let Some(activity) = self.registry.get(&invocation.activity_type) else {
            let error = ActivityError::non_retryable(format!(
                "unknown activity type: {}",
                invocation.activity_type
            ))
            .with_type(error_types::UNKNOWN_ACTIVITY);
            return self.failed(invocation, error);
        };

        let ctx = ActivityContext::new(
            invocation.workflow_id,
            invocation.activity_id.clone(),
            key.clone(),
            invocation.attempt,
            invocation.options.retry_policy.max_attempts,
        )
        .with_cancellation(cancellation);

        debug!(activity_type = %invocation.activity_type, "executing activity");
        let result = match enforce_start_to_close(
            invocation.options.start_to_close_timeout,
            activity.execute_json(&ctx, invocation.input.clone()),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => return self.failed(invocation, error),
            Err(timeout) => return self.failed(invocation, timeout.into()),
        };

        match self.record(key, result).await {
            Ok(RecordOutcome::Inserted(record)) => ActivityOutcome::Completed {
                result: record.result,
                deduplicated: false,
            },
            Ok(RecordOutcome::AlreadyExists(existing)) => ActivityOutcome::Completed {
                result: existing.result,
                deduplicated: true,
            },
            Err(err) => self.failed(invocation, ledger_failure(err)),
        }
    }

    async fn record(
        &self,
        key: &IdempotencyKey,
        result: Value,
    ) -> Result<RecordOutcome, LedgerError> {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.ledger.record(key, result.clone()).await {
                Err(err) if err.is_retryable() && tries < self.record_attempts => {
                    warn!(key = %key, tries, error = %err, "ledger unavailable, retrying record");
                    tokio::time::sleep(self.record_backoff * tries).await;
                }
                other => return other,
            }
        }
    }

    fn failed(&self, invocation: &ActivityInvocation, error: ActivityError) -> ActivityOutcome {
        if error.error_type.as_deref() == Some(error_types::STORAGE_UNAVAILABLE) {
            warn!(
                attempt = invocation.attempt,
                error = %error,
                "storage unavailable around activity attempt, will run it again"
            );
            return ActivityOutcome::Interrupted { error };
        }

        let policy = &invocation.options.retry_policy;
        match policy.decide(invocation.attempt, &error) {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                warn!(
                    attempt = invocation.attempt,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "activity attempt failed, will retry"
                );
                ActivityOutcome::Retry {
                    error,
                    next_attempt,
                    delay,
                }
            }
            RetryDecision::GiveUp => {
                warn!(
                    attempt = invocation.attempt,
                    max_attempts = policy.max_attempts,
                    retryable = error.retryable,
                    error = %error,
                    "activity failed permanently"
                );
                ActivityOutcome::Failed(error)
            }
        }
    }
}

fn ledger_failure(err: LedgerError) -> ActivityError {
    match err {
        LedgerError::StorageUnavailable(message) => ActivityError::storage_unavailable(message),
        other => ActivityError::retryable(other.to_string()),
    }
}

impl std::fmt::Debug for ActivityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityEngine")
            .field("registry", &self.registry)
            .field("record_attempts", &self.record_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::ledger::Amount;
    use crate::persistence::InMemoryDurableStore;
    use crate::reliability::RetryPolicy;
    use crate::activity::Activity;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds with the call number
    struct Flaky {
        calls: Arc<AtomicU32>,
        failures: u32,
    }

    #[async_trait]
    impl Activity for Flaky {
        const TYPE: &'static str = "flaky";
        type Input = Value;
        type Output = Value;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            _input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ActivityError::retryable(format!("failure {call}")))
            } else {
                Ok(json!({ "call": call }))
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Activity for Slow {
        const TYPE: &'static str = "slow";
        type Input = Value;
        type Output = Value;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            _input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct Fixture {
        engine: ActivityEngine,
        store: Arc<InMemoryDurableStore>,
        calls: Arc<AtomicU32>,
    }

    fn fixture(failures: u32) -> Fixture {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = IdempotencyLedger::new(store.clone(), Arc::new(SystemClock));
        let registry = ActivityRegistry::new()
            .with(Flaky {
                calls: calls.clone(),
                failures,
            })
            .with(Slow);
        let engine = ActivityEngine::new(Arc::new(registry), ledger)
            .with_record_retries(2, Duration::from_millis(1));
        Fixture {
            engine,
            store,
            calls,
        }
    }

    fn invocation(activity_type: &str, attempt: u32) -> ActivityInvocation {
        ActivityInvocation {
            workflow_id: Uuid::now_v7(),
            activity_id: "charge".into(),
            activity_type: activity_type.into(),
            input: json!({}),
            idempotency_key: IdempotencyKey::new("c1", Amount::from_cents(9999), "wf-1"),
            options: ActivityOptions::default().with_retry(
                RetryPolicy::exponential()
                    .with_max_attempts(3)
                    .with_initial_interval(Duration::from_secs(5)),
            ),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_success_records_effect() {
        let f = fixture(0);
        let outcome = f.engine.execute(&invocation("flaky", 1)).await;

        assert_eq!(
            outcome,
            ActivityOutcome::Completed {
                result: json!({"call": 1}),
                deduplicated: false
            }
        );
        assert_eq!(f.store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_existing_record_skips_activity() {
        let f = fixture(0);
        f.engine.execute(&invocation("flaky", 1)).await;
        let outcome = f.engine.execute(&invocation("flaky", 2)).await;

        assert_eq!(
            outcome,
            ActivityOutcome::Completed {
                result: json!({"call": 1}),
                deduplicated: true
            }
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_backoff() {
        let f = fixture(5);

        match f.engine.execute(&invocation("flaky", 1)).await {
            ActivityOutcome::Retry {
                next_attempt,
                delay,
                ..
            } => {
                assert_eq!(next_attempt, 2);
                assert_eq!(delay, Duration::from_secs(5));
            }
            other => panic!("expected Retry, got {other:?}"),
        }

        match f.engine.execute(&invocation("flaky", 2)).await {
            ActivityOutcome::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(10)),
            other => panic!("expected Retry, got {other:?}"),
        }

        let last = f.engine.execute(&invocation("flaky", 3)).await;
        assert!(matches!(last, ActivityOutcome::Failed(ref e) if e.message == "failure 3"));
        assert_eq!(f.store.ledger_len(), 0);
    }

    /// Runs its effect; the first call takes the store down with it
    struct ChargeThenOutage {
        calls: Arc<AtomicU32>,
        store: Arc<InMemoryDurableStore>,
    }

    #[async_trait]
    impl Activity for ChargeThenOutage {
        const TYPE: &'static str = "charge_then_outage";
        type Input = Value;
        type Output = Value;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            _input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 {
                self.store.set_available(false);
            }
            Ok(json!({ "call": call }))
        }
    }

    #[tokio::test]
    async fn test_unavailable_ledger_on_last_attempt_is_not_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = IdempotencyLedger::new(store.clone(), Arc::new(SystemClock));
        let registry = ActivityRegistry::new().with(ChargeThenOutage {
            calls: calls.clone(),
            store: store.clone(),
        });
        let engine = ActivityEngine::new(Arc::new(registry), ledger)
            .with_record_retries(2, Duration::from_millis(1));

        let last = invocation("charge_then_outage", 3);
        match engine.execute(&last).await {
            ActivityOutcome::Interrupted { error } => {
                assert!(error.retryable);
                assert_eq!(
                    error.error_type.as_deref(),
                    Some(error_types::STORAGE_UNAVAILABLE)
                );
            }
            other => panic!("expected Interrupted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Lookup failing before the attempt is interrupted too, without a call.
        match engine.execute(&last).await {
            ActivityOutcome::Interrupted { .. } => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The same attempt runs again once storage is back.
        store.set_available(true);
        assert_eq!(
            engine.execute(&last).await,
            ActivityOutcome::Completed {
                result: json!({"call": 2}),
                deduplicated: false
            }
        );
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let f = fixture(0);
        let mut invocation = invocation("slow", 1);
        invocation.options.start_to_close_timeout = Duration::from_millis(20);

        match f.engine.execute(&invocation).await {
            ActivityOutcome::Retry { error, .. } => assert!(error.is_timeout()),
            other => panic!("expected Retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_activity_is_permanent() {
        let f = fixture(0);
        match f.engine.execute(&invocation("missing", 1)).await {
            ActivityOutcome::Failed(error) => {
                assert_eq!(error.error_type.as_deref(), Some(error_types::UNKNOWN_ACTIVITY));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unavailable_ledger_fails_attempt_without_running_it() {
        let f = fixture(0);
        f.store.set_available(false);

        match f.engine.execute(&invocation("flaky", 1)).await {
            ActivityOutcome::Retry { error, .. } => {
                assert_eq!(
                    error.error_type.as_deref(),
                    Some(error_types::STORAGE_UNAVAILABLE)
                );
            }
            other => panic!("expected Retry, got {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }
}
