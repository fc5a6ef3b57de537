//! Payment processor seam

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::activity::ActivityError;
use crate::ledger::IdempotencyKey;

/// External system that moves the money
///
/// Implementations receive the idempotency key of the charge and should
/// forward it to the real processor; the engine itself only guarantees that
/// one result is ever recorded per key.
#[async_trait]
pub trait PaymentProcessor: Send + Sync + 'static {
    /// Charge the customer named by `key`; returns the processor's charge id
    async fn charge(&self, key: &IdempotencyKey) -> Result<String, ActivityError>;
}

/// What the next call to [`InMemoryPaymentProcessor`] does
#[derive(Debug, Clone)]
enum Script {
    Fail(ActivityError),
    /// Count the charge, then never return
    Stall,
}

/// Processor that counts calls per key and can be scripted to fail
///
/// Every call is an effect: it increments the call count for its key before
/// any scripted failure or stall applies, so a crashed attempt still shows up
/// as a charge.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentProcessor {
    calls: Arc<Mutex<HashMap<String, u32>>>,
    script: Arc<Mutex<VecDeque<Script>>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls with `error`
    pub fn fail_next(&self, times: usize, error: ActivityError) {
        let mut script = self.script.lock();
        script.extend(std::iter::repeat(Script::Fail(error)).take(times));
    }

    /// Make the next call charge and then hang forever
    ///
    /// Simulates a worker that dies after the processor took the money but
    /// before the result was recorded.
    pub fn stall_next(&self) {
        self.script.lock().push_back(Script::Stall);
    }

    /// Number of calls made for `key`
    pub fn calls(&self, key: &IdempotencyKey) -> u32 {
        self.calls
            .lock()
            .get(&key.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Number of calls across every key
    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl PaymentProcessor for InMemoryPaymentProcessor {
    async fn charge(&self, key: &IdempotencyKey) -> Result<String, ActivityError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let script = self.script.lock().pop_front();

        match script {
            Some(Script::Fail(error)) => {
                debug!(key = %key, call, error = %error, "scripted charge failure");
                Err(error)
            }
            Some(Script::Stall) => {
                info!(key = %key, call, "charge taken, stalling");
                std::future::pending().await
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("ch_{id:06}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Amount;
    use std::time::Duration;

    fn key(discriminator: &str) -> IdempotencyKey {
        IdempotencyKey::new("c1", Amount::from_cents(9999), discriminator)
    }

    #[tokio::test]
    async fn test_counts_calls_per_key() {
        let processor = InMemoryPaymentProcessor::new();
        let (a, b) = (key("a"), key("b"));
        assert_eq!(processor.charge(&a).await.unwrap(), "ch_000001");
        assert_eq!(processor.charge(&a).await.unwrap(), "ch_000002");
        processor.charge(&b).await.unwrap();

        assert_eq!(processor.calls(&a), 2);
        assert_eq!(processor.calls(&b), 1);
        assert_eq!(processor.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_failures_still_count() {
        let processor = InMemoryPaymentProcessor::new();
        processor.fail_next(2, ActivityError::retryable("gateway timeout"));
        let a = key("a");

        assert!(processor.charge(&a).await.is_err());
        assert!(processor.charge(&a).await.is_err());
        assert!(processor.charge(&a).await.is_ok());
        assert_eq!(processor.calls(&a), 3);
    }

    #[tokio::test]
    async fn test_stall_never_returns() {
        let processor = InMemoryPaymentProcessor::new();
        processor.stall_next();
        let a = key("a");

        let stalled = tokio::time::timeout(Duration::from_millis(50), processor.charge(&a));
        assert!(stalled.await.is_err());
        assert_eq!(processor.calls(&a), 1);
    }
}
