//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::ledger::IdempotencyKey;

/// Context provided to activities during one execution attempt
///
/// The context carries:
/// - The idempotency key of the effect (pass it to downstream systems)
/// - Information about the current attempt
/// - Cancellation detection, tripped through the [`CancellationHandle`] the
///   worker pool holds for the attempt when the owning workflow is cancelled
#[derive(Debug)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Workflow instance ID that owns this activity
    pub workflow_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Key identifying the side effect across attempts and restarts
    pub idempotency_key: IdempotencyKey,

    cancelled: Arc<AtomicBool>,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        workflow_id: Uuid,
        activity_id: impl Into<String>,
        idempotency_key: IdempotencyKey,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            workflow_id,
            activity_id: activity_id.into(),
            idempotency_key,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share cancellation with `handle`
    pub fn with_cancellation(mut self, handle: &CancellationHandle) -> Self {
        self.cancelled = Arc::clone(&handle.cancelled);
        self
    }

    /// Get a handle that can be used to cancel this attempt
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves once cancellation is requested
    ///
    /// Meant for `tokio::select!` alongside the real work.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an in-flight attempt
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}
