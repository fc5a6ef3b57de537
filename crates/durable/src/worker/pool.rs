//! Activity worker pool
//!
//! Runs activity attempts on spawned tasks, at most `max_concurrency` at a
//! time, and reports each outcome back to the dispatcher as a work item.
//! Dropping the pool aborts every attempt still running, which is what a
//! process crash looks like to the rest of the engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::WorkItem;
use crate::activity::{ActivityEngine, ActivityInvocation, CancellationHandle};
use crate::engine::Trigger;

type AttemptKey = (Uuid, String, u32);

/// Handles to one running attempt
struct InFlight {
    abort: AbortHandle,
    cancellation: CancellationHandle,
}

/// Worker pool for executing activity attempts
pub struct ActivityWorkerPool {
    engine: ActivityEngine,
    results: mpsc::UnboundedSender<WorkItem>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    in_flight: Arc<Mutex<HashMap<AttemptKey, InFlight>>>,
}

impl ActivityWorkerPool {
    /// Create a pool that sends outcomes to `results`
    pub fn new(
        engine: ActivityEngine,
        results: mpsc::UnboundedSender<WorkItem>,
        max_concurrency: usize,
    ) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            engine,
            results,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit one attempt
    ///
    /// Returns `false` when the same attempt is already running; a workflow
    /// re-driven while its activity is in flight does not start it twice.
    pub fn submit(&self, invocation: ActivityInvocation) -> bool {
        let key: AttemptKey = (
            invocation.workflow_id,
            invocation.activity_id.clone(),
            invocation.attempt,
        );

        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&key) {
            debug!(
                workflow_id = %invocation.workflow_id,
                activity_id = %invocation.activity_id,
                attempt = invocation.attempt,
                "attempt already in flight"
            );
            return false;
        }

        let engine = self.engine.clone();
        let results = self.results.clone();
        let permits = Arc::clone(&self.permits);
        let registry = Arc::clone(&self.in_flight);
        let task_key = key.clone();
        let cancellation = CancellationHandle::new();
        let attempt_cancellation = cancellation.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let outcome = engine
                .execute_cancellable(&invocation, &attempt_cancellation)
                .await;
            let item = WorkItem::new(
                invocation.workflow_id,
                Trigger::ActivityResult {
                    activity_id: invocation.activity_id,
                    attempt: invocation.attempt,
                    outcome,
                },
            );
            if results.send(item).is_err() {
                warn!(
                    workflow_id = %invocation.workflow_id,
                    "dispatcher stopped, dropping activity result"
                );
            }
            // Removed only after the result is queued, so an idle pool never
            // has a result on its way.
            registry.lock().remove(&task_key);
        });

        in_flight.insert(
            key,
            InFlight {
                abort: handle.abort_handle(),
                cancellation,
            },
        );
        true
    }

    /// Signal cancellation to every running attempt of `workflow_id`
    ///
    /// Attempts see it through their context and finish early; their results
    /// still come back and are ignored by the cancelled workflow.
    pub fn cancel_instance(&self, workflow_id: Uuid) -> usize {
        let in_flight = self.in_flight.lock();
        let mut cancelled = 0;
        for ((instance_id, activity_id, attempt), attempt_handles) in in_flight.iter() {
            if *instance_id == workflow_id {
                debug!(%workflow_id, %activity_id, attempt, "cancelling activity attempt");
                attempt_handles.cancellation.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of attempts submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Number of attempts currently executing
    pub fn active(&self) -> usize {
        self.max_concurrency - self.permits.available_permits()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Abort every running attempt
    ///
    /// Their instances stay `AwaitingActivity`; recovery re-submits them.
    pub fn abort_all(&self) {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "aborting in-flight activity attempts");
        }
        for (_, attempt) in in_flight.drain() {
            attempt.abort.abort();
        }
    }
}

impl Drop for ActivityWorkerPool {
    fn drop(&mut self) {
        self.abort_all();
    }
}

impl std::fmt::Debug for ActivityWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityWorkerPool")
            .field("max_concurrency", &self.max_concurrency)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
