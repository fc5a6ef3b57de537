//! Embeddable runtime
//!
//! [`DurableRuntime`] wires the store, clock, registries, executor and
//! dispatcher together and is the surface applications use to start,
//! observe and cancel workflows.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::activity::{Activity, ActivityEngine, ActivityRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::engine::{ExecutorError, ResumeOutcome, Trigger, WorkflowExecutor, WorkflowRegistry};
use crate::ledger::{IdempotencyLedger, LedgerError};
use crate::persistence::{DurableStore, StoreError, WorkflowInfo, WorkflowStatus};
use crate::worker::{Dispatcher, DispatcherConfig, WorkItem};
use crate::workflow::{HistoryEvent, Workflow, WorkflowError};

/// Errors from runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("invalid workflow input: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The workflow finished unsuccessfully (failed or cancelled)
    #[error("workflow {instance_id} did not complete: {error}")]
    Workflow {
        instance_id: Uuid,
        error: WorkflowError,
    },

    #[error("timed out waiting for workflow {0}")]
    Timeout(Uuid),
}

impl RuntimeError {
    /// The workflow's own error, when the workflow failed or was cancelled
    pub fn workflow_error(&self) -> Option<&WorkflowError> {
        match self {
            Self::Workflow { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Builder for [`DurableRuntime`]
pub struct DurableRuntimeBuilder {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    config: EngineConfig,
}

impl DurableRuntimeBuilder {
    /// Use `clock` instead of the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a workflow type
    pub fn workflow<W: Workflow>(mut self) -> Self {
        self.workflows.register::<W>();
        self
    }

    /// Register an activity implementation
    pub fn activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities.register(activity);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> DurableRuntime {
        let executor = WorkflowExecutor::new(
            self.store.clone(),
            Arc::new(self.workflows),
            self.clock.clone(),
        )
        .with_config(self.config.executor());

        let ledger = IdempotencyLedger::new(self.store.clone(), self.clock.clone());
        let activities = ActivityEngine::new(Arc::new(self.activities), ledger.clone())
            .with_record_retries(self.config.ledger_record_attempts, self.config.storage_retry_delay / 10);
        let dispatcher = Dispatcher::new(
            executor,
            activities,
            DispatcherConfig::from(&self.config),
        );

        DurableRuntime {
            store: self.store,
            clock: self.clock,
            dispatcher,
            ledger,
            config: self.config,
        }
    }
}

/// Durable execution runtime
///
/// Dropping the runtime aborts activity attempts still running; everything
/// else lives in the store and is picked up by the next runtime's
/// [`recover`](Self::recover).
///
/// # Example
///
/// ```ignore
/// let runtime = DurableRuntime::builder(store)
///     .workflow::<ChargeWorkflow>()
///     .activity(ChargeCustomerActivity::new(processor))
///     .build();
///
/// let id = runtime
///     .start_workflow::<ChargeWorkflow>(ChargeInput::new("c1", "99.99".parse()?), None)
///     .await?;
/// tokio::spawn(runtime.dispatcher().clone().run(shutdown_rx));
/// let result = runtime.get_result(id).await?;
/// ```
pub struct DurableRuntime {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    ledger: IdempotencyLedger,
    config: EngineConfig,
}

impl DurableRuntime {
    pub fn builder(store: Arc<dyn DurableStore>) -> DurableRuntimeBuilder {
        DurableRuntimeBuilder {
            store,
            clock: Arc::new(SystemClock),
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a workflow instance; returns its id
    ///
    /// The instance and its `WorkflowStarted` event are persisted before this
    /// returns. A fresh UUID v7 is used when `instance_id` is `None`.
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(
        &self,
        input: W::Input,
        instance_id: Option<Uuid>,
    ) -> Result<Uuid, RuntimeError> {
        let instance_id = instance_id.unwrap_or_else(Uuid::now_v7);
        let input = serde_json::to_value(input)?;

        self.dispatcher
            .executor()
            .start(instance_id, W::TYPE, input)
            .await?;
        self.dispatcher.enqueue(instance_id, Trigger::Start);
        Ok(instance_id)
    }

    /// Current state of an instance
    pub async fn describe(&self, instance_id: Uuid) -> Result<WorkflowInfo, RuntimeError> {
        Ok(self.store.get_workflow_info(instance_id).await?)
    }

    /// Terminal result of an instance, or `None` while it is still running
    pub async fn try_result(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<Result<Value, WorkflowError>>, RuntimeError> {
        let info = self.describe(instance_id).await?;
        Ok(match info.status {
            WorkflowStatus::Completed => Some(Ok(info.result.unwrap_or(Value::Null))),
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => Some(Err(info
                .error
                .unwrap_or_else(|| WorkflowError::new(format!("workflow {}", info.status))))),
            _ => None,
        })
    }

    /// Wait until the instance is terminal and return its result
    ///
    /// A failed or cancelled instance yields [`RuntimeError::Workflow`].
    pub async fn get_result(&self, instance_id: Uuid) -> Result<Value, RuntimeError> {
        loop {
            if let Some(result) = self.try_result(instance_id).await? {
                return result.map_err(|error| RuntimeError::Workflow { instance_id, error });
            }
            tokio::time::sleep(self.config.result_poll_interval).await;
        }
    }

    /// [`get_result`](Self::get_result) bounded by `timeout`
    pub async fn get_result_timeout(
        &self,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<Value, RuntimeError> {
        tokio::time::timeout(timeout, self.get_result(instance_id))
            .await
            .map_err(|_| RuntimeError::Timeout(instance_id))?
    }

    /// Cancel an instance
    ///
    /// Runs a cancel work item under the instance lock. Cancelling a finished
    /// instance is a no-op that returns its terminal outcome.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<ResumeOutcome, RuntimeError> {
        let item = WorkItem::new(
            instance_id,
            Trigger::Cancel {
                reason: reason.to_string(),
            },
        );
        Ok(self.dispatcher.process(item).await?)
    }

    /// Recorded history of an instance
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<(u64, HistoryEvent)>, RuntimeError> {
        Ok(self.dispatcher.executor().history().read(instance_id).await?)
    }

    /// Queue a resume for every non-terminal instance
    pub async fn recover(&self) -> Result<usize, RuntimeError> {
        Ok(self.dispatcher.recover().await?)
    }

    /// Remove terminal instances that finished more than `retention` ago
    #[instrument(skip(self))]
    pub async fn archive_completed(&self, retention: Duration) -> Result<u64, RuntimeError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let archived = self.store.archive_workflows(cutoff).await?;
        if archived > 0 {
            info!(archived, %cutoff, "archived finished workflows");
        }
        Ok(archived)
    }

    /// Recover, then dispatch until `shutdown` flips to `true`
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), RuntimeError> {
        self.recover().await?;
        Arc::clone(&self.dispatcher).run(shutdown).await;
        Ok(())
    }

    /// Drive queued work, due timers and running activities until nothing is left
    pub async fn run_until_idle(&self) {
        self.dispatcher.run_until_idle().await;
    }
}

impl std::fmt::Debug for DurableRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableRuntime")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
