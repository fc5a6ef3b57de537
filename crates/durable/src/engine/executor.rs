//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflow instances
//! - Replaying an instance's history to rebuild its state on every trigger
//! - Executing the next decision live (timers, activity calls, completion)
//! - Reconciling timers and activities left half-done by a crash
//!
//! The executor never runs an activity itself. When an instance waits on an
//! attempt it returns [`ResumeOutcome::AwaitingActivity`] and the caller
//! hands the invocation to the worker pool; the outcome comes back later as
//! [`Trigger::ActivityResult`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::history::HistoryLog;
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{ActivityStage, Pending, Replay, ReplayError, ScheduledActivity, Terminal};
use crate::activity::{ActivityInvocation, ActivityOutcome};
use crate::clock::{deadline_after, Clock};
use crate::persistence::{DurableStore, StoreError, WorkflowInfo, WorkflowStatus};
use crate::timer::{TimerId, TimerService};
use crate::workflow::{HistoryEvent, TimerPurpose, WorkflowAction, WorkflowError};

/// Error code stored on cancelled instances
pub const CANCELLED_CODE: &str = "cancelled";

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Recorded history does not match the workflow's decisions
    #[error(transparent)]
    NonDeterminism(#[from] ReplayError),

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Whether re-running the same trigger later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Unavailable(_) | StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Lifecycle phases of an executor run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorPhase {
    NotStarted,
    ReplayingHistory,
    ExecutingLive,
    AwaitingTimer,
    AwaitingActivity,
    Completed,
    Failed,
    Cancelled,
}

/// Why an instance is being resumed
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// First run after [`WorkflowExecutor::start`]
    Start,

    /// Re-drive from history (recovery, retries of a failed resumption)
    Resume,

    /// A timer owned by the instance has been claimed by the sweep
    TimerFired(TimerId),

    /// An activity attempt finished
    ActivityResult {
        activity_id: String,
        attempt: u32,
        outcome: ActivityOutcome,
    },

    /// Operator cancellation
    Cancel { reason: String },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Resume => "resume",
            Self::TimerFired(_) => "timer_fired",
            Self::ActivityResult { .. } => "activity_result",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Where an instance stands after a resumption
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Suspended until the timer fires
    AwaitingTimer {
        timer_id: TimerId,
        deadline: DateTime<Utc>,
    },

    /// Suspended until `invocation` reports back
    AwaitingActivity { invocation: ActivityInvocation },

    Completed { result: Value },

    Failed { error: WorkflowError },

    Cancelled { reason: String },
}

impl ResumeOutcome {
    pub fn phase(&self) -> ExecutorPhase {
        match self {
            Self::AwaitingTimer { .. } => ExecutorPhase::AwaitingTimer,
            Self::AwaitingActivity { .. } => ExecutorPhase::AwaitingActivity,
            Self::Completed { .. } => ExecutorPhase::Completed,
            Self::Failed { .. } => ExecutorPhase::Failed,
            Self::Cancelled { .. } => ExecutorPhase::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    fn from_terminal(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Completed(result) => Self::Completed { result },
            Terminal::Failed(error) => Self::Failed { error },
            Terminal::Cancelled(reason) => Self::Cancelled { reason },
        }
    }

    /// Outcome of an instance whose stored status is already terminal
    fn from_info(info: &WorkflowInfo) -> Self {
        match info.status {
            WorkflowStatus::Cancelled => Self::Cancelled {
                reason: info
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            },
            WorkflowStatus::Failed => Self::Failed {
                error: info
                    .error
                    .clone()
                    .unwrap_or_else(|| WorkflowError::new("workflow failed")),
            },
            _ => Self::Completed {
                result: info.result.clone().unwrap_or(Value::Null),
            },
        }
    }
}

/// Workflow executor
///
/// Drives workflow state machines by replaying events and executing the next
/// decision. Callers serialize resumptions of one instance (the dispatcher
/// holds a per-instance lock); optimistic concurrency on the history
/// position catches anything that slips through.
///
/// # Example
///
/// ```ignore
/// let executor = WorkflowExecutor::new(store, Arc::new(registry), clock);
///
/// let instance_id = Uuid::now_v7();
/// executor.start(instance_id, ChargeWorkflow::TYPE, input).await?;
/// match executor.resume(instance_id, Trigger::Start).await? {
///     ResumeOutcome::AwaitingTimer { deadline, .. } => println!("sleeping until {deadline}"),
///     other => println!("{other:?}"),
/// }
/// ```
#[derive(Clone)]
pub struct WorkflowExecutor {
    store: Arc<dyn DurableStore>,
    history: HistoryLog,
    timers: TimerService,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor over the given store
    pub fn new(
        store: Arc<dyn DurableStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            history: HistoryLog::new(store.clone(), clock.clone()),
            timers: TimerService::new(store.clone(), clock.clone()),
            store,
            registry,
            clock,
            config: ExecutorConfig::default(),
        }
    }

    /// Replace the executor config
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Create an instance and record `WorkflowStarted`
    ///
    /// The instance does not run until it is resumed with [`Trigger::Start`].
    #[instrument(skip(self, input))]
    pub async fn start(
        &self,
        instance_id: Uuid,
        workflow_type: &str,
        input: Value,
    ) -> Result<(), ExecutorError> {
        // Fail fast on unknown types and undecodable input.
        self.registry
            .create(workflow_type, instance_id, input.clone())?;

        self.store
            .create_workflow(instance_id, workflow_type, input.clone(), self.clock.now())
            .await?;
        self.history
            .append(instance_id, 0, HistoryEvent::WorkflowStarted { input })
            .await?;

        info!(%instance_id, workflow_type, "workflow started");
        Ok(())
    }

    /// Replay `instance_id` and carry it as far as it can go
    #[instrument(skip(self, trigger), fields(trigger = trigger.kind()))]
    pub async fn resume(
        &self,
        instance_id: Uuid,
        trigger: Trigger,
    ) -> Result<ResumeOutcome, ExecutorError> {
        let info = self.store.get_workflow_info(instance_id).await?;

        if info.status.is_terminal() {
            debug!(%instance_id, status = %info.status, "workflow already in terminal state");
            return Ok(ResumeOutcome::from_info(&info));
        }

        let mut replay = self.load(&info).await?;
        self.drive(instance_id, &mut replay, info.status, trigger)
            .await
    }

    /// Decisions the workflow makes when its history is replayed
    ///
    /// Does not drive the instance: no decision is executed and no timer is
    /// touched.
    pub async fn replay_decisions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowAction>, ExecutorError> {
        let info = self.store.get_workflow_info(instance_id).await?;
        let replay = self.load(&info).await?;
        Ok(replay.decisions().to_vec())
    }

    async fn load(&self, info: &WorkflowInfo) -> Result<Replay, ExecutorError> {
        let instance_id = info.id;
        let mut events = self.history.read(instance_id).await?;

        if events.is_empty() {
            // Crashed between creating the instance and recording its start.
            warn!(%instance_id, "instance has no history, recording start");
            self.history
                .append(
                    instance_id,
                    0,
                    HistoryEvent::WorkflowStarted {
                        input: info.input.clone(),
                    },
                )
                .await?;
            events = self.history.read(instance_id).await?;
        }

        if events.len() > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                instance_id,
                events.len(),
                self.config.max_events_per_workflow,
            ));
        }

        let workflow = self
            .registry
            .create(&info.workflow_type, instance_id, info.input.clone())?;
        let mut replay = Replay::new(instance_id, workflow);

        debug!(
            %instance_id,
            phase = ?ExecutorPhase::ReplayingHistory,
            events = events.len(),
            "replaying history"
        );
        replay.replay_all(&events)?;
        Ok(replay)
    }

    async fn drive(
        &self,
        instance_id: Uuid,
        replay: &mut Replay,
        status: WorkflowStatus,
        trigger: Trigger,
    ) -> Result<ResumeOutcome, ExecutorError> {
        debug!(
            %instance_id,
            phase = ?ExecutorPhase::ExecutingLive,
            position = replay.position(),
            "history replayed"
        );
        let mut trigger = Some(trigger);

        if let Some(Trigger::Cancel { reason }) = &trigger {
            self.cancel(instance_id, replay, reason.clone()).await?;
            trigger = None;
        }

        loop {
            match replay.pending().clone() {
                Pending::NotStarted => {
                    return Err(ReplayError::MissingStart { instance_id }.into());
                }

                Pending::Decision(action) => {
                    self.execute_action(instance_id, replay, action).await?;
                }

                Pending::Timer {
                    timer_id,
                    deadline,
                    purpose,
                    ..
                } => match self.timers.get(&timer_id).await? {
                    Some(entry) if entry.fired => {
                        debug!(%instance_id, %timer_id, "timer fired, resuming");
                        self.record(instance_id, replay, vec![HistoryEvent::TimerFired { timer_id }])
                            .await?;
                    }
                    found => {
                        if found.is_none() {
                            // No row yet: freshly recorded, or lost to a crash
                            // after the TimerScheduled append.
                            self.timers
                                .schedule(instance_id, timer_id.clone(), deadline, purpose)
                                .await?;
                        }
                        return self
                            .suspend(
                                instance_id,
                                status,
                                WorkflowStatus::AwaitingTimer,
                                ResumeOutcome::AwaitingTimer { timer_id, deadline },
                            )
                            .await;
                    }
                },

                Pending::Activity {
                    call,
                    stage: ActivityStage::Running { attempt },
                } => match trigger.take() {
                    Some(Trigger::ActivityResult {
                        activity_id,
                        attempt: finished,
                        outcome,
                    }) if activity_id == call.activity_id && finished == attempt => {
                        self.record_outcome(instance_id, replay, &call, attempt, outcome)
                            .await?;
                    }
                    other => {
                        if let Some(Trigger::ActivityResult {
                            activity_id,
                            attempt: finished,
                            ..
                        }) = other
                        {
                            debug!(%instance_id, %activity_id, finished, attempt, "ignoring stale activity result");
                        }
                        let invocation = call.invocation(instance_id, attempt);
                        return self
                            .suspend(
                                instance_id,
                                status,
                                WorkflowStatus::AwaitingActivity,
                                ResumeOutcome::AwaitingActivity { invocation },
                            )
                            .await;
                    }
                },

                Pending::Activity {
                    call,
                    stage: ActivityStage::RetryPending { next_attempt },
                } => {
                    let delay = call
                        .options
                        .retry_policy
                        .backoff_after(next_attempt.saturating_sub(1));
                    let timer =
                        self.retry_timer(instance_id, replay.position(), &call, next_attempt, delay);
                    self.record(instance_id, replay, vec![timer]).await?;
                }

                Pending::Terminal(terminal) => {
                    if let Some(Trigger::ActivityResult { activity_id, .. }) = &trigger {
                        debug!(%instance_id, %activity_id, "ignoring activity result for finished workflow");
                    }
                    return self.finish(instance_id, status, terminal).await;
                }
            }
        }
    }

    async fn execute_action(
        &self,
        instance_id: Uuid,
        replay: &mut Replay,
        action: WorkflowAction,
    ) -> Result<(), ExecutorError> {
        let event = match action {
            WorkflowAction::Sleep { duration } => {
                let timer_id = TimerId::new(instance_id, replay.position());
                let deadline = deadline_after(self.clock.now(), duration);
                info!(%instance_id, %timer_id, %deadline, "durable sleep");
                HistoryEvent::TimerScheduled {
                    timer_id,
                    purpose: TimerPurpose::Sleep { duration },
                    deadline,
                }
            }
            WorkflowAction::CallActivity {
                activity_id,
                activity_type,
                input,
                idempotency_key,
                options,
            } => {
                info!(%instance_id, %activity_id, %activity_type, key = %idempotency_key, "scheduling activity");
                HistoryEvent::ActivityScheduled {
                    activity_id,
                    activity_type,
                    input,
                    idempotency_key,
                    options,
                }
            }
            WorkflowAction::Complete { result } => HistoryEvent::WorkflowCompleted { result },
            WorkflowAction::Fail { error } => HistoryEvent::WorkflowFailed { error },
        };

        self.record(instance_id, replay, vec![event]).await
    }

    async fn record_outcome(
        &self,
        instance_id: Uuid,
        replay: &mut Replay,
        call: &ScheduledActivity,
        attempt: u32,
        outcome: ActivityOutcome,
    ) -> Result<(), ExecutorError> {
        let activity_id = call.activity_id.clone();
        let events = match outcome {
            ActivityOutcome::Completed {
                result,
                deduplicated,
            } => {
                if deduplicated {
                    info!(%instance_id, %activity_id, attempt, "duplicate effect detected, using recorded result");
                }
                vec![HistoryEvent::ActivityCompleted {
                    activity_id,
                    attempt,
                    result,
                    deduplicated,
                }]
            }
            ActivityOutcome::Retry {
                error,
                next_attempt,
                delay,
            } => {
                // Failure and backoff timer land together, so a crash never
                // leaves a retry without its timer.
                let timer =
                    self.retry_timer(instance_id, replay.position() + 1, call, next_attempt, delay);
                vec![
                    HistoryEvent::ActivityFailed {
                        activity_id,
                        attempt,
                        error,
                        will_retry: true,
                    },
                    timer,
                ]
            }
            ActivityOutcome::Failed(error) => vec![HistoryEvent::ActivityFailed {
                activity_id,
                attempt,
                error,
                will_retry: false,
            }],
            ActivityOutcome::Interrupted { error } => {
                // Nothing is known about the effect; the attempt stays open.
                warn!(%instance_id, %activity_id, attempt, error = %error, "activity attempt interrupted");
                return Ok(());
            }
        };

        self.record(instance_id, replay, events).await
    }

    fn retry_timer(
        &self,
        instance_id: Uuid,
        position: u64,
        call: &ScheduledActivity,
        next_attempt: u32,
        delay: std::time::Duration,
    ) -> HistoryEvent {
        HistoryEvent::TimerScheduled {
            timer_id: TimerId::new(instance_id, position),
            purpose: TimerPurpose::ActivityRetry {
                activity_id: call.activity_id.clone(),
                attempt: next_attempt,
            },
            deadline: deadline_after(self.clock.now(), delay),
        }
    }

    async fn cancel(
        &self,
        instance_id: Uuid,
        replay: &mut Replay,
        reason: String,
    ) -> Result<(), ExecutorError> {
        if replay.is_terminal() {
            debug!(%instance_id, "cancel ignored, workflow already finished");
            return Ok(());
        }

        if let Pending::Timer { timer_id, .. } = replay.pending().clone() {
            self.timers.cancel(&timer_id).await?;
        }

        self.record(
            instance_id,
            replay,
            vec![HistoryEvent::WorkflowCancelled {
                reason: reason.clone(),
            }],
        )
        .await?;
        info!(%instance_id, %reason, "workflow cancelled");
        Ok(())
    }

    /// Append `events` at the replay position and apply them to the cursor
    async fn record(
        &self,
        instance_id: Uuid,
        replay: &mut Replay,
        events: Vec<HistoryEvent>,
    ) -> Result<(), ExecutorError> {
        let position = replay.position();
        let total = position as usize + events.len();
        if total > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                instance_id,
                total,
                self.config.max_events_per_workflow,
            ));
        }

        self.history
            .append_all(instance_id, position, events.clone())
            .await?;
        for (offset, event) in events.iter().enumerate() {
            replay.apply(position + offset as u64, event)?;
        }
        Ok(())
    }

    async fn suspend(
        &self,
        instance_id: Uuid,
        current: WorkflowStatus,
        status: WorkflowStatus,
        outcome: ResumeOutcome,
    ) -> Result<ResumeOutcome, ExecutorError> {
        if current != status {
            self.store
                .update_workflow_status(instance_id, status, None, None, self.clock.now())
                .await?;
        }
        debug!(%instance_id, phase = ?outcome.phase(), "workflow suspended");
        Ok(outcome)
    }

    async fn finish(
        &self,
        instance_id: Uuid,
        current: WorkflowStatus,
        terminal: Terminal,
    ) -> Result<ResumeOutcome, ExecutorError> {
        let (status, result, error) = match &terminal {
            Terminal::Completed(result) => (WorkflowStatus::Completed, Some(result.clone()), None),
            Terminal::Failed(error) => (WorkflowStatus::Failed, None, Some(error.clone())),
            Terminal::Cancelled(reason) => (
                WorkflowStatus::Cancelled,
                None,
                Some(WorkflowError::new(reason.clone()).with_code(CANCELLED_CODE)),
            ),
        };

        if current != status {
            self.store
                .update_workflow_status(instance_id, status, result, error, self.clock.now())
                .await?;
            match &terminal {
                Terminal::Completed(_) => info!(%instance_id, "workflow completed"),
                Terminal::Failed(error) => warn!(%instance_id, %error, "workflow failed"),
                Terminal::Cancelled(_) => {}
            }
        }

        Ok(ResumeOutcome::from_terminal(terminal))
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
