//! History replay
//!
//! [`Replay`] feeds a workflow its recorded history and checks every recorded
//! decision against the decision the workflow makes now. The same
//! [`Replay::apply`] is used for events read from the log and for events the
//! executor has just appended, so live execution and replay cannot drift.
//!
//! After the last event the cursor says what the instance is waiting on:
//!
//! ```text
//! Pending::Decision(action)        the workflow asked for something not yet recorded
//! Pending::Timer { .. }            a sleep or retry backoff timer is outstanding
//! Pending::Activity { .. }         an attempt is running (or must be re-submitted)
//! Pending::Terminal(..)            completed, failed or cancelled
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::registry::AnyWorkflow;
use crate::activity::ActivityInvocation;
use crate::ledger::IdempotencyKey;
use crate::timer::TimerId;
use crate::workflow::{ActivityOptions, HistoryEvent, TimerPurpose, WorkflowAction, WorkflowError};

/// Replay failures; each means the history no longer matches the workflow code
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// The first event of a history must be `WorkflowStarted`
    #[error("history of {instance_id} does not begin with workflow_started")]
    MissingStart { instance_id: Uuid },

    /// A recorded event differs from what the workflow decides on replay
    #[error("non-determinism in {instance_id} at position {position}: workflow expected {expected}, history has {found}")]
    Mismatch {
        instance_id: Uuid,
        position: u64,
        expected: String,
        found: &'static str,
    },
}

/// An activity call as recorded in `ActivityScheduled`
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledActivity {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub idempotency_key: IdempotencyKey,
    pub options: ActivityOptions,
}

impl ScheduledActivity {
    /// Invocation of `attempt` for `workflow_id`
    pub fn invocation(&self, workflow_id: Uuid, attempt: u32) -> ActivityInvocation {
        ActivityInvocation {
            workflow_id,
            activity_id: self.activity_id.clone(),
            activity_type: self.activity_type.clone(),
            input: self.input.clone(),
            idempotency_key: self.idempotency_key.clone(),
            options: self.options.clone(),
            attempt,
        }
    }
}

/// Progress of a scheduled activity
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityStage {
    /// `attempt` has been handed to the worker pool and has no recorded result
    Running { attempt: u32 },

    /// An attempt failed transiently; the backoff timer is not recorded yet
    RetryPending { next_attempt: u32 },
}

/// Final state recorded in history
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Completed(Value),
    Failed(WorkflowError),
    Cancelled(String),
}

/// What the instance waits on after the last applied event
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// Nothing applied yet
    NotStarted,

    /// The workflow decided `action`, which has not been recorded
    Decision(WorkflowAction),

    /// A durable timer is outstanding
    Timer {
        timer_id: TimerId,
        deadline: DateTime<Utc>,
        purpose: TimerPurpose,
        /// Set while the timer is an activity backoff
        activity: Option<(ScheduledActivity, u32)>,
    },

    /// An activity is scheduled and not finished
    Activity {
        call: ScheduledActivity,
        stage: ActivityStage,
    },

    /// The instance is finished
    Terminal(Terminal),
}

impl Pending {
    fn describe(&self) -> String {
        match self {
            Self::NotStarted => "workflow_started".to_string(),
            Self::Decision(action) => action.kind().to_string(),
            Self::Timer { timer_id, .. } => format!("timer_fired({timer_id})"),
            Self::Activity { call, stage } => match stage {
                ActivityStage::Running { attempt } => {
                    format!("result of {} attempt {attempt}", call.activity_id)
                }
                ActivityStage::RetryPending { next_attempt } => {
                    format!("backoff timer for {} attempt {next_attempt}", call.activity_id)
                }
            },
            Self::Terminal(_) => "no further events".to_string(),
        }
    }
}

/// Replay cursor over one instance's history
pub struct Replay {
    instance_id: Uuid,
    workflow: Box<dyn AnyWorkflow>,
    pending: Pending,
    decisions: Vec<WorkflowAction>,
    position: u64,
}

impl Replay {
    /// Start a cursor for a freshly created workflow
    pub fn new(instance_id: Uuid, workflow: Box<dyn AnyWorkflow>) -> Self {
        Self {
            instance_id,
            workflow,
            pending: Pending::NotStarted,
            decisions: Vec::new(),
            position: 0,
        }
    }

    /// Apply every event of a history
    pub fn replay_all(&mut self, events: &[(u64, HistoryEvent)]) -> Result<(), ReplayError> {
        for (position, event) in events {
            self.apply(*position, event)?;
        }
        Ok(())
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    /// Every decision the workflow has made so far, in order
    pub fn decisions(&self) -> &[WorkflowAction] {
        &self.decisions
    }

    /// Number of events applied (the next append position)
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.pending, Pending::Terminal(_))
    }

    fn decide(&mut self, action: WorkflowAction) -> Pending {
        self.decisions.push(action.clone());
        Pending::Decision(action)
    }

    /// Apply the event recorded at `position`
    pub fn apply(&mut self, position: u64, event: &HistoryEvent) -> Result<(), ReplayError> {
        let pending = std::mem::replace(&mut self.pending, Pending::NotStarted);

        let next = match (pending, event) {
            (Pending::NotStarted, HistoryEvent::WorkflowStarted { .. }) => {
                let action = self.workflow.on_start();
                self.decide(action)
            }
            (Pending::NotStarted, _) => {
                return Err(ReplayError::MissingStart {
                    instance_id: self.instance_id,
                })
            }

            (Pending::Terminal(terminal), _) => {
                self.pending = Pending::Terminal(terminal);
                return Err(self.mismatch(position, "no further events".into(), event));
            }

            (_, HistoryEvent::WorkflowCancelled { reason }) => {
                Pending::Terminal(Terminal::Cancelled(reason.clone()))
            }

            (
                Pending::Decision(WorkflowAction::Sleep { duration }),
                HistoryEvent::TimerScheduled {
                    timer_id,
                    purpose,
                    deadline,
                },
            ) if *purpose == (TimerPurpose::Sleep { duration }) => Pending::Timer {
                timer_id: timer_id.clone(),
                deadline: *deadline,
                purpose: purpose.clone(),
                activity: None,
            },

            (
                Pending::Timer {
                    timer_id, activity, ..
                },
                HistoryEvent::TimerFired { timer_id: fired },
            ) if *fired == timer_id => match activity {
                Some((call, next_attempt)) => Pending::Activity {
                    call,
                    stage: ActivityStage::Running {
                        attempt: next_attempt,
                    },
                },
                None => {
                    let action = self.workflow.on_timer_fired(fired);
                    self.decide(action)
                }
            },

            (
                Pending::Decision(WorkflowAction::CallActivity {
                    activity_id,
                    activity_type,
                    input,
                    idempotency_key,
                    options,
                }),
                HistoryEvent::ActivityScheduled {
                    activity_id: r_id,
                    activity_type: r_type,
                    input: r_input,
                    idempotency_key: r_key,
                    options: r_options,
                },
            ) if *r_id == activity_id
                && *r_type == activity_type
                && *r_input == input
                && *r_key == idempotency_key
                && *r_options == options =>
            {
                Pending::Activity {
                    call: ScheduledActivity {
                        activity_id,
                        activity_type,
                        input,
                        idempotency_key,
                        options,
                    },
                    stage: ActivityStage::Running { attempt: 1 },
                }
            }

            (
                Pending::Activity {
                    call,
                    stage: ActivityStage::Running { attempt },
                },
                HistoryEvent::ActivityCompleted {
                    activity_id,
                    attempt: recorded,
                    result,
                    ..
                },
            ) if *activity_id == call.activity_id && *recorded == attempt => {
                let action = self
                    .workflow
                    .on_activity_completed(activity_id, result.clone());
                self.decide(action)
            }

            (
                Pending::Activity {
                    call,
                    stage: ActivityStage::Running { attempt },
                },
                HistoryEvent::ActivityFailed {
                    activity_id,
                    attempt: recorded,
                    error,
                    will_retry,
                },
            ) if *activity_id == call.activity_id && *recorded == attempt => {
                if *will_retry {
                    Pending::Activity {
                        call,
                        stage: ActivityStage::RetryPending {
                            next_attempt: attempt + 1,
                        },
                    }
                } else {
                    let action = self.workflow.on_activity_failed(activity_id, error);
                    self.decide(action)
                }
            }

            (
                Pending::Activity {
                    call,
                    stage: ActivityStage::RetryPending { next_attempt },
                },
                HistoryEvent::TimerScheduled {
                    timer_id,
                    purpose,
                    deadline,
                },
            ) if matches!(
                purpose,
                TimerPurpose::ActivityRetry { activity_id, attempt }
                    if *activity_id == call.activity_id && *attempt == next_attempt
            ) =>
            {
                Pending::Timer {
                    timer_id: timer_id.clone(),
                    deadline: *deadline,
                    purpose: purpose.clone(),
                    activity: Some((call, next_attempt)),
                }
            }

            (
                Pending::Decision(WorkflowAction::Complete { result }),
                HistoryEvent::WorkflowCompleted { result: recorded },
            ) if *recorded == result => Pending::Terminal(Terminal::Completed(result)),

            (
                Pending::Decision(WorkflowAction::Fail { error }),
                HistoryEvent::WorkflowFailed { error: recorded },
            ) if *recorded == error => Pending::Terminal(Terminal::Failed(error)),

            (pending, event) => {
                let expected = pending.describe();
                self.pending = pending;
                return Err(self.mismatch(position, expected, event));
            }
        };

        self.pending = next;
        self.position = position + 1;
        Ok(())
    }

    fn mismatch(&self, position: u64, expected: String, event: &HistoryEvent) -> ReplayError {
        ReplayError::Mismatch {
            instance_id: self.instance_id,
            position,
            expected,
            found: event.event_type(),
        }
    }
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay")
            .field("instance_id", &self.instance_id)
            .field("workflow_type", &self.workflow.workflow_type())
            .field("pending", &self.pending)
            .field("position", &self.position)
            .finish()
    }
}
