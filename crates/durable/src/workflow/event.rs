//! History events for persistence

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError};
use crate::activity::ActivityError;
use crate::ledger::IdempotencyKey;
use crate::reliability::duration_millis;
use crate::timer::TimerId;

/// Why a durable timer was scheduled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerPurpose {
    /// A workflow-requested durable sleep
    Sleep {
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Backoff before the next attempt of an activity
    ActivityRetry {
        activity_id: String,
        /// Attempt that runs once the timer fires
        attempt: u32,
    },
}

/// Events stored in a workflow's history log
///
/// These events form the append-only log for a workflow instance. They are
/// used for:
/// - Persisting workflow progress
/// - Replaying workflows after a crash or suspension
/// - Auditing (retry attempts and duplicate detections are visible here)
///
/// Events are immutable once written. The workflow state is reconstructed
/// by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with a permanent error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled by an operator
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Durable timer was scheduled
    TimerScheduled {
        /// Timer identifier
        timer_id: TimerId,

        /// Sleep or activity backoff
        purpose: TimerPurpose,

        /// Absolute instant the timer fires at
        deadline: DateTime<Utc>,
    },

    /// Timer fired (deadline passed)
    TimerFired {
        /// Timer identifier
        timer_id: TimerId,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Key of the side effect
        idempotency_key: IdempotencyKey,

        /// Execution options
        options: ActivityOptions,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Attempt that produced the result
        attempt: u32,

        /// Result returned by the activity (or found in the ledger)
        result: serde_json::Value,

        /// Whether the result came from an existing ledger record
        #[serde(default)]
        deduplicated: bool,
    },

    /// Activity attempt failed (may or may not retry)
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Attempt that failed (1-based)
        attempt: u32,

        /// Error details
        error: ActivityError,

        /// Whether another attempt will be made
        will_retry: bool,
    },
}

impl HistoryEvent {
    /// Stable name of the event variant, as stored in the `event_type` column
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::TimerScheduled { .. } => "timer_scheduled",
            Self::TimerFired { .. } => "timer_fired",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
        }
    }

    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Get the timer_id if this is a timer event
    pub fn timer_id(&self) -> Option<&TimerId> {
        match self {
            Self::TimerScheduled { timer_id, .. } | Self::TimerFired { timer_id } => Some(timer_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}
