//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::ledger::IdempotencyKey;
use crate::reliability::{duration_millis, RetryPolicy};

/// The durable operations a workflow can request
///
/// Every decision point of a workflow returns exactly one action, so a
/// workflow has at most one outstanding sleep or activity at a time. Each
/// action is persisted as a [`HistoryEvent`](super::HistoryEvent) before it
/// takes effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Suspend until `duration` has elapsed on the engine clock
    Sleep {
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Run an activity and resume with its result
    CallActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up in registry)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Key of the side effect the activity performs
        idempotency_key: IdempotencyKey,

        /// Execution options (retries, timeout)
        options: ActivityOptions,
    },

    /// Complete the workflow successfully with a result
    Complete {
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    Fail {
        error: WorkflowError,
    },
}

impl WorkflowAction {
    /// Create a sleep action
    pub fn sleep(duration: Duration) -> Self {
        Self::Sleep { duration }
    }

    /// Create an activity call with default options
    pub fn call_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self::CallActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            idempotency_key,
            options: ActivityOptions::default(),
        }
    }

    /// Replace the options of an activity call; other actions are unchanged
    pub fn with_options(self, options: ActivityOptions) -> Self {
        match self {
            Self::CallActivity {
                activity_id,
                activity_type,
                input,
                idempotency_key,
                ..
            } => Self::CallActivity {
                activity_id,
                activity_type,
                input,
                idempotency_key,
                options,
            },
            other => other,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::Complete { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::Fail { error }
    }

    /// Short name used in logs and replay diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sleep { .. } => "sleep",
            Self::CallActivity { .. } => "call_activity",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt (zero disables the timeout)
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}
