//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::WorkflowAction;
use crate::activity::ActivityError;
use crate::timer::TimerId;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<&ActivityError> for WorkflowError {
    fn from(err: &ActivityError) -> Self {
        let error = Self::new(err.message.clone());
        match &err.error_type {
            Some(code) => error.with_code(code.clone()),
            None => error,
        }
    }
}

/// Identity of the instance a workflow body runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowContext {
    /// Workflow instance ID
    pub instance_id: Uuid,

    /// Registered workflow type
    pub workflow_type: &'static str,
}

/// A workflow is a deterministic state machine driven by history
///
/// Each handler is a decision point and returns the single next durable
/// operation. Handlers must be deterministic: given the same input and the
/// same sequence of outcomes they must return the same actions, because the
/// executor rebuilds state after every suspension by replaying the history
/// through them. Handlers must not read clocks, randomness or I/O; anything
/// non-deterministic belongs in an activity.
///
/// # Example
///
/// ```ignore
/// use oncepay_durable::prelude::*;
///
/// struct RemindLater { customer_id: String }
///
/// impl Workflow for RemindLater {
///     const TYPE: &'static str = "remind_later";
///     type Input = RemindInput;
///     type Output = String;
///
///     fn new(_ctx: &WorkflowContext, input: Self::Input) -> Self {
///         Self { customer_id: input.customer_id }
///     }
///
///     fn on_start(&mut self) -> WorkflowAction {
///         WorkflowAction::sleep(Duration::from_secs(3600))
///     }
///
///     fn on_timer_fired(&mut self, _timer_id: &TimerId) -> WorkflowAction {
///         WorkflowAction::complete(json!("reminded"))
///     }
///
///     // ... activity handlers
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a workflow from its input
    ///
    /// This is called both when starting a new workflow and when replaying.
    fn new(ctx: &WorkflowContext, input: Self::Input) -> Self;

    /// First decision after the workflow starts
    fn on_start(&mut self) -> WorkflowAction;

    /// Decision after a durable sleep elapses
    fn on_timer_fired(&mut self, timer_id: &TimerId) -> WorkflowAction;

    /// Decision after an activity completes successfully
    ///
    /// The result is the JSON value returned by the activity, or the value
    /// recorded in the idempotency ledger by an earlier attempt.
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> WorkflowAction;

    /// Decision after an activity fails permanently
    ///
    /// The default fails the workflow with the activity's error.
    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> WorkflowAction {
        let _ = activity_id;
        WorkflowAction::fail(WorkflowError::from(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("not found").with_code("NOT_FOUND");
        assert_eq!(error.code, Some("NOT_FOUND".to_string()));
        assert_eq!(error.to_string(), "not found (NOT_FOUND)");
    }

    #[test]
    fn test_workflow_error_from_activity_error() {
        let activity_error = ActivityError::non_retryable("card declined").with_type("DECLINED");
        let error = WorkflowError::from(&activity_error);

        assert_eq!(error.message, "card declined");
        assert_eq!(error.code.as_deref(), Some("DECLINED"));
        assert!(!error.retryable);
    }
}
