//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Well-known `error_type` values produced by the engine itself
pub mod error_types {
    /// The attempt exceeded its start-to-close timeout
    pub const TIMEOUT: &str = "timeout";

    /// The idempotency ledger could not be reached after the effect ran
    pub const STORAGE_UNAVAILABLE: &str = "storage_unavailable";

    /// No activity is registered under the scheduled type
    pub const UNKNOWN_ACTIVITY: &str = "unknown_activity";

    /// Input or output could not be (de)serialized
    pub const SERIALIZATION: &str = "serialization";
}

/// Error type for activity failures
///
/// A retryable error is a transient failure: the engine retries it while the
/// retry policy allows. A non-retryable error, or a retryable one that has
/// exhausted its attempts, is permanent and is handed to the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Attempt ran past its start-to-close timeout
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::retryable(format!("activity timed out after {}ms", after.as_millis()))
            .with_type(error_types::TIMEOUT)
    }

    /// Ledger was unreachable when recording the effect
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::retryable(message).with_type(error_types::STORAGE_UNAVAILABLE)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this error came from a timed-out attempt
    pub fn is_timeout(&self) -> bool {
        self.error_type.as_deref() == Some(error_types::TIMEOUT)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a side-effecting unit of work that may fail and be retried
///
/// The engine runs each attempt under a timeout and consults the idempotency
/// ledger around it, so an activity only needs to be safe to invoke again for
/// the same [`ActivityContext::idempotency_key`].
///
/// # Example
///
/// ```ignore
/// use oncepay_durable::prelude::*;
///
/// struct SendReceipt;
///
/// #[async_trait]
/// impl Activity for SendReceipt {
///     const TYPE: &'static str = "send_receipt";
///     type Input = ReceiptInput;
///     type Output = ReceiptOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         mailer.send(ctx.idempotency_key.to_string(), input).await?;
///         Ok(ReceiptOutput { sent: true })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// This is used to look up the activity in the registry.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute one attempt of the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
