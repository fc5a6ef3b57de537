//! Activity timeout enforcement
//!
//! A timeout cancels only the attempt it wraps: the future is dropped, the
//! engine records a retryable `timeout` failure, and the retry policy decides
//! what happens next.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::activity::ActivityError;

/// Timeout-related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    /// Attempt exceeded its start-to-close timeout
    #[error("activity execution timed out (limit {limit:?})")]
    StartToClose { limit: Duration },
}

impl From<TimeoutError> for ActivityError {
    fn from(err: TimeoutError) -> Self {
        match err {
            TimeoutError::StartToClose { limit } => ActivityError::timeout(limit),
        }
    }
}

/// Run `attempt` to completion or until `limit` elapses
///
/// A zero limit means "no timeout".
pub async fn enforce_start_to_close<F>(
    limit: Duration,
    attempt: F,
) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    if limit.is_zero() {
        return Ok(attempt.await);
    }

    tokio::time::timeout(limit, attempt)
        .await
        .map_err(|_| TimeoutError::StartToClose { limit })
}
