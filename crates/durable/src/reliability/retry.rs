//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// Configuration for activity retries
///
/// The wait after failed attempt `n` is
/// `initial_interval * backoff_coefficient^(n - 1)`, capped at `max_interval`
/// when one is set, with optional jitter.
///
/// # Example
///
/// ```
/// use oncepay_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(5));
///
/// assert_eq!(policy.backoff_after(1), Duration::from_secs(5));
/// assert_eq!(policy.backoff_after(2), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on any single delay
    #[serde(default, with = "option_duration_millis")]
    pub max_interval: Option<Duration>,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    #[serde(default)]
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run `next_attempt` after waiting `delay`
    Retry { next_attempt: u32, delay: Duration },

    /// The failure is permanent
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Some(Duration::from_secs(60)),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: None,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: Some(interval),
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts (at least 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Cap every delay at `interval`
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    /// Remove the delay cap
    pub fn without_max_interval(mut self) -> Self {
        self.max_interval = None;
        self
    }

    /// Set the backoff coefficient (at least 1.0)
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay to wait after attempt `failed_attempt` (1-based) fails
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = match self.max_interval {
            Some(cap) => base.min(cap.as_secs_f64()),
            None => base,
        };

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(Duration::MAX)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Decide whether `error` from attempt `attempt` is retried
    pub fn decide(&self, attempt: u32, error: &ActivityError) -> RetryDecision {
        if error.retryable
            && self.should_retry(error.error_type.as_deref())
            && self.has_attempts_remaining(attempt)
        {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay: self.backoff_after(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
