//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`enforce_start_to_close`] - Per-attempt timeout enforcement

mod retry;
mod timeout;

pub use retry::{RetryDecision, RetryPolicy};
pub(crate) use retry::duration_millis;
pub use timeout::{enforce_start_to_close, TimeoutError};
