//! Ledger records and outcomes

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Amount, IdempotencyKey};
use crate::persistence::StoreError;

/// Status of a recorded side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The effect completed and its result is stored
    Completed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// One row of the idempotency ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub customer_id: String,
    pub amount: Amount,
    pub status: RecordStatus,
    /// Result of the activity that produced the effect
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Record of a completed effect for `key`
    pub fn completed(
        key: IdempotencyKey,
        result: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            customer_id: key.customer_id().to_string(),
            amount: key.amount(),
            key,
            status: RecordStatus::Completed,
            result,
            created_at,
        }
    }
}

/// Result of [`IdempotencyLedger::record`](super::IdempotencyLedger::record)
///
/// `AlreadyExists` is the duplicate-effect path: it carries the payload that
/// was stored first and is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// This call stored the record
    Inserted(IdempotencyRecord),

    /// A record for the key was already present
    AlreadyExists(IdempotencyRecord),
}

impl RecordOutcome {
    /// Whether this call performed the insert
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    /// The record now stored under the key
    pub fn record(&self) -> &IdempotencyRecord {
        match self {
            Self::Inserted(record) | Self::AlreadyExists(record) => record,
        }
    }

    /// Consume into the stored record
    pub fn into_record(self) -> IdempotencyRecord {
        match self {
            Self::Inserted(record) | Self::AlreadyExists(record) => record,
        }
    }
}

/// Errors from ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The backing store could not be reached; retry the same call
    #[error("ledger storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Any other storage failure
    #[error("ledger storage error: {0}")]
    Storage(StoreError),
}

impl LedgerError {
    /// Whether the caller should retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::StorageUnavailable(message),
            other => Self::Storage(other),
        }
    }
}
