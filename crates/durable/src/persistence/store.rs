//! DurableStore trait definition

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{IdempotencyKey, IdempotencyRecord, RecordOutcome};
use crate::timer::{TimerEntry, TimerId};
use crate::workflow::{HistoryEvent, WorkflowError};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A workflow with this id already exists
    #[error("workflow already exists: {0}")]
    WorkflowAlreadyExists(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Storage is temporarily unreachable (locked, pool exhausted, I/O hiccup)
    ///
    /// Callers retry the same operation; this never means "did not happen".
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the same operation should be retried later
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Started or being driven by the executor
    Running,

    /// Suspended on a durable timer
    AwaitingTimer,

    /// Suspended on an activity attempt
    AwaitingActivity,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the instance will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable textual form, as stored in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingTimer => "awaiting_timer",
            Self::AwaitingActivity => "awaiting_activity",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "awaiting_timer" => Ok(Self::AwaitingTimer),
            "awaiting_activity" => Ok(Self::AwaitingActivity),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Workflow instance information stored in the database
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Number of events in the history log
    pub position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Store for workflow instances, history, timers and the idempotency ledger
///
/// This trait defines the interface for persisting engine state. One handle
/// is shared by every component; implementations must be thread-safe and
/// make each individual operation atomic.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Instance Operations
    // =========================================================================

    /// Create a new workflow instance in `Running` status
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Get full workflow info
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Update workflow status (and result/error for terminal states)
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Ids of every instance not in a terminal status
    async fn list_active_workflows(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Remove terminal instances completed before `completed_before`
    ///
    /// Deletes the instance row, its history and its timers. Returns the
    /// number of instances removed.
    async fn archive_workflows(&self, completed_before: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Append events to a workflow (with optimistic concurrency)
    ///
    /// `expected_sequence` is the current history length. Returns the new
    /// length after appending. `recorded_at` stamps the events and the
    /// instance's `updated_at`.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: u64,
        events: Vec<HistoryEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Load all events for a workflow in sequence order (for replay)
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<(u64, HistoryEvent)>, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Insert a timer; returns `false` if the timer id already exists
    async fn insert_timer(&self, timer: &TimerEntry) -> Result<bool, StoreError>;

    /// Read a timer
    async fn get_timer(&self, timer_id: &TimerId) -> Result<Option<TimerEntry>, StoreError>;

    /// Delete an unfired timer; returns `false` if absent or already fired
    async fn delete_timer(&self, timer_id: &TimerId) -> Result<bool, StoreError>;

    /// Atomically mark every unfired timer with `deadline <= now` as fired
    /// and return them ordered by deadline
    async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>, StoreError>;

    // =========================================================================
    // Idempotency Ledger Operations
    // =========================================================================

    /// Insert a ledger record unless one exists for its key
    async fn insert_ledger_record(
        &self,
        record: IdempotencyRecord,
    ) -> Result<RecordOutcome, StoreError>;

    /// Read the ledger record for `key`
    async fn get_ledger_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// All ledger records, newest first
    async fn list_ledger_records(&self) -> Result<Vec<IdempotencyRecord>, StoreError>;

    /// Delete all ledger records; returns the number removed
    async fn clear_ledger(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::AwaitingTimer,
            WorkflowStatus::AwaitingActivity,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<WorkflowStatus>().unwrap(), status);
        }
        assert!("paused".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::AwaitingTimer.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(StoreError::Unavailable("locked".into()).is_unavailable());
        assert!(!StoreError::Database("corrupt".into()).is_unavailable());
    }
}
