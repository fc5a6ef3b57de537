//! Workflow history log
//!
//! Append-only, ordered log of every decision and completion event of one
//! instance. Positions are dense and start at 0; an append names the position
//! it expects to write at and fails with a concurrency conflict otherwise.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::persistence::{DurableStore, StoreError};
use crate::workflow::HistoryEvent;

/// Handle to the history of workflow instances
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append one event at `expected_position`; returns the new length
    pub async fn append(
        &self,
        instance_id: Uuid,
        expected_position: u64,
        event: HistoryEvent,
    ) -> Result<u64, StoreError> {
        self.append_all(instance_id, expected_position, vec![event])
            .await
    }

    /// Append several events atomically
    #[instrument(skip(self, events), fields(%instance_id, count = events.len()))]
    pub async fn append_all(
        &self,
        instance_id: Uuid,
        expected_position: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, StoreError> {
        let kinds: Vec<&'static str> = events.iter().map(HistoryEvent::event_type).collect();
        let position = self
            .store
            .append_events(instance_id, expected_position, events, self.clock.now())
            .await?;
        debug!(%instance_id, ?kinds, position, "history appended");
        Ok(position)
    }

    /// Every event of `instance_id` in position order
    pub async fn read(&self, instance_id: Uuid) -> Result<Vec<(u64, HistoryEvent)>, StoreError> {
        self.store.load_events(instance_id).await
    }
}

impl std::fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::persistence::InMemoryDurableStore;
    use crate::workflow::WorkflowError;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let store = Arc::new(InMemoryDurableStore::new());
        let history = HistoryLog::new(store.clone(), Arc::new(SystemClock));
        let instance_id = Uuid::now_v7();
        store
            .create_workflow(instance_id, "charge", json!({}), Utc::now())
            .await
            .unwrap();

        let position = history
            .append(instance_id, 0, HistoryEvent::WorkflowStarted { input: json!({}) })
            .await
            .unwrap();
        assert_eq!(position, 1);

        let position = history
            .append(
                instance_id,
                position,
                HistoryEvent::WorkflowFailed {
                    error: WorkflowError::new("boom"),
                },
            )
            .await
            .unwrap();
        assert_eq!(position, 2);

        let events = history.read(instance_id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|(seq, e)| (*seq, e.event_type())).collect();
        assert_eq!(kinds, vec![(0, "workflow_started"), (1, "workflow_failed")]);
    }

    #[tokio::test]
    async fn test_stale_position_conflicts() {
        let store = Arc::new(InMemoryDurableStore::new());
        let history = HistoryLog::new(store.clone(), Arc::new(SystemClock));
        let instance_id = Uuid::now_v7();
        store
            .create_workflow(instance_id, "charge", json!({}), Utc::now())
            .await
            .unwrap();

        let started = HistoryEvent::WorkflowStarted { input: json!({}) };
        history.append(instance_id, 0, started.clone()).await.unwrap();

        let err = history.append(instance_id, 0, started).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
        assert_eq!(history.read(instance_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_stamps_clock_time() {
        let store = Arc::new(InMemoryDurableStore::new());
        let clock = ManualClock::starting_now();
        let history = HistoryLog::new(store.clone(), Arc::new(clock.clone()));
        let instance_id = Uuid::now_v7();
        store
            .create_workflow(instance_id, "charge", json!({}), clock.now())
            .await
            .unwrap();

        clock.advance(std::time::Duration::from_secs(3600));
        history
            .append(instance_id, 0, HistoryEvent::WorkflowStarted { input: json!({}) })
            .await
            .unwrap();

        let info = store.get_workflow_info(instance_id).await.unwrap();
        assert_eq!(info.updated_at, clock.now());
        assert_eq!(info.updated_at - info.created_at, chrono::Duration::hours(1));
    }
}
