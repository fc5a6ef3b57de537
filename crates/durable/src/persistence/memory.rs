//! In-memory implementation of DurableStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::ledger::{IdempotencyKey, IdempotencyRecord, RecordOutcome};
use crate::timer::{TimerEntry, TimerId};
use crate::workflow::{HistoryEvent, WorkflowError};

/// Internal workflow state
struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    events: Vec<HistoryEvent>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

/// In-memory implementation of DurableStore
///
/// This is primarily for testing. It stores all data in memory and provides
/// the same semantics as the SQLite implementation. Because the store outlives
/// any runtime built on top of it (it is shared through an `Arc`), dropping a
/// runtime and building a new one over the same store is how tests simulate a
/// process crash and restart.
///
/// [`set_available`](Self::set_available) toggles fault injection: while
/// unavailable, every operation fails with [`StoreError::Unavailable`].
///
/// # Example
///
/// ```
/// use oncepay_durable::InMemoryDurableStore;
///
/// let store = InMemoryDurableStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryDurableStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    timers: RwLock<HashMap<TimerId, TimerEntry>>,
    ledger: RwLock<HashMap<String, IdempotencyRecord>>,
    available: AtomicBool,
}

impl InMemoryDurableStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            ledger: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every subsequent operation succeed (`true`) or fail as unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Get the number of unfired timers
    pub fn pending_timer_count(&self) -> usize {
        self.timers.read().values().filter(|t| !t.fired).count()
    }

    /// Get the number of ledger records
    pub fn ledger_len(&self) -> usize {
        self.ledger.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.timers.write().clear();
        self.ledger.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(StoreError::WorkflowAlreadyExists(workflow_id));
        }

        workflows.insert(
            workflow_id,
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status: WorkflowStatus::Running,
                input,
                result: None,
                error: None,
                events: vec![],
                created_at,
                updated_at: created_at,
                completed_at: None,
            },
        );
        Ok(())
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        self.check_available()?;
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(WorkflowInfo {
            id: workflow_id,
            workflow_type: workflow.workflow_type.clone(),
            status: workflow.status,
            input: workflow.input.clone(),
            result: workflow.result.clone(),
            error: workflow.error.clone(),
            position: workflow.events.len() as u64,
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
            completed_at: workflow.completed_at,
        })
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.status = status;
        workflow.result = result;
        workflow.error = error;
        workflow.updated_at = updated_at;
        if status.is_terminal() {
            workflow.completed_at = Some(updated_at);
        }
        Ok(())
    }

    async fn list_active_workflows(&self) -> Result<Vec<Uuid>, StoreError> {
        self.check_available()?;
        let mut active: Vec<(DateTime<Utc>, Uuid)> = self
            .workflows
            .read()
            .iter()
            .filter(|(_, w)| !w.status.is_terminal())
            .map(|(id, w)| (w.created_at, *id))
            .collect();
        active.sort();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }

    async fn archive_workflows(&self, completed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut workflows = self.workflows.write();
        let archived: Vec<Uuid> = workflows
            .iter()
            .filter(|(_, w)| w.status.is_terminal())
            .filter(|(_, w)| w.completed_at.is_some_and(|at| at < completed_before))
            .map(|(id, _)| *id)
            .collect();

        for id in &archived {
            workflows.remove(id);
        }
        drop(workflows);

        self.timers
            .write()
            .retain(|_, timer| !archived.contains(&timer.instance_id));

        Ok(archived.len() as u64)
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: u64,
        events: Vec<HistoryEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let current_sequence = workflow.events.len() as u64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        workflow.events.extend(events);
        workflow.updated_at = recorded_at;
        Ok(workflow.events.len() as u64)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<(u64, HistoryEvent)>, StoreError> {
        self.check_available()?;
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(workflow
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u64, e.clone()))
            .collect())
    }

    async fn insert_timer(&self, timer: &TimerEntry) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut timers = self.timers.write();
        if timers.contains_key(&timer.timer_id) {
            return Ok(false);
        }
        timers.insert(timer.timer_id.clone(), timer.clone());
        Ok(true)
    }

    async fn get_timer(&self, timer_id: &TimerId) -> Result<Option<TimerEntry>, StoreError> {
        self.check_available()?;
        Ok(self.timers.read().get(timer_id).cloned())
    }

    async fn delete_timer(&self, timer_id: &TimerId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut timers = self.timers.write();
        match timers.get(timer_id) {
            Some(timer) if !timer.fired => {
                timers.remove(timer_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>, StoreError> {
        self.check_available()?;
        let mut timers = self.timers.write();
        let mut fired: Vec<TimerEntry> = timers
            .values_mut()
            .filter(|timer| timer.is_due(now))
            .map(|timer| {
                timer.fired = true;
                timer.clone()
            })
            .collect();
        fired.sort_by(|a, b| {
            a.deadline
                .cmp(&b.deadline)
                .then_with(|| a.timer_id.cmp(&b.timer_id))
        });
        Ok(fired)
    }

    async fn insert_ledger_record(
        &self,
        record: IdempotencyRecord,
    ) -> Result<RecordOutcome, StoreError> {
        self.check_available()?;
        let mut ledger = self.ledger.write();
        let key = record.key.to_string();
        if let Some(existing) = ledger.get(&key) {
            return Ok(RecordOutcome::AlreadyExists(existing.clone()));
        }
        ledger.insert(key, record.clone());
        Ok(RecordOutcome::Inserted(record))
    }

    async fn get_ledger_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.check_available()?;
        Ok(self.ledger.read().get(&key.to_string()).cloned())
    }

    async fn list_ledger_records(&self) -> Result<Vec<IdempotencyRecord>, StoreError> {
        self.check_available()?;
        let mut records: Vec<IdempotencyRecord> = self.ledger.read().values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
        });
        Ok(records)
    }

    async fn clear_ledger(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut ledger = self.ledger.write();
        let removed = ledger.len() as u64;
        ledger.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Amount;
    use crate::workflow::TimerPurpose;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = InMemoryDurableStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "charge", json!({"amount": "1.00"}), Utc::now())
            .await
            .unwrap();

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.workflow_type, "charge");
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(info.position, 0);
    }

    #[tokio::test]
    async fn test_create_duplicate_workflow() {
        let store = InMemoryDurableStore::new();
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "charge", json!({}), Utc::now())
            .await
            .unwrap();
        let err = store
            .create_workflow(workflow_id, "charge", json!({}), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkflowAlreadyExists(id) if id == workflow_id));
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let store = InMemoryDurableStore::new();
        let workflow_id = Uuid::now_v7();
        store
            .create_workflow(workflow_id, "charge", json!({}), Utc::now())
            .await
            .unwrap();

        let seq = store
            .append_events(
                workflow_id,
                0,
                vec![HistoryEvent::WorkflowStarted { input: json!({}) }],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let events = store.load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 0);
    }

    #[tokio::test]
    async fn test_concurrency_conflict() {
        let store = InMemoryDurableStore::new();
        let workflow_id = Uuid::now_v7();
        store
            .create_workflow(workflow_id, "charge", json!({}), Utc::now())
            .await
            .unwrap();
        store
            .append_events(
                workflow_id,
                0,
                vec![HistoryEvent::WorkflowStarted { input: json!({}) }],
                Utc::now(),
            )
            .await
            .unwrap();

        let result = store
            .append_events(
                workflow_id,
                0,
                vec![HistoryEvent::WorkflowCompleted { result: json!({}) }],
                Utc::now(),
            )
            .await;

        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_active_workflows_and_archive() {
        let store = InMemoryDurableStore::new();
        let done = Uuid::now_v7();
        let running = Uuid::now_v7();
        let t0 = Utc::now();

        store.create_workflow(done, "charge", json!({}), t0).await.unwrap();
        store.create_workflow(running, "charge", json!({}), t0).await.unwrap();
        store
            .update_workflow_status(done, WorkflowStatus::Completed, Some(json!("ok")), None, t0)
            .await
            .unwrap();

        assert_eq!(store.list_active_workflows().await.unwrap(), vec![running]);

        let cutoff = crate::clock::deadline_after(t0, Duration::from_secs(1));
        assert_eq!(store.archive_workflows(cutoff).await.unwrap(), 1);
        assert!(matches!(
            store.get_workflow_info(done).await,
            Err(StoreError::WorkflowNotFound(_))
        ));
        assert!(store.get_workflow_info(running).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryDurableStore::new();
        store.set_available(false);

        let err = store.list_active_workflows().await.unwrap_err();
        assert!(err.is_unavailable());

        store.set_available(true);
        assert!(store.list_active_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_insert_is_first_writer_wins() {
        let store = InMemoryDurableStore::new();
        let key = IdempotencyKey::new("c1", Amount::from_cents(500), "wf");

        let first = IdempotencyRecord::completed(key.clone(), json!(1), Utc::now());
        let second = IdempotencyRecord::completed(key.clone(), json!(2), Utc::now());

        assert!(store.insert_ledger_record(first).await.unwrap().is_inserted());
        let outcome = store.insert_ledger_record(second).await.unwrap();
        assert_eq!(outcome.record().result, json!(1));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_fire_due_timers_marks_fired() {
        let store = InMemoryDurableStore::new();
        let instance_id = Uuid::now_v7();
        let now = Utc::now();
        let timer = TimerEntry {
            timer_id: TimerId::new(instance_id, 1),
            instance_id,
            deadline: now,
            purpose: TimerPurpose::Sleep {
                duration: Duration::ZERO,
            },
            fired: false,
            created_at: now,
        };

        assert!(store.insert_timer(&timer).await.unwrap());
        assert!(!store.insert_timer(&timer).await.unwrap());
        assert_eq!(store.pending_timer_count(), 1);

        assert_eq!(store.fire_due_timers(now).await.unwrap().len(), 1);
        assert!(store.fire_due_timers(now).await.unwrap().is_empty());
        assert_eq!(store.pending_timer_count(), 0);
    }
}
