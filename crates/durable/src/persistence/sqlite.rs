//! SQLite implementation of DurableStore
//!
//! File-backed persistence for single-process deployments:
//! - WAL journal with a busy timeout, so readers never block the writer
//! - Optimistic concurrency on history via `(instance_id, sequence_no)`
//! - Ledger uniqueness through the `idempotency_key` primary key
//! - Timer claiming with a single `UPDATE ... RETURNING` statement
//!
//! Timestamps are stored as Unix milliseconds.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::ledger::{Amount, IdempotencyKey, IdempotencyRecord, RecordOutcome, RecordStatus};
use crate::timer::{TimerEntry, TimerId};
use crate::workflow::{HistoryEvent, TimerPurpose, WorkflowError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_instances (
        id TEXT PRIMARY KEY,
        workflow_type TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        result TEXT,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_workflow_instances_status
        ON workflow_instances(status, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_history (
        instance_id TEXT NOT NULL,
        sequence_no INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        event_payload TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (instance_id, sequence_no)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS durable_timers (
        timer_id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL,
        deadline INTEGER NOT NULL,
        purpose TEXT NOT NULL,
        fired INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_durable_timers_due
        ON durable_timers(fired, deadline)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_ledger (
        idempotency_key TEXT PRIMARY KEY,
        customer_id TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        status TEXT NOT NULL,
        result TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
];

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// SQLite implementation of DurableStore
///
/// # Example
///
/// ```ignore
/// use oncepay_durable::SqliteDurableStore;
///
/// let store = SqliteDurableStore::open("oncepay.db").await?;
/// ```
#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    /// Connect to a SQLite database URL (e.g. `sqlite://oncepay.db`) and
    /// create the schema if needed
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| db_error("parse database url", e))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        options = if is_memory {
            options
                .journal_mode(SqliteJournalMode::Memory)
                .synchronous(SqliteSynchronous::Off)
        } else {
            options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        // An in-memory database lives and dies with its connection.
        let max_connections = if is_memory { 1 } else { 5 };
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if is_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect", e))?;

        let store = Self { pool };
        store.create_schema().await?;
        debug!(database_url, "sqlite store ready");
        Ok(store)
    }

    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}", path.as_ref().display());
        Self::connect(&url).await
    }

    /// Private in-memory database, for tests
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("create schema", e))?;
        }
        Ok(())
    }
}

/// Map a sqlx error, classifying lock contention and connectivity as
/// [`StoreError::Unavailable`]
fn db_error(operation: &str, err: sqlx::Error) -> StoreError {
    let message = err.to_string();
    let unavailable = matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    ) || message.contains("database is locked")
        || message.contains("SQLITE_BUSY");

    if unavailable {
        debug!(operation, error = %message, "sqlite unavailable");
        StoreError::Unavailable(format!("{operation}: {message}"))
    } else {
        error!(operation, error = %message, "sqlite error");
        StoreError::Database(format!("{operation}: {message}"))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {millis}")))
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("column {name}: {e}")))
}

fn timer_from_row(row: &SqliteRow) -> Result<TimerEntry, StoreError> {
    let purpose: String = column(row, "purpose")?;
    Ok(TimerEntry {
        timer_id: TimerId::from_raw(column::<String>(row, "timer_id")?),
        instance_id: parse_uuid(&column::<String>(row, "instance_id")?)?,
        deadline: from_millis(column(row, "deadline")?)?,
        purpose: serde_json::from_str::<TimerPurpose>(&purpose)?,
        fired: column::<i64>(row, "fired")? != 0,
        created_at: from_millis(column(row, "created_at")?)?,
    })
}

fn ledger_from_row(row: &SqliteRow) -> Result<IdempotencyRecord, StoreError> {
    let key: String = column(row, "idempotency_key")?;
    let status: String = column(row, "status")?;
    let result: String = column(row, "result")?;
    Ok(IdempotencyRecord {
        key: key
            .parse::<IdempotencyKey>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        customer_id: column(row, "customer_id")?,
        amount: Amount::from_cents(column(row, "amount_cents")?),
        status: status
            .parse::<RecordStatus>()
            .map_err(StoreError::Serialization)?,
        result: serde_json::from_str(&result)?,
        created_at: from_millis(column(row, "created_at")?)?,
    })
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    #[instrument(skip(self, input))]
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = to_millis(created_at);
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (id, workflow_type, status, input, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(workflow_type)
        .bind(WorkflowStatus::Running.as_str())
        .bind(serde_json::to_string(&input)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::WorkflowAlreadyExists(workflow_id)
            } else {
                db_error("create workflow", e)
            }
        })?;

        Ok(())
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT w.workflow_type, w.status, w.input, w.result, w.error,
                   w.created_at, w.updated_at, w.completed_at,
                   (SELECT COUNT(*) FROM workflow_history h WHERE h.instance_id = w.id) AS position
            FROM workflow_instances w
            WHERE w.id = ?1
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get workflow", e))?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let status: String = column(&row, "status")?;
        let input: String = column(&row, "input")?;
        let result: Option<String> = column(&row, "result")?;
        let error: Option<String> = column(&row, "error")?;
        let completed_at: Option<i64> = column(&row, "completed_at")?;

        Ok(WorkflowInfo {
            id: workflow_id,
            workflow_type: column(&row, "workflow_type")?,
            status: status.parse()?,
            input: serde_json::from_str(&input)?,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            error: error
                .map(|e| serde_json::from_str::<WorkflowError>(&e))
                .transpose()?,
            position: column::<i64>(&row, "position")? as u64,
            created_at: from_millis(column(&row, "created_at")?)?,
            updated_at: from_millis(column(&row, "updated_at")?)?,
            completed_at: completed_at.map(from_millis).transpose()?,
        })
    }

    #[instrument(skip(self, result, error))]
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = result.map(|r| serde_json::to_string(&r)).transpose()?;
        let error = error.map(|e| serde_json::to_string(&e)).transpose()?;
        let now = to_millis(updated_at);
        let completed_at = status.is_terminal().then_some(now);

        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?2, result = ?3, error = ?4, updated_at = ?5,
                completed_at = COALESCE(?6, completed_at)
            WHERE id = ?1
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(now)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update workflow status", e))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    async fn list_active_workflows(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT id FROM workflow_instances WHERE status NOT IN {TERMINAL_STATUSES} \
             ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list active workflows", e))?;

        rows.iter()
            .map(|row| parse_uuid(&column::<String>(row, "id")?))
            .collect()
    }

    #[instrument(skip(self))]
    async fn archive_workflows(&self, completed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = to_millis(completed_before);
        let archived_ids = format!(
            "SELECT id FROM workflow_instances \
             WHERE status IN {TERMINAL_STATUSES} AND completed_at < ?1"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin archive", e))?;

        for table in ["workflow_history", "durable_timers"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE instance_id IN ({archived_ids})"
            ))
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("archive children", e))?;
        }

        let removed = sqlx::query(&format!(
            "DELETE FROM workflow_instances WHERE id IN ({archived_ids})"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("archive instances", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| db_error("commit archive", e))?;

        debug!(removed, "archived workflows");
        Ok(removed)
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: u64,
        events: Vec<HistoryEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let id = workflow_id.to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin append", e))?;

        let row = sqlx::query(
            r#"
            SELECT EXISTS(SELECT 1 FROM workflow_instances WHERE id = ?1) AS present,
                   (SELECT COUNT(*) FROM workflow_history WHERE instance_id = ?1) AS next_seq
            "#,
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("read sequence", e))?;

        if column::<i64>(&row, "present")? == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        let current_sequence = column::<i64>(&row, "next_seq")? as u64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let recorded_at = to_millis(recorded_at);
        let mut new_sequence = current_sequence;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO workflow_history (instance_id, sequence_no, event_type, event_payload, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&id)
            .bind(new_sequence as i64)
            .bind(event.event_type())
            .bind(serde_json::to_string(&event)?)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::ConcurrencyConflict {
                        expected: expected_sequence,
                        actual: new_sequence + 1,
                    }
                } else {
                    db_error("insert event", e)
                }
            })?;

            new_sequence += 1;
        }

        sqlx::query("UPDATE workflow_instances SET updated_at = ?2 WHERE id = ?1")
            .bind(&id)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("touch workflow", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit append", e))?;

        debug!(%workflow_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<(u64, HistoryEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_no, event_payload
            FROM workflow_history
            WHERE instance_id = ?1
            ORDER BY sequence_no
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load events", e))?;

        if rows.is_empty() {
            // Distinguish "no history yet" from "no such instance".
            self.get_workflow_info(workflow_id).await?;
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq = column::<i64>(&row, "sequence_no")? as u64;
            let payload: String = column(&row, "event_payload")?;
            events.push((seq, serde_json::from_str(&payload)?));
        }

        Ok(events)
    }

    async fn insert_timer(&self, timer: &TimerEntry) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_timers (timer_id, instance_id, deadline, purpose, fired, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(timer_id) DO NOTHING
            "#,
        )
        .bind(timer.timer_id.as_str())
        .bind(timer.instance_id.to_string())
        .bind(to_millis(timer.deadline))
        .bind(serde_json::to_string(&timer.purpose)?)
        .bind(timer.fired)
        .bind(to_millis(timer.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert timer", e))?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn get_timer(&self, timer_id: &TimerId) -> Result<Option<TimerEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT timer_id, instance_id, deadline, purpose, fired, created_at
            FROM durable_timers
            WHERE timer_id = ?1
            "#,
        )
        .bind(timer_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get timer", e))?;

        row.as_ref().map(timer_from_row).transpose()
    }

    async fn delete_timer(&self, timer_id: &TimerId) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM durable_timers WHERE timer_id = ?1 AND fired = 0")
            .bind(timer_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete timer", e))?;

        Ok(deleted.rows_affected() == 1)
    }

    async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_timers
            SET fired = 1
            WHERE fired = 0 AND deadline <= ?1
            RETURNING timer_id, instance_id, deadline, purpose, fired, created_at
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("fire due timers", e))?;

        let mut fired = rows
            .iter()
            .map(timer_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        fired.sort_by(|a, b| {
            a.deadline
                .cmp(&b.deadline)
                .then_with(|| a.timer_id.cmp(&b.timer_id))
        });
        Ok(fired)
    }

    #[instrument(skip(self, record), fields(key = %record.key))]
    async fn insert_ledger_record(
        &self,
        record: IdempotencyRecord,
    ) -> Result<RecordOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_ledger
                (idempotency_key, customer_id, amount_cents, status, result, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.key.to_string())
        .bind(&record.customer_id)
        .bind(record.amount.cents())
        .bind(record.status.to_string())
        .bind(serde_json::to_string(&record.result)?)
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert ledger record", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(RecordOutcome::Inserted(record));
        }

        let existing = self.get_ledger_record(&record.key).await?.ok_or_else(|| {
            StoreError::Database(format!("ledger record {} vanished after conflict", record.key))
        })?;
        Ok(RecordOutcome::AlreadyExists(existing))
    }

    async fn get_ledger_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, customer_id, amount_cents, status, result, created_at
            FROM idempotency_ledger
            WHERE idempotency_key = ?1
            "#,
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get ledger record", e))?;

        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn list_ledger_records(&self) -> Result<Vec<IdempotencyRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT idempotency_key, customer_id, amount_cents, status, result, created_at
            FROM idempotency_ledger
            ORDER BY created_at DESC, idempotency_key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list ledger records", e))?;

        rows.iter().map(ledger_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn clear_ledger(&self) -> Result<u64, StoreError> {
        let removed = sqlx::query("DELETE FROM idempotency_ledger")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("clear ledger", e))?;

        Ok(removed.rows_affected())
    }
}
