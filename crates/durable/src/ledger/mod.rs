//! Idempotency ledger
//!
//! The ledger is the at-most-once guard for external side effects. Every
//! effect is keyed by an [`IdempotencyKey`]; inserting a record is atomic
//! through the store's uniqueness constraint, so under any number of
//! concurrent or repeated `record` calls exactly one observes
//! [`RecordOutcome::Inserted`].

mod key;
mod record;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

pub use key::{Amount, IdempotencyKey, KeyParseError};
pub use record::{IdempotencyRecord, LedgerError, RecordOutcome, RecordStatus};

use crate::clock::Clock;
use crate::persistence::DurableStore;

/// Durable key → record store for side effects
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyLedger {
    /// Create a ledger over the given store
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a completed effect for `key`
    ///
    /// Returns `AlreadyExists` with the original record when the key is
    /// already present; the stored payload is never overwritten.
    #[instrument(skip(self, result), fields(key = %key))]
    pub async fn record(
        &self,
        key: &IdempotencyKey,
        result: serde_json::Value,
    ) -> Result<RecordOutcome, LedgerError> {
        let record = IdempotencyRecord::completed(key.clone(), result, self.clock.now());
        let outcome = self.store.insert_ledger_record(record).await?;

        match &outcome {
            RecordOutcome::Inserted(_) => info!(key = %key, "effect recorded"),
            RecordOutcome::AlreadyExists(existing) => warn!(
                key = %key,
                recorded_at = %existing.created_at,
                "duplicate effect detected, keeping original record"
            ),
        }

        Ok(outcome)
    }

    /// Look up the record for `key`
    pub async fn lookup(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let record = self.store.get_ledger_record(key).await?;
        debug!(key = %key, found = record.is_some(), "ledger lookup");
        Ok(record)
    }

    /// All records, newest first
    pub async fn list(&self) -> Result<Vec<IdempotencyRecord>, LedgerError> {
        Ok(self.store.list_ledger_records().await?)
    }

    /// Remove every record
    ///
    /// Administrative use only. Returns the number of records removed.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<u64, LedgerError> {
        let removed = self.store.clear_ledger().await?;
        warn!(removed, "idempotency ledger reset");
        Ok(removed)
    }
}

impl std::fmt::Debug for IdempotencyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyLedger").finish_non_exhaustive()
    }
}
