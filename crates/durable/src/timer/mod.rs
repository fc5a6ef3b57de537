//! Durable timer subsystem
//!
//! Timers are persisted wake-up requests keyed by an absolute deadline. They
//! live in the store rather than in a task or thread, so a timer scheduled
//! before a crash is still there after a restart and fires on the first sweep
//! past its deadline. [`TimerService::due_timers`] marks timers fired
//! atomically, which makes delivery at-most-once per timer.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::persistence::{DurableStore, StoreError};
use crate::workflow::TimerPurpose;

/// Identifier of a durable timer
///
/// Derived from the owning instance and the history position of its
/// `TimerScheduled` event, so replay produces the same id every time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(String);

impl TimerId {
    /// Timer id for the event at `sequence` in `instance_id`'s history
    pub fn new(instance_id: Uuid, sequence: u64) -> Self {
        Self(format!("{instance_id}/timer/{sequence}"))
    }

    /// Wrap an id read back from storage
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted timer
#[derive(Debug, Clone, PartialEq)]
pub struct TimerEntry {
    pub timer_id: TimerId,
    pub instance_id: Uuid,
    pub deadline: DateTime<Utc>,
    pub purpose: TimerPurpose,
    pub fired: bool,
    pub created_at: DateTime<Utc>,
}

impl TimerEntry {
    /// Whether the timer is unfired and its deadline has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.fired && self.deadline <= now
    }
}

/// Schedules, cancels and fires durable timers
#[derive(Clone)]
pub struct TimerService {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl TimerService {
    /// Create a timer service over the given store
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current time on the engine clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist a timer for `instance_id` firing at `deadline`
    ///
    /// Idempotent on `timer_id`: scheduling an id that already exists (for
    /// example when re-driving an instance after a crash) leaves the existing
    /// entry untouched.
    #[instrument(skip(self, purpose), fields(%instance_id, %timer_id, %deadline))]
    pub async fn schedule(
        &self,
        instance_id: Uuid,
        timer_id: TimerId,
        deadline: DateTime<Utc>,
        purpose: TimerPurpose,
    ) -> Result<TimerId, StoreError> {
        let entry = TimerEntry {
            timer_id: timer_id.clone(),
            instance_id,
            deadline,
            purpose,
            fired: false,
            created_at: self.clock.now(),
        };

        if self.store.insert_timer(&entry).await? {
            debug!(%instance_id, %timer_id, %deadline, "timer scheduled");
        } else {
            debug!(%instance_id, %timer_id, "timer already scheduled");
        }

        Ok(timer_id)
    }

    /// Cancel an unfired timer
    ///
    /// Returns `false` when the timer is unknown or has already fired.
    pub async fn cancel(&self, timer_id: &TimerId) -> Result<bool, StoreError> {
        let cancelled = self.store.delete_timer(timer_id).await?;
        if cancelled {
            info!(%timer_id, "timer cancelled");
        }
        Ok(cancelled)
    }

    /// Claim every unfired timer with `deadline <= now`
    ///
    /// Claimed timers are marked fired in the same store operation, so two
    /// concurrent sweeps never return the same timer.
    pub async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>, StoreError> {
        let fired = self.store.fire_due_timers(now).await?;
        if !fired.is_empty() {
            debug!(count = fired.len(), %now, "timers fired");
        }
        Ok(fired)
    }

    /// Claim timers due at the current clock time
    pub async fn fire_due(&self) -> Result<Vec<TimerEntry>, StoreError> {
        self.due_timers(self.clock.now()).await
    }

    /// Read a timer entry
    pub async fn get(&self, timer_id: &TimerId) -> Result<Option<TimerEntry>, StoreError> {
        self.store.get_timer(timer_id).await
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService").finish_non_exhaustive()
    }
}
