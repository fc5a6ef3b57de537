//! Time sources for the engine
//!
//! Timer deadlines are absolute instants, so every component that computes or
//! compares a deadline reads the time through a [`Clock`]. Production code uses
//! [`SystemClock`]; tests drive time explicitly with [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Source of "now" for deadline arithmetic
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by [`Utc::now`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// the runtime and keep another to advance time.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use oncepay_durable::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::starting_now();
/// let before = clock.now();
/// clock.advance(Duration::from_secs(10));
/// assert_eq!((clock.now() - before).num_seconds(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Create a clock frozen at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now = deadline_after(*now, by);
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Absolute deadline `duration` after `from`, saturating at the max instant
pub fn deadline_after(from: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
