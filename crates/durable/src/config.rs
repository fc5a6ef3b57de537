//! Engine configuration

use std::time::Duration;

use crate::engine::ExecutorConfig;

/// Configuration for the durable runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrent workflow resumptions
    pub dispatcher_concurrency: usize,
    /// Maximum concurrent activity attempts
    pub activity_concurrency: usize,
    /// How often the dispatcher claims due timers
    pub timer_sweep_interval: Duration,
    /// How often the dispatcher looks for instances started by other processes
    pub instance_poll_interval: Duration,
    /// Delay before re-running a resumption that hit unavailable storage
    pub storage_retry_delay: Duration,
    /// In-attempt retries of a ledger write that hit unavailable storage
    pub ledger_record_attempts: u32,
    /// How long finished instances are kept before archival
    pub retention: Duration,
    /// Poll interval of `get_result`
    pub result_poll_interval: Duration,
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher_concurrency: 16,
            activity_concurrency: 8,
            timer_sweep_interval: Duration::from_millis(250),
            instance_poll_interval: Duration::from_secs(1),
            storage_retry_delay: Duration::from_millis(500),
            ledger_record_attempts: 3,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            result_poll_interval: Duration::from_millis(100),
            max_events_per_workflow: ExecutorConfig::default().max_events_per_workflow,
        }
    }
}

impl EngineConfig {
    /// Create configuration from `ONCEPAY_*` environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            dispatcher_concurrency: env_parse("ONCEPAY_DISPATCHER_CONCURRENCY")
                .unwrap_or(defaults.dispatcher_concurrency),
            activity_concurrency: env_parse("ONCEPAY_ACTIVITY_CONCURRENCY")
                .unwrap_or(defaults.activity_concurrency),
            timer_sweep_interval: env_parse("ONCEPAY_TIMER_SWEEP_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.timer_sweep_interval),
            instance_poll_interval: env_parse("ONCEPAY_INSTANCE_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.instance_poll_interval),
            storage_retry_delay: env_parse("ONCEPAY_STORAGE_RETRY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.storage_retry_delay),
            ledger_record_attempts: env_parse("ONCEPAY_LEDGER_RECORD_ATTEMPTS")
                .map(|n: u32| n.max(1))
                .unwrap_or(defaults.ledger_record_attempts),
            retention: env_parse("ONCEPAY_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            result_poll_interval: env_parse("ONCEPAY_RESULT_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.result_poll_interval),
            max_events_per_workflow: env_parse("ONCEPAY_MAX_EVENTS_PER_WORKFLOW")
                .unwrap_or(defaults.max_events_per_workflow),
        }
    }

    /// Set maximum concurrent resumptions
    pub fn with_dispatcher_concurrency(mut self, max: usize) -> Self {
        self.dispatcher_concurrency = max.max(1);
        self
    }

    /// Set maximum concurrent activity attempts
    pub fn with_activity_concurrency(mut self, max: usize) -> Self {
        self.activity_concurrency = max.max(1);
        self
    }

    pub fn with_timer_sweep_interval(mut self, interval: Duration) -> Self {
        self.timer_sweep_interval = interval;
        self
    }

    pub fn with_instance_poll_interval(mut self, interval: Duration) -> Self {
        self.instance_poll_interval = interval;
        self
    }

    pub fn with_storage_retry_delay(mut self, delay: Duration) -> Self {
        self.storage_retry_delay = delay;
        self
    }

    /// Set in-attempt retries of ledger writes (at least one write)
    pub fn with_ledger_record_attempts(mut self, attempts: u32) -> Self {
        self.ledger_record_attempts = attempts.max(1);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }

    pub fn with_max_events_per_workflow(mut self, max: usize) -> Self {
        self.max_events_per_workflow = max;
        self
    }

    /// Executor settings derived from this config
    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_events_per_workflow: self.max_events_per_workflow,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
