//! Workflow dispatcher
//!
//! Single consumer of the engine's work queue. Every trigger (start, timer
//! fired, activity result, cancel, recovery resume) becomes a [`WorkItem`];
//! the dispatcher resumes the instance under a per-instance lock and hands
//! activity invocations to the [`ActivityWorkerPool`]. A sweep loop claims
//! due timers and turns them into work items.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::pool::ActivityWorkerPool;
use crate::activity::{ActivityEngine, ActivityOutcome};
use crate::config::EngineConfig;
use crate::engine::{ExecutorError, ResumeOutcome, Trigger, WorkflowExecutor};
use crate::persistence::{StoreError, WorkflowStatus};

/// One unit of work for the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub instance_id: Uuid,
    pub trigger: Trigger,
}

impl WorkItem {
    pub fn new(instance_id: Uuid, trigger: Trigger) -> Self {
        Self {
            instance_id,
            trigger,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent resumptions
    pub concurrency: usize,
    /// Maximum concurrent activity attempts
    pub activity_concurrency: usize,
    /// Timer sweep interval
    pub timer_sweep_interval: Duration,
    /// Interval of the scan for instances started elsewhere
    pub instance_poll_interval: Duration,
    /// Delay before a resumption that hit unavailable storage is retried
    pub storage_retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for DispatcherConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.dispatcher_concurrency.max(1),
            activity_concurrency: config.activity_concurrency.max(1),
            timer_sweep_interval: config.timer_sweep_interval,
            instance_poll_interval: config.instance_poll_interval,
            storage_retry_delay: config.storage_retry_delay,
        }
    }
}

/// Routes work items to the executor and the activity pool
pub struct Dispatcher {
    executor: WorkflowExecutor,
    pool: ActivityWorkerPool,
    sender: mpsc::UnboundedSender<WorkItem>,
    receiver: Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
    /// Items waiting out a storage retry delay
    delayed: Arc<AtomicUsize>,
    /// Items taken off the queue and not yet processed
    processing: Arc<AtomicUsize>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        executor: WorkflowExecutor,
        activities: ActivityEngine,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pool = ActivityWorkerPool::new(activities, sender.clone(), config.activity_concurrency);

        Arc::new(Self {
            executor,
            pool,
            sender,
            receiver: Mutex::new(receiver),
            locks: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            delayed: Arc::new(AtomicUsize::new(0)),
            processing: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    pub fn pool(&self) -> &ActivityWorkerPool {
        &self.pool
    }

    /// Queue a trigger for `instance_id`
    pub fn enqueue(&self, instance_id: Uuid, trigger: Trigger) {
        debug!(%instance_id, trigger = trigger.kind(), "work item queued");
        // The dispatcher owns the receiver, so the channel is open while
        // `self` is alive.
        let _ = self.sender.send(WorkItem::new(instance_id, trigger));
    }

    /// Queue a resume for every non-terminal instance
    ///
    /// Run once at startup. Resuming re-creates lost timers, records fired
    /// ones and re-submits activities whose attempt was interrupted.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let active = self.executor.store().list_active_workflows().await?;
        for instance_id in &active {
            self.enqueue(*instance_id, Trigger::Resume);
        }
        info!(count = active.len(), "recovering active workflows");
        Ok(active.len())
    }

    /// Claim due timers and queue a `TimerFired` item for each
    pub async fn sweep_timers(&self) -> Result<usize, StoreError> {
        let fired = self.executor.timers().fire_due().await?;
        for timer in &fired {
            debug!(instance_id = %timer.instance_id, timer_id = %timer.timer_id, "timer due");
            self.enqueue(timer.instance_id, Trigger::TimerFired(timer.timer_id.clone()));
        }
        Ok(fired.len())
    }

    /// Queue a resume for `Running` instances this dispatcher has not seen
    ///
    /// Picks up workflows started by another process sharing the database.
    pub async fn discover_started(&self) -> Result<usize, StoreError> {
        let store = self.executor.store();
        let mut found = 0;
        for instance_id in store.list_active_workflows().await? {
            if self.locks.contains_key(&instance_id) {
                continue;
            }
            if store.get_workflow_info(instance_id).await?.status == WorkflowStatus::Running {
                self.enqueue(instance_id, Trigger::Resume);
                found += 1;
            }
        }
        if found > 0 {
            debug!(count = found, "discovered started workflows");
        }
        Ok(found)
    }

    /// Resume one instance under its lock
    ///
    /// Activity invocations in the outcome are submitted to the pool before
    /// the lock is released. A cancel also signals the instance's running
    /// attempts.
    #[instrument(skip(self, item), fields(instance_id = %item.instance_id, trigger = item.trigger.kind()))]
    pub async fn process(&self, item: WorkItem) -> Result<ResumeOutcome, ExecutorError> {
        let instance_id = item.instance_id;
        let lock = self.lock_for(instance_id);

        let cancelling = matches!(item.trigger, Trigger::Cancel { .. });
        let outcome = {
            let _guard = lock.lock().await;
            let outcome = self.executor.resume(instance_id, item.trigger).await?;
            match &outcome {
                ResumeOutcome::AwaitingActivity { invocation } => {
                    self.pool.submit(invocation.clone());
                }
                ResumeOutcome::Cancelled { .. } if cancelling => {
                    let signalled = self.pool.cancel_instance(instance_id);
                    if signalled > 0 {
                        info!(%instance_id, attempts = signalled, "signalled running attempts to stop");
                    }
                }
                _ => {}
            }
            outcome
        };

        if outcome.is_terminal() {
            drop(lock);
            self.locks
                .remove_if(&instance_id, |_, lock| Arc::strong_count(lock) == 1);
        }
        Ok(outcome)
    }

    /// Process an item, retrying it later when storage is unavailable
    async fn handle(&self, item: WorkItem) {
        if let Trigger::ActivityResult {
            activity_id,
            attempt,
            outcome: ActivityOutcome::Interrupted { error },
        } = &item.trigger
        {
            // Same attempt again, once storage has had time to come back.
            warn!(
                instance_id = %item.instance_id,
                %activity_id,
                attempt,
                error = %error,
                delay_ms = self.config.storage_retry_delay.as_millis() as u64,
                "activity attempt interrupted, will re-drive"
            );
            self.retry_later(WorkItem::new(item.instance_id, Trigger::Resume));
            return;
        }

        let retry = item.clone();
        match self.process(item).await {
            Ok(outcome) => {
                debug!(instance_id = %retry.instance_id, phase = ?outcome.phase(), "work item processed");
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    instance_id = %retry.instance_id,
                    trigger = retry.trigger.kind(),
                    error = %e,
                    delay_ms = self.config.storage_retry_delay.as_millis() as u64,
                    "resumption failed, will retry"
                );
                self.retry_later(retry);
            }
            Err(e) => {
                // Instance keeps its status and history; an operator decides.
                error!(
                    instance_id = %retry.instance_id,
                    trigger = retry.trigger.kind(),
                    error = %e,
                    "resumption failed"
                );
            }
        }
    }

    fn retry_later(&self, item: WorkItem) {
        let sender = self.sender.clone();
        let delayed = Arc::clone(&self.delayed);
        let delay = self.config.storage_retry_delay;

        delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(item);
            delayed.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process everything currently queued, one item at a time
    ///
    /// Returns the number of items processed.
    pub async fn tick(&self) -> usize {
        let mut processed = 0;
        loop {
            let item = {
                let mut receiver = self.receiver.lock().await;
                receiver.try_recv().ok()
            };
            let Some(item) = item else {
                return processed;
            };
            self.handle(item).await;
            processed += 1;
        }
    }

    /// Sweep and process until nothing is queued, delayed or in flight
    ///
    /// Instances waiting on timers that are not yet due do not keep this
    /// running.
    pub async fn run_until_idle(&self) {
        loop {
            if let Err(e) = self.sweep_timers().await {
                warn!(error = %e, "timer sweep failed");
            }
            // Sampled before draining: once nothing is in flight, nothing
            // can be queued behind our back.
            let idle = self.is_idle();
            let processed = self.tick().await;
            if processed == 0 && idle {
                return;
            }
            if processed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    /// Whether no item is being processed, waiting out a retry delay or
    /// running in the pool
    ///
    /// Items already sitting in the queue are not counted.
    pub fn is_idle(&self) -> bool {
        self.processing.load(Ordering::SeqCst) == 0
            && self.delayed.load(Ordering::SeqCst) == 0
            && self.pool.in_flight() == 0
    }

    /// Run the dispatch loop until `shutdown` flips to `true`
    ///
    /// Resumptions run concurrently up to the configured bound; items for
    /// the same instance serialize on its lock.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            activity_concurrency = self.config.activity_concurrency,
            sweep_ms = self.config.timer_sweep_interval.as_millis() as u64,
            "Starting dispatcher"
        );

        let mut receiver = self.receiver.lock().await;
        let mut sweep = tokio::time::interval(self.config.timer_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discover = tokio::time::interval(self.config.instance_poll_interval);
        discover.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("Dispatcher: shutdown requested");
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_timers().await {
                        warn!(error = %e, "timer sweep failed");
                    }
                }
                _ = discover.tick() => {
                    if let Err(e) = self.discover_started().await {
                        warn!(error = %e, "instance discovery failed");
                    }
                }
                item = receiver.recv() => {
                    let Some(item) = item else { break };
                    let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                        break;
                    };
                    let dispatcher = Arc::clone(&self);
                    dispatcher.processing.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        dispatcher.handle(item).await;
                        dispatcher.processing.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
            }
        }

        info!("Dispatcher stopped");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("locked_instances", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    use crate::clock::ManualClock;
    use crate::engine::WorkflowRegistry;
    use crate::ledger::{Amount, IdempotencyKey, IdempotencyLedger};
    use crate::persistence::{DurableStore, InMemoryDurableStore};
    use crate::timer::TimerId;
    use crate::reliability::RetryPolicy;
    use crate::workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowContext};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    struct Echo {
        calls: Arc<AtomicU32>,
        /// Store the first call takes down for a while after its effect
        outage: Option<Arc<InMemoryDurableStore>>,
    }

    #[async_trait]
    impl Activity for Echo {
        const TYPE: &'static str = "echo";
        type Input = Value;
        type Output = Value;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let (1, Some(store)) = (call, &self.outage) {
                store.set_available(false);
                let store = Arc::clone(store);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    store.set_available(true);
                });
            }
            Ok(input)
        }
    }

    /// Sleeps `secs`, echoes the input, completes with the echo
    struct SleepThenEcho {
        instance_id: Uuid,
        secs: u64,
    }

    impl Workflow for SleepThenEcho {
        const TYPE: &'static str = "sleep_then_echo";
        type Input = u64;
        type Output = Value;

        fn new(ctx: &WorkflowContext, input: Self::Input) -> Self {
            Self {
                instance_id: ctx.instance_id,
                secs: input,
            }
        }

        fn on_start(&mut self) -> WorkflowAction {
            WorkflowAction::sleep(Duration::from_secs(self.secs))
        }

        fn on_timer_fired(&mut self, _timer_id: &TimerId) -> WorkflowAction {
            let key = IdempotencyKey::new("c1", Amount::from_cents(500), self.instance_id.to_string());
            WorkflowAction::call_activity("echo", "echo", json!({"secs": self.secs}), key)
                .with_options(
                    ActivityOptions::default()
                        .with_retry(RetryPolicy::exponential().with_max_attempts(1)),
                )
        }

        fn on_activity_completed(&mut self, _activity_id: &str, result: Value) -> WorkflowAction {
            WorkflowAction::complete(result)
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        store: Arc<InMemoryDurableStore>,
        clock: ManualClock,
        calls: Arc<AtomicU32>,
    }

    fn fixture() -> Fixture {
        fixture_with_outage(false)
    }

    fn fixture_with_outage(outage: bool) -> Fixture {
        let store = Arc::new(InMemoryDurableStore::new());
        let clock = ManualClock::starting_now();
        let calls = Arc::new(AtomicU32::new(0));

        let workflows = WorkflowRegistry::new().with::<SleepThenEcho>();
        let activities = ActivityRegistry::new().with(Echo {
            calls: calls.clone(),
            outage: outage.then(|| store.clone()),
        });
        let executor =
            WorkflowExecutor::new(store.clone(), Arc::new(workflows), Arc::new(clock.clone()));
        let ledger = IdempotencyLedger::new(store.clone(), Arc::new(clock.clone()));
        let engine = ActivityEngine::new(Arc::new(activities), ledger);
        let config = DispatcherConfig {
            storage_retry_delay: Duration::from_millis(10),
            ..DispatcherConfig::default()
        };

        Fixture {
            dispatcher: Dispatcher::new(executor, engine, config),
            store,
            clock,
            calls,
        }
    }

    impl Fixture {
        async fn start(&self, secs: u64) -> Uuid {
            let id = Uuid::now_v7();
            self.dispatcher
                .executor()
                .start(id, SleepThenEcho::TYPE, json!(secs))
                .await
                .unwrap();
            self.dispatcher.enqueue(id, Trigger::Start);
            id
        }

        async fn status(&self, id: Uuid) -> WorkflowStatus {
            self.store.get_workflow_info(id).await.unwrap().status
        }
    }

    #[tokio::test]
    async fn test_run_until_idle_stops_at_pending_timer() {
        let f = fixture();
        let id = f.start(10).await;

        f.dispatcher.run_until_idle().await;
        assert_eq!(f.status(id).await, WorkflowStatus::AwaitingTimer);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        f.clock.advance(Duration::from_secs(10));
        f.dispatcher.run_until_idle().await;

        let info = f.store.get_workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!({"secs": 10})));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_storage_is_retried() {
        let f = fixture();
        let id = f.start(0).await;

        f.store.set_available(false);
        assert_eq!(f.dispatcher.tick().await, 1);
        assert!(!f.dispatcher.is_idle());

        f.store.set_available(true);
        f.dispatcher.run_until_idle().await;
        assert_eq!(f.status(id).await, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_outage_after_effect_does_not_fail_workflow() {
        let f = fixture_with_outage(true);
        let id = f.start(0).await;

        // The only attempt runs its effect, then the ledger write cannot land.
        f.dispatcher.run_until_idle().await;

        assert_eq!(f.status(id).await, WorkflowStatus::Completed);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.store.ledger_len(), 1);
        let kinds: Vec<_> = f
            .store
            .load_events(id)
            .await
            .unwrap()
            .iter()
            .map(|(_, e)| e.event_type())
            .collect();
        assert!(!kinds.contains(&"activity_failed"));
        assert_eq!(kinds.last(), Some(&"workflow_completed"));
    }

    #[tokio::test]
    async fn test_recover_resumes_active_instances() {
        let f = fixture();
        let a = f.start(5).await;
        let b = f.start(5).await;
        f.dispatcher.run_until_idle().await;

        // Lose the queue; recovery finds both instances from storage.
        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.dispatcher.recover().await.unwrap(), 2);
        f.dispatcher.run_until_idle().await;

        assert_eq!(f.status(a).await, WorkflowStatus::Completed);
        assert_eq!(f.status(b).await, WorkflowStatus::Completed);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_discover_picks_up_foreign_starts() {
        let f = fixture();
        // Started through the executor only, as another process would.
        let id = Uuid::now_v7();
        f.dispatcher
            .executor()
            .start(id, SleepThenEcho::TYPE, json!(0))
            .await
            .unwrap();

        assert_eq!(f.dispatcher.discover_started().await.unwrap(), 1);
        f.dispatcher.run_until_idle().await;
        assert_eq!(f.status(id).await, WorkflowStatus::Completed);
        assert_eq!(f.dispatcher.discover_started().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let f = fixture();
        let id = f.start(0).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&f.dispatcher).run(rx));
        for _ in 0..200 {
            if f.status(id).await == WorkflowStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.status(id).await, WorkflowStatus::Completed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
