//! Shared harness for integration tests
//!
//! A "process" is a `DurableRuntime`; dropping it is a crash. The store, the
//! clock and the payment processor outlive every runtime, the way a database,
//! wall time and a real processor outlive a worker process.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use oncepay_durable::charge::{
    ChargeCustomerActivity, ChargeInput, ChargeWorkflow, InMemoryPaymentProcessor,
};
use oncepay_durable::clock::ManualClock;
use oncepay_durable::{
    Amount, DurableRuntime, DurableStore, EngineConfig, IdempotencyKey, InMemoryDurableStore,
    WorkflowStatus,
};
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<dyn DurableStore>,
    pub clock: ManualClock,
    pub processor: InMemoryPaymentProcessor,
}

impl Harness {
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemoryDurableStore::new()))
    }

    pub fn with_store(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            clock: ManualClock::starting_now(),
            processor: InMemoryPaymentProcessor::new(),
        }
    }

    /// A fresh runtime over the shared store, as a newly started process
    pub fn runtime(&self) -> DurableRuntime {
        DurableRuntime::builder(self.store.clone())
            .clock(Arc::new(self.clock.clone()))
            .workflow::<ChargeWorkflow>()
            .activity(ChargeCustomerActivity::new(Arc::new(self.processor.clone())))
            .config(
                EngineConfig::default()
                    .with_storage_retry_delay(Duration::from_millis(10))
                    .with_result_poll_interval(Duration::from_millis(5)),
            )
            .build()
    }

    /// Start a new process and queue recovery of every active instance
    pub async fn restart(&self) -> DurableRuntime {
        let runtime = self.runtime();
        runtime.recover().await.unwrap();
        runtime
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    pub async fn status(&self, id: Uuid) -> WorkflowStatus {
        self.store.get_workflow_info(id).await.unwrap().status
    }

    /// Event types of the instance's history, in order
    pub async fn event_types(&self, id: Uuid) -> Vec<&'static str> {
        self.store
            .load_events(id)
            .await
            .unwrap()
            .iter()
            .map(|(_, event)| event.event_type())
            .collect()
    }

    pub async fn count_events(&self, id: Uuid, event_type: &str) -> usize {
        self.event_types(id)
            .await
            .into_iter()
            .filter(|t| *t == event_type)
            .count()
    }

    /// Run, advancing the clock a minute at a time, until the instance is terminal
    pub async fn drive_to_terminal(&self, runtime: &DurableRuntime, id: Uuid) -> WorkflowStatus {
        for _ in 0..20 {
            runtime.run_until_idle().await;
            let status = self.status(id).await;
            if status.is_terminal() {
                return status;
            }
            self.advance(60);
        }
        panic!("workflow {id} did not finish");
    }
}

pub fn charge(customer_id: &str, amount: &str, wait_secs: u64) -> ChargeInput {
    ChargeInput::new(customer_id, amount.parse::<Amount>().unwrap())
        .with_wait(Duration::from_secs(wait_secs))
}

pub fn key_for(customer_id: &str, amount: &str, id: Uuid) -> IdempotencyKey {
    IdempotencyKey::new(customer_id, amount.parse().unwrap(), id.to_string())
}
