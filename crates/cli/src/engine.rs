// Runtime construction shared by every command

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use oncepay_durable::charge::{ChargeCustomerActivity, ChargeWorkflow, InMemoryPaymentProcessor};
use oncepay_durable::{DurableRuntime, EngineConfig, SqliteDurableStore};

/// Open the database at `database_url` and build a runtime over it
///
/// `latency` is the simulated processor latency of the charge activity; only
/// the worker ever runs activities.
pub async fn open(database_url: &str, latency: Duration) -> Result<DurableRuntime> {
    let store = SqliteDurableStore::connect(database_url)
        .await
        .with_context(|| format!("failed to open database {database_url}"))?;

    let processor = Arc::new(InMemoryPaymentProcessor::new());
    let runtime = DurableRuntime::builder(Arc::new(store))
        .workflow::<ChargeWorkflow>()
        .activity(ChargeCustomerActivity::new(processor).with_latency(latency))
        .config(EngineConfig::from_env())
        .build();

    Ok(runtime)
}
