// Ledger commands: list and reset charges

use anyhow::{bail, Result};
use oncepay_durable::ledger::IdempotencyRecord;
use oncepay_durable::DurableRuntime;
use serde::Serialize;
use serde_json::Value;

use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
struct ChargeView {
    idempotency_key: String,
    customer_id: String,
    amount: String,
    status: String,
    result: Value,
    created_at: String,
}

impl From<IdempotencyRecord> for ChargeView {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            idempotency_key: record.key.to_string(),
            customer_id: record.customer_id,
            amount: record.amount.to_string(),
            status: record.status.to_string(),
            result: record.result,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

pub async fn list(runtime: &DurableRuntime, output: OutputFormat) -> Result<()> {
    let charges: Vec<ChargeView> = runtime
        .ledger()
        .list()
        .await?
        .into_iter()
        .map(ChargeView::from)
        .collect();

    if !output.is_text() {
        return output.print_value(&charges);
    }

    if charges.is_empty() {
        println!("No charges recorded");
        return Ok(());
    }

    print_table_header(&[("KEY", 52), ("CUSTOMER", 12), ("AMOUNT", 10), ("STATUS", 10), ("CREATED", 25)]);
    for charge in &charges {
        print_table_row(&[
            (&charge.idempotency_key, 52),
            (&charge.customer_id, 12),
            (&charge.amount, 10),
            (&charge.status, 10),
            (&charge.created_at, 25),
        ]);
    }
    Ok(())
}

pub async fn reset(runtime: &DurableRuntime, quiet: bool, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clear the idempotency ledger without --yes");
    }
    let removed = runtime.ledger().reset().await?;
    if !quiet {
        println!("Removed {removed} charge record(s)");
    }
    Ok(())
}
