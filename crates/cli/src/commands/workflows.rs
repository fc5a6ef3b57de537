// Workflow commands: start, result, history, cancel

use std::time::Duration;

use anyhow::{bail, Result};
use oncepay_durable::charge::{ChargeInput, ChargeWorkflow};
use oncepay_durable::engine::ResumeOutcome;
use oncepay_durable::persistence::WorkflowInfo;
use oncepay_durable::{Amount, DurableRuntime, HistoryEvent, RuntimeError};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

/// Workflow state as printed by `result`
#[derive(Debug, Serialize)]
struct WorkflowView {
    id: Uuid,
    workflow_type: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    events: u64,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<String>,
}

impl From<WorkflowInfo> for WorkflowView {
    fn from(info: WorkflowInfo) -> Self {
        Self {
            id: info.id,
            workflow_type: info.workflow_type,
            status: info.status.to_string(),
            result: info.result,
            error: info.error.map(|e| e.to_string()),
            events: info.position,
            created_at: info.created_at.to_rfc3339(),
            completed_at: info.completed_at.map(|at| at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
struct EventView {
    sequence: u64,
    event_type: &'static str,
    payload: HistoryEvent,
}

#[allow(clippy::too_many_arguments)]
pub async fn start(
    runtime: &DurableRuntime,
    output: OutputFormat,
    quiet: bool,
    customer_id: String,
    amount: Amount,
    wait_secs: u64,
    id: Option<Uuid>,
    wait_for_result: Option<u64>,
) -> Result<()> {
    let input = ChargeInput::new(customer_id, amount).with_wait(Duration::from_secs(wait_secs));
    let instance_id = runtime
        .start_workflow::<ChargeWorkflow>(input, id)
        .await?;

    if output.is_text() {
        if quiet {
            println!("{instance_id}");
        } else {
            println!("Started workflow {instance_id}");
            println!("Charging after {wait_secs}s; a running `oncepay worker` picks it up.");
        }
    } else {
        output.print_value(&serde_json::json!({ "id": instance_id }))?;
    }

    if let Some(timeout) = wait_for_result {
        if !quiet && output.is_text() {
            println!("Waiting up to {timeout}s for the result...");
        }
        return print_result(
            runtime,
            output,
            instance_id,
            runtime.get_result_timeout(instance_id, Duration::from_secs(timeout)).await,
        )
        .await;
    }
    Ok(())
}

pub async fn result(runtime: &DurableRuntime, output: OutputFormat, id: Uuid) -> Result<()> {
    let info = runtime.describe(id).await?;
    let view = WorkflowView::from(info);

    if !output.is_text() {
        return output.print_value(&view);
    }

    print_field("ID", &view.id.to_string());
    print_field("Type", &view.workflow_type);
    print_field("Status", &view.status);
    print_field("Events", &view.events.to_string());
    print_field("Created", &view.created_at);
    if let Some(completed_at) = &view.completed_at {
        print_field("Finished", completed_at);
    }
    if let Some(result) = &view.result {
        print_field("Result", &serde_json::to_string(result)?);
    }
    if let Some(error) = &view.error {
        print_field("Error", error);
    }
    Ok(())
}

async fn print_result(
    runtime: &DurableRuntime,
    output: OutputFormat,
    id: Uuid,
    outcome: Result<Value, RuntimeError>,
) -> Result<()> {
    match outcome {
        Ok(value) if output.is_text() => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            println!("{message}");
            Ok(())
        }
        Ok(_) => result(runtime, output, id).await,
        Err(RuntimeError::Workflow { error, .. }) => bail!("workflow {id} did not complete: {error}"),
        Err(e) => Err(e.into()),
    }
}

pub async fn history(runtime: &DurableRuntime, output: OutputFormat, id: Uuid) -> Result<()> {
    let events: Vec<EventView> = runtime
        .history(id)
        .await?
        .into_iter()
        .map(|(sequence, payload)| EventView {
            sequence,
            event_type: payload.event_type(),
            payload,
        })
        .collect();

    if !output.is_text() {
        return output.print_value(&events);
    }

    if events.is_empty() {
        println!("No events recorded for {id}");
        return Ok(());
    }

    print_table_header(&[("SEQ", 5), ("EVENT", 20), ("DETAILS", 60)]);
    for event in &events {
        let details = serde_json::to_string(&event.payload)?;
        print_table_row(&[
            (&event.sequence.to_string(), 5),
            (event.event_type, 20),
            (&details, 60),
        ]);
    }
    Ok(())
}

pub async fn cancel(
    runtime: &DurableRuntime,
    output: OutputFormat,
    id: Uuid,
    reason: String,
) -> Result<()> {
    let outcome = runtime.cancel(id, &reason).await?;

    if !output.is_text() {
        return output.print_value(&serde_json::json!({
            "id": id,
            "phase": format!("{:?}", outcome.phase()),
        }));
    }

    match outcome {
        ResumeOutcome::Cancelled { reason } => println!("Cancelled workflow {id}: {reason}"),
        other => println!("Workflow {id} already finished ({:?})", other.phase()),
    }
    Ok(())
}
