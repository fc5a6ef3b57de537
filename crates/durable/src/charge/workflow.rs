//! Charge workflow: durable wait, then an at-most-once charge

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::activity::{ChargeCustomerActivity, ChargeReceipt, ChargeRequest};
use crate::activity::Activity;
use crate::ledger::{Amount, IdempotencyKey};
use crate::reliability::{duration_millis, RetryPolicy};
use crate::timer::TimerId;
use crate::workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError};

/// Activity id of the charge within the workflow
pub const CHARGE_ACTIVITY_ID: &str = "charge";

/// Default durable wait before charging
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

fn default_wait() -> Duration {
    DEFAULT_WAIT
}

/// Input of [`ChargeWorkflow`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeInput {
    pub customer_id: String,
    pub amount: Amount,
    /// How long to wait before charging
    #[serde(rename = "wait_ms", with = "duration_millis", default = "default_wait")]
    pub wait: Duration,
}

impl ChargeInput {
    pub fn new(customer_id: impl Into<String>, amount: Amount) -> Self {
        Self {
            customer_id: customer_id.into(),
            amount,
            wait: DEFAULT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// Result of a successful [`ChargeWorkflow`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeOutcome {
    pub message: String,
    pub idempotency_key: IdempotencyKey,
    pub charge_id: String,
}

/// Waits `wait`, then charges the customer through `charge_customer`
///
/// The charge is keyed by `customer:amount:instance`, so every retry and every
/// replay of one instance hits the same ledger entry.
#[derive(Debug)]
pub struct ChargeWorkflow {
    instance_id: Uuid,
    input: ChargeInput,
}

impl ChargeWorkflow {
    /// Ledger key of this instance's charge
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(
            self.input.customer_id.clone(),
            self.input.amount,
            self.instance_id.to_string(),
        )
    }

    /// Options of the charge activity
    pub fn activity_options() -> ActivityOptions {
        ActivityOptions::default()
            .with_retry(
                RetryPolicy::exponential()
                    .with_max_attempts(3)
                    .with_initial_interval(Duration::from_secs(5))
                    .with_backoff_coefficient(2.0),
            )
            .with_start_to_close_timeout(Duration::from_secs(5 * 60))
    }

    fn charge(&self) -> WorkflowAction {
        let request = ChargeRequest {
            customer_id: self.input.customer_id.clone(),
            amount: self.input.amount,
        };
        match serde_json::to_value(&request) {
            Ok(input) => WorkflowAction::call_activity(
                CHARGE_ACTIVITY_ID,
                ChargeCustomerActivity::TYPE,
                input,
                self.idempotency_key(),
            )
            .with_options(Self::activity_options()),
            Err(e) => WorkflowAction::fail(
                WorkflowError::new(format!("failed to encode charge request: {e}"))
                    .with_code("serialization"),
            ),
        }
    }
}

impl Workflow for ChargeWorkflow {
    const TYPE: &'static str = "charge";
    type Input = ChargeInput;
    type Output = ChargeOutcome;

    fn new(ctx: &WorkflowContext, input: Self::Input) -> Self {
        Self {
            instance_id: ctx.instance_id,
            input,
        }
    }

    fn on_start(&mut self) -> WorkflowAction {
        if !self.input.amount.is_positive() {
            return WorkflowAction::fail(
                WorkflowError::new(format!("amount must be positive, got {}", self.input.amount))
                    .with_code("invalid_amount"),
            );
        }
        WorkflowAction::sleep(self.input.wait)
    }

    fn on_timer_fired(&mut self, _timer_id: &TimerId) -> WorkflowAction {
        self.charge()
    }

    fn on_activity_completed(&mut self, _activity_id: &str, result: Value) -> WorkflowAction {
        let receipt: ChargeReceipt = match serde_json::from_value(result) {
            Ok(receipt) => receipt,
            Err(e) => {
                return WorkflowAction::fail(
                    WorkflowError::new(format!("unreadable charge receipt: {e}"))
                        .with_code("serialization"),
                )
            }
        };

        let outcome = ChargeOutcome {
            message: format!(
                "Charged {} ${} successfully",
                self.input.customer_id, self.input.amount
            ),
            idempotency_key: receipt.idempotency_key,
            charge_id: receipt.charge_id,
        };
        match serde_json::to_value(outcome) {
            Ok(result) => WorkflowAction::complete(result),
            Err(e) => WorkflowAction::fail(WorkflowError::new(e.to_string())),
        }
    }
}
