//! `charge_customer` activity

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::processor::PaymentProcessor;
use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::ledger::{Amount, IdempotencyKey};

/// Input of [`ChargeCustomerActivity`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub amount: Amount,
}

/// Output of [`ChargeCustomerActivity`], stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub customer_id: String,
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey,
    /// Id assigned by the payment processor
    pub charge_id: String,
    pub status: String,
}

/// Charges a customer through a [`PaymentProcessor`]
pub struct ChargeCustomerActivity {
    processor: Arc<dyn PaymentProcessor>,
    latency: Duration,
}

impl ChargeCustomerActivity {
    pub fn new(processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            processor,
            latency: Duration::ZERO,
        }
    }

    /// Simulated network latency before the processor is called
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Activity for ChargeCustomerActivity {
    const TYPE: &'static str = "charge_customer";
    type Input = ChargeRequest;
    type Output = ChargeReceipt;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        info!(
            customer_id = %input.customer_id,
            amount = %input.amount,
            attempt = ctx.attempt,
            "starting charge"
        );

        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = ctx.cancelled() => {
                    info!(customer_id = %input.customer_id, "charge cancelled before processor call");
                    return Err(ActivityError::non_retryable("charge cancelled before processor call")
                        .with_type("cancelled"));
                }
            }
        }

        let charge_id = self.processor.charge(&ctx.idempotency_key).await?;
        info!(
            customer_id = %input.customer_id,
            amount = %input.amount,
            %charge_id,
            "processor accepted charge"
        );

        Ok(ChargeReceipt {
            customer_id: input.customer_id,
            amount: input.amount,
            idempotency_key: ctx.idempotency_key.clone(),
            charge_id,
            status: "completed".to_string(),
        })
    }
}
