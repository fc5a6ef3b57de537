//! Charge workflow and its activity
//!
//! The workflow the engine ships with: wait a configurable duration without
//! holding a worker, then charge a customer at most once.

mod activity;
mod processor;
mod workflow;

pub use activity::{ChargeCustomerActivity, ChargeReceipt, ChargeRequest};
pub use processor::{InMemoryPaymentProcessor, PaymentProcessor};
pub use workflow::{ChargeInput, ChargeOutcome, ChargeWorkflow, CHARGE_ACTIVITY_ID, DEFAULT_WAIT};
