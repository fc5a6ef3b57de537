//! # Durable Execution Engine
//!
//! An embeddable, SQLite-backed engine that resumes long-running workflows
//! exactly where they left off after a crash, and records each external side
//! effect at most once.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every decision and completion is appended to a per-instance history and replayed on resume
//! - **Durable timers**: sleeps are persisted deadlines; nothing is held while a workflow waits
//! - **Automatic retries**: exponential backoff between attempts, each backoff itself a durable timer
//! - **Idempotency ledger**: a first-writer-wins record per effect key guards against double charges
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DurableRuntime                          │
//! │  (start_workflow, get_result, cancel, history, archive)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (work queue, per-instance locks, timer sweep, recovery)    │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                  │
//!               ▼                                  ▼
//! ┌───────────────────────────┐    ┌───────────────────────────┐
//! │     WorkflowExecutor      │    │   ActivityWorkerPool      │
//! │  (replay + next decision) │    │  ActivityEngine + ledger  │
//! └───────────────────────────┘    └───────────────────────────┘
//!               │                                  │
//!               ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableStore                           │
//! │  (SQLite: workflow_instances, workflow_history,             │
//! │   durable_timers, idempotency_ledger)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use oncepay_durable::prelude::*;
//!
//! let store = Arc::new(SqliteDurableStore::open("oncepay.db").await?);
//! let runtime = DurableRuntime::builder(store)
//!     .workflow::<ChargeWorkflow>()
//!     .activity(ChargeCustomerActivity::new(Arc::new(InMemoryPaymentProcessor::new())))
//!     .build();
//!
//! let id = runtime
//!     .start_workflow::<ChargeWorkflow>(ChargeInput::new("c1", "99.99".parse()?), None)
//!     .await?;
//! ```

pub mod activity;
pub mod charge;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod persistence;
pub mod reliability;
pub mod runtime;
pub mod timer;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::charge::{
        ChargeCustomerActivity, ChargeInput, ChargeOutcome, ChargeWorkflow,
        InMemoryPaymentProcessor, PaymentProcessor,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{ExecutorError, ResumeOutcome, Trigger, WorkflowExecutor};
    pub use crate::ledger::{Amount, IdempotencyKey, IdempotencyLedger, RecordOutcome};
    pub use crate::persistence::{
        DurableStore, InMemoryDurableStore, SqliteDurableStore, StoreError, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{DurableRuntime, RuntimeError};
    pub use crate::timer::TimerId;
    pub use crate::workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowError};
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use config::EngineConfig;
pub use engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
pub use ledger::{Amount, IdempotencyKey, IdempotencyLedger};
pub use persistence::{
    DurableStore, InMemoryDurableStore, SqliteDurableStore, StoreError, WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use runtime::{DurableRuntime, DurableRuntimeBuilder, RuntimeError};
pub use workflow::{ActivityOptions, HistoryEvent, Workflow, WorkflowAction, WorkflowError};
