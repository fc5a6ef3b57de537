//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor`, which drives workflow
//! state machines through history replay and live execution of the next
//! decision, plus the history log and registry it is built on.

mod executor;
mod history;
mod registry;
mod replay;

pub use executor::{
    ExecutorConfig, ExecutorError, ExecutorPhase, ResumeOutcome, Trigger, WorkflowExecutor,
    CANCELLED_CODE,
};
pub use history::HistoryLog;
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{ActivityStage, Pending, Replay, ReplayError, ScheduledActivity, Terminal};
