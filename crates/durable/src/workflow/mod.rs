//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for the durable operations a workflow requests
//! - [`HistoryEvent`] enum for persisted history

mod action;
mod definition;
mod event;

pub use action::{ActivityOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowContext, WorkflowError};
pub use event::{HistoryEvent, TimerPurpose};
