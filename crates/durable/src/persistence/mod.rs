//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`DurableStore`] trait for instances, history, timers and the ledger
//! - [`InMemoryDurableStore`] for tests and crash simulations
//! - [`SqliteDurableStore`] for file-backed deployments

mod memory;
mod sqlite;
mod store;

pub use memory::InMemoryDurableStore;
pub use sqlite::SqliteDurableStore;
pub use store::{DurableStore, StoreError, WorkflowInfo, WorkflowStatus};
