//! Dispatch and activity execution
//!
//! This module provides:
//! - [`Dispatcher`] - Consumes work items and resumes workflow instances
//! - [`ActivityWorkerPool`] - Runs activity attempts with bounded concurrency
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  ┌──────────────┐    ┌─────────────┐    ┌────────────────┐   │
//! │  │ Timer sweep  │    │  Recovery   │    │ start / cancel │   │
//! │  │  (250ms)     │    │  (startup)  │    │  (runtime)     │   │
//! │  └──────┬───────┘    └──────┬──────┘    └───────┬────────┘   │
//! │         └──────────────┬────┴───────────────────┘            │
//! │                        ▼                                     │
//! │              ┌───────────────────┐                           │
//! │              │    Work queue     │◄──────────────┐           │
//! │              └─────────┬─────────┘               │           │
//! │                        ▼                         │ results   │
//! │   ┌──────────────────────────────────────┐       │           │
//! │   │ per-instance lock + WorkflowExecutor │       │           │
//! │   └─────────────────┬────────────────────┘       │           │
//! │                     ▼ AwaitingActivity           │           │
//! │   ┌──────────────────────────────────────┐       │           │
//! │   │ ActivityWorkerPool (Semaphore)       │───────┘           │
//! │   └──────────────────────────────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod dispatcher;
mod pool;

pub use dispatcher::{Dispatcher, DispatcherConfig, WorkItem};
pub use pool::ActivityWorkerPool;
