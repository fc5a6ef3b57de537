//! Activity abstractions
//!
//! Activities are the side-effecting units of work a workflow calls. They:
//! - May fail and be retried according to the retry policy
//! - Run each attempt under a start-to-close timeout
//! - Are bracketed by the idempotency ledger so an effect is recorded once

mod context;
mod definition;
mod engine;
mod registry;

pub use context::{ActivityContext, CancellationHandle};
pub use definition::{error_types, Activity, ActivityError};
pub use engine::{ActivityEngine, ActivityInvocation, ActivityOutcome};
pub use registry::{ActivityRegistry, AnyActivity};
