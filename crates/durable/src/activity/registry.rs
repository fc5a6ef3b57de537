//! Activity registry for type-erased activity execution
//!
//! Activities are scheduled by type name with JSON input. The registry maps
//! that name back to a concrete [`Activity`] and converts input and output
//! at the boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::definition::error_types;
use super::{Activity, ActivityContext, ActivityError};

/// Type-erased activity interface
#[async_trait]
pub trait AnyActivity: Send + Sync {
    /// Get the activity type identifier
    fn activity_type(&self) -> &'static str;

    /// Run one attempt with JSON input and output
    async fn execute_json(&self, ctx: &ActivityContext, input: Value)
        -> Result<Value, ActivityError>;
}

/// Wrapper to implement AnyActivity for any Activity
struct ActivityWrapper<A: Activity> {
    inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn activity_type(&self) -> &'static str {
        A::TYPE
    }

    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let typed_input: A::Input = serde_json::from_value(input).map_err(|e| {
            ActivityError::non_retryable(format!("invalid input for {}: {e}", A::TYPE))
                .with_type(error_types::SERIALIZATION)
        })?;

        let output = self.inner.execute(ctx, typed_input).await?;

        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("invalid output from {}: {e}", A::TYPE))
                .with_type(error_types::SERIALIZATION)
        })
    }
}

/// Registry of activity implementations keyed by type name
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn AnyActivity>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity implementation
    ///
    /// Registering the same type twice replaces the earlier implementation.
    pub fn register<A: Activity>(&mut self, activity: A) {
        self.activities
            .insert(A::TYPE.to_string(), Arc::new(ActivityWrapper { inner: activity }));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<A: Activity>(mut self, activity: A) -> Self {
        self.register(activity);
        self
    }

    /// Look up an activity by type name
    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(activity_type).cloned()
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Get all registered activity type names
    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}
