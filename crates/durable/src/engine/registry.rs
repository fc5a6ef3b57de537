//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to factories that rebuild a
//! workflow from its stored JSON input, so the executor can replay any
//! instance without knowing its concrete type.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::timer::TimerId;
use crate::workflow::{Workflow, WorkflowAction, WorkflowContext};

/// Type-erased workflow interface
///
/// Mirrors the decision points of [`Workflow`]; payloads are JSON.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self) -> WorkflowAction;

    fn on_timer_fired(&mut self, timer_id: &TimerId) -> WorkflowAction;

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> WorkflowAction;

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> WorkflowAction;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> WorkflowAction {
        self.inner.on_start()
    }

    fn on_timer_fired(&mut self, timer_id: &TimerId) -> WorkflowAction {
        self.inner.on_timer_fired(timer_id)
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> WorkflowAction {
        self.inner.on_activity_completed(activity_id, result)
    }

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> WorkflowAction {
        self.inner.on_activity_failed(activity_id, error)
    }
}

/// Factory function type for creating workflows from an instance id and JSON input
pub type WorkflowFactory =
    Box<dyn Fn(Uuid, Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<ChargeWorkflow>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|instance_id: Uuid, input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let ctx = WorkflowContext {
                instance_id,
                workflow_type: W::TYPE,
            };
            let workflow = W::new(&ctx, typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<W: Workflow>(mut self) -> Self {
        self.register::<W>();
        self
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow for `instance_id` from type name and JSON input
    pub fn create(
        &self,
        workflow_type: &str,
        instance_id: Uuid,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(instance_id, input).map_err(RegistryError::Deserialization)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}
