//! # Task Handler Registry
//!
//! Maps each [`TaskType`] to the domain logic that executes it. Handlers
//! are external collaborators to the engine: they receive the claimed
//! task plus a context handle and report success or failure; the engine
//! owns everything around that call.
//!
//! Registration happens once at startup. Dispatch is an explicit map
//! lookup over the closed type enumeration; a type with no handler is a
//! deployment configuration error and fails the task immediately.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::task::{Task, TaskType};
use crate::state_machine::states::TaskStatus;

/// Successful handler result: an optional human-readable message and an
/// optional result payload merged into the task's metadata under
/// `"result"`.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub message: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl HandlerOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Execution context handed to a handler: the claimed task and a handle
/// for cooperative cancellation checks.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Task,
    pool: SqlitePool,
}

impl TaskContext {
    pub fn new(task: Task, pool: SqlitePool) -> Self {
        Self { task, pool }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn metadata(&self) -> Option<&JsonValue> {
        self.task.metadata_value()
    }

    /// Cooperative cancellation checkpoint. Long-running handlers may
    /// poll this between units of work; the engine never preempts a
    /// handler that does not.
    pub async fn cancellation_requested(&self) -> Result<bool> {
        let task = Task::find_by_id(&self.pool, self.task.id).await?;
        Ok(matches!(
            task.map(|t| t.status),
            Some(TaskStatus::Cancelled)
        ))
    }
}

/// A unit of domain logic for one or more task types.
///
/// `execute` returns `anyhow::Result` so handler internals can bubble any
/// error with `?`; the dispatcher converts an `Err` into a `failed` task
/// with the formatted message, never into a crashed worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task types this handler executes.
    fn task_types(&self) -> &[TaskType];

    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<HandlerOutcome>;
}

/// Startup-time handler table over the closed type enumeration.
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: DashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every type it declares. Re-registering a
    /// type replaces the previous handler (last write wins, logged).
    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        for task_type in handler.task_types() {
            if self.handlers.insert(*task_type, handler.clone()).is_some() {
                warn!(task_type = %task_type, "replacing previously registered task handler");
            } else {
                debug!(task_type = %task_type, "registered task handler");
            }
        }
    }

    pub fn resolve(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(&task_type)
            .map(|entry| entry.value().clone())
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
