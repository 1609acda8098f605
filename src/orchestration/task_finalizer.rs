//! # Task Finalizer
//!
//! Records terminal outcomes. Each finalization is a guarded transition:
//! if a cancel won the race while the handler was still running, the
//! losing completion/failure is skipped and the cancelled state stands.

use serde_json::{json, Value as JsonValue};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::events::{event_names, EventPublisher};
use crate::models::task::Task;
use crate::registry::HandlerOutcome;
use crate::state_machine::{StateMachineError, TaskEvent, TaskStateMachine};

/// Metadata key under which a handler's result payload is stored.
pub const META_RESULT: &str = "result";

/// What the finalizer did for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationAction {
    Completed,
    Failed,
    Cancelled,
    /// Another caller finalized first (typically a cancel during
    /// execution); the existing terminal state was preserved.
    AlreadyFinalized,
}

#[derive(Debug, Clone)]
pub struct FinalizationResult {
    pub task_id: i64,
    pub action: FinalizationAction,
}

/// Terminal-state recorder used by the dispatcher and the cancel
/// operation.
#[derive(Debug, Clone)]
pub struct TaskFinalizer {
    pool: SqlitePool,
    state_machine: TaskStateMachine,
    events: EventPublisher,
}

impl TaskFinalizer {
    pub fn new(pool: SqlitePool, events: EventPublisher) -> Self {
        let state_machine = TaskStateMachine::new(pool.clone());
        Self {
            pool,
            state_machine,
            events,
        }
    }

    /// Mark a running task completed and attach the handler's result
    /// payload to its metadata.
    pub async fn complete(
        &self,
        task_id: i64,
        outcome: HandlerOutcome,
    ) -> Result<FinalizationResult> {
        match self.state_machine.transition(task_id, TaskEvent::Complete).await {
            Ok(_) => {
                if let Some(result) = &outcome.metadata {
                    self.attach_result_metadata(task_id, result).await?;
                }
                let task = self.reload(task_id).await?;
                info!(
                    task_id,
                    task_type = %task.task_type,
                    duration_secs = task.duration_secs(),
                    message = outcome.message.as_deref().unwrap_or(""),
                    "task completed"
                );
                self.events.publish_task(event_names::TASK_COMPLETED, &task);
                Ok(FinalizationResult {
                    task_id,
                    action: FinalizationAction::Completed,
                })
            }
            Err(StateMachineError::ConcurrentTransition { .. }) => {
                self.skipped(task_id, "completion").await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a running task failed with a human-readable message.
    pub async fn fail(&self, task_id: i64, message: String) -> Result<FinalizationResult> {
        match self
            .state_machine
            .transition(task_id, TaskEvent::Fail(message.clone()))
            .await
        {
            Ok(_) => {
                let task = self.reload(task_id).await?;
                error!(task_id, task_type = %task.task_type, error = %message, "task failed");
                self.events.publish_task(event_names::TASK_FAILED, &task);
                Ok(FinalizationResult {
                    task_id,
                    action: FinalizationAction::Failed,
                })
            }
            Err(StateMachineError::ConcurrentTransition { .. }) => {
                self.skipped(task_id, "failure").await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel an active task, recording the reason. Cancelling a task
    /// that is already finalized is an invalid-state error and mutates
    /// nothing.
    pub async fn cancel(&self, task_id: i64, reason: &str) -> Result<FinalizationResult> {
        let task = Task::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;

        if task.is_finalized() {
            return Err(EngineError::InvalidState {
                task_id,
                status: task.status,
                operation: "cancelled",
            });
        }

        match self
            .state_machine
            .transition(task_id, TaskEvent::Cancel(reason.to_string()))
            .await
        {
            Ok(_) => {
                let task = self.reload(task_id).await?;
                info!(task_id, task_type = %task.task_type, reason, "task cancelled");
                self.events.publish_task(event_names::TASK_CANCELLED, &task);
                Ok(FinalizationResult {
                    task_id,
                    action: FinalizationAction::Cancelled,
                })
            }
            // Finalized between our check and the update.
            Err(StateMachineError::ConcurrentTransition { .. }) => {
                let task = self.reload(task_id).await?;
                Err(EngineError::InvalidState {
                    task_id,
                    status: task.status,
                    operation: "cancelled",
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn skipped(&self, task_id: i64, attempted: &str) -> Result<FinalizationResult> {
        let task = self.reload(task_id).await?;
        debug!(
            task_id,
            status = %task.status,
            attempted,
            "finalization skipped, task already finalized"
        );
        Ok(FinalizationResult {
            task_id,
            action: FinalizationAction::AlreadyFinalized,
        })
    }

    async fn attach_result_metadata(&self, task_id: i64, result: &JsonValue) -> Result<()> {
        let task = self.reload(task_id).await?;
        let mut metadata = match task.metadata_value() {
            Some(JsonValue::Object(map)) => JsonValue::Object(map.clone()),
            Some(other) => json!({ "payload": other.clone() }),
            None => json!({}),
        };
        metadata[META_RESULT] = result.clone();
        Task::update_metadata(&self.pool, task_id, &metadata).await?;
        Ok(())
    }

    async fn reload(&self, task_id: i64) -> Result<Task> {
        Task::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }
}
