//! # Task Enqueuer
//!
//! Idempotent task creation. Enqueuing computes the dedup key, returns
//! the already-active task for that key when one exists, and otherwise
//! inserts a new `pending` row. The partial unique index backstops the
//! lookup-then-insert so a concurrent enqueue race can never produce two
//! active tasks with the same key; the loser is handed the winner's row.
//!
//! Retry lives here too: a failed or cancelled task re-enters the ready
//! set as a successor record carrying lineage metadata, so the original
//! attempt's error is never lost.

use serde_json::{json, Value as JsonValue};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::events::{event_names, EventPublisher};
use crate::models::task::{derive_unique_key, EntityRef, NewTask, Task, TaskType};
use crate::state_machine::{TaskEvent, TaskStateMachine};

/// Metadata key linking a successor task to the attempt it replaces.
pub const META_RETRY_OF: &str = "retry_of";
/// Metadata key counting attempts across a retry lineage.
pub const META_ATTEMPT: &str = "attempt";
/// Metadata keys for automatic requeue of crashed handlers.
pub const META_REQUEUE_COUNT: &str = "requeue_count";
pub const META_ORIGIN_TASK_ID: &str = "origin_task_id";
pub const META_REQUEUE_REASON: &str = "requeue_reason";

/// What a caller supplies to enqueue one unit of work.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub task_type: TaskType,
    pub entity: EntityRef,
    pub priority: i32,
    pub metadata: Option<JsonValue>,
}

impl EnqueueRequest {
    pub fn new(task_type: TaskType, entity: EntityRef) -> Self {
        Self {
            task_type,
            entity,
            priority: crate::models::task::priority::NORMAL,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of an enqueue: the active task for the key, and whether it was
/// created by this call or already existed.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub task: Task,
    pub deduplicated: bool,
}

/// Idempotent enqueue/retry component.
#[derive(Debug, Clone)]
pub struct TaskEnqueuer {
    pool: SqlitePool,
    events: EventPublisher,
}

impl TaskEnqueuer {
    pub fn new(pool: SqlitePool, events: EventPublisher) -> Self {
        Self { pool, events }
    }

    /// Enqueue a unit of work, deduplicating against the active task with
    /// the same key.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        let unique_key = derive_unique_key(request.task_type, &request.entity);
        let new_task = NewTask {
            task_type: request.task_type,
            entity: request.entity,
            metadata: request.metadata,
            priority: request.priority,
        };

        // The loop only repeats when an insert loses the unique race and
        // the winner finalizes before we can read it; in practice it runs
        // once or twice.
        for _ in 0..5 {
            if let Some(existing) = Task::find_active_by_unique_key(&self.pool, &unique_key).await?
            {
                info!(
                    task_id = existing.id,
                    unique_key = %unique_key,
                    "task already active, returning existing"
                );
                self.events
                    .publish_task(event_names::TASK_DEDUPLICATED, &existing);
                return Ok(EnqueueOutcome {
                    task: existing,
                    deduplicated: true,
                });
            }

            match Task::insert(&self.pool, &new_task).await {
                Ok(task) => {
                    info!(
                        task_id = task.id,
                        task_type = %task.task_type,
                        unique_key = %task.unique_key,
                        priority = task.priority,
                        "created task"
                    );
                    self.events.publish_task(event_names::TASK_ENQUEUED, &task);
                    return Ok(EnqueueOutcome {
                        task,
                        deduplicated: false,
                    });
                }
                Err(error) if is_unique_violation(&error) => {
                    // A concurrent enqueue inserted the row first; loop
                    // around and hand back the winner.
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }

        warn!(unique_key = %unique_key, "enqueue race did not settle after repeated attempts");
        Err(EngineError::Configuration(format!(
            "could not settle enqueue race for key {unique_key}"
        )))
    }

    /// Re-run a finalized task. Valid only from `failed` or `cancelled`
    /// (decided by the transition table); creates a successor `pending`
    /// record with the same type, entity and priority. The finalized row
    /// keeps its status and error; lineage lands in the successor's
    /// metadata.
    pub async fn retry(&self, task_id: i64) -> Result<EnqueueOutcome> {
        let task = Task::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;

        TaskStateMachine::determine_target_state(task.status, &TaskEvent::Retry).map_err(
            |_| EngineError::InvalidState {
                task_id,
                status: task.status,
                operation: "retried",
            },
        )?;

        let mut metadata = object_metadata(task.metadata_value());
        let attempt = metadata
            .get(META_ATTEMPT)
            .and_then(JsonValue::as_u64)
            .unwrap_or(1);
        metadata[META_RETRY_OF] = json!(task.id);
        metadata[META_ATTEMPT] = json!(attempt + 1);

        let request = EnqueueRequest {
            task_type: task.task_type,
            entity: task.entity(),
            priority: task.priority,
            metadata: Some(metadata),
        };

        let outcome = self.enqueue(request).await?;
        if !outcome.deduplicated {
            info!(
                task_id,
                successor_id = outcome.task.id,
                attempt = attempt + 1,
                "retried task as successor"
            );
            self.events
                .publish_task(event_names::TASK_RETRIED, &outcome.task);
        }
        Ok(outcome)
    }

    /// Automatic successor for a task whose handler crashed, capped per
    /// lineage by `max_requeues`. Returns the successor when one was
    /// created.
    pub async fn requeue_crashed(
        &self,
        failed: &Task,
        reason: &str,
        max_requeues: u32,
    ) -> Result<Option<Task>> {
        let mut metadata = object_metadata(failed.metadata_value());
        let requeue_count = metadata
            .get(META_REQUEUE_COUNT)
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);

        if requeue_count >= u64::from(max_requeues) {
            warn!(
                task_id = failed.id,
                requeue_count, "requeue limit reached, leaving task failed"
            );
            return Ok(None);
        }

        metadata[META_REQUEUE_COUNT] = json!(requeue_count + 1);
        metadata[META_ORIGIN_TASK_ID] = json!(failed.id);
        metadata[META_REQUEUE_REASON] = json!(reason);

        let request = EnqueueRequest {
            task_type: failed.task_type,
            entity: failed.entity(),
            priority: failed.priority,
            metadata: Some(metadata),
        };

        let outcome = self.enqueue(request).await?;
        info!(
            task_id = failed.id,
            successor_id = outcome.task.id,
            "requeued crashed task"
        );
        Ok(Some(outcome.task))
    }
}

/// Engine-written keys need an object to land in; a caller-supplied
/// non-object payload is preserved under `"payload"`.
fn object_metadata(metadata: Option<&JsonValue>) -> JsonValue {
    match metadata {
        Some(JsonValue::Object(map)) => JsonValue::Object(map.clone()),
        Some(other) => json!({ "payload": other.clone() }),
        None => json!({}),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
