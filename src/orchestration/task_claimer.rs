//! # Task Claimer
//!
//! Atomic selection of the next task to run. The claim is one guarded
//! `UPDATE ... RETURNING` that picks the best pending row (priority
//! descending, oldest first) and flips it to `running`; two workers
//! racing for the same row cannot both win, and the loser simply claims
//! the next row on its following loop iteration.

use sqlx::SqlitePool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::models::task::{Task, TaskType};

/// Claiming component shared by all workers of one dispatcher.
#[derive(Debug, Clone)]
pub struct TaskClaimer {
    pool: SqlitePool,
    dispatcher_id: Uuid,
    /// Restrict claims to one task type (operator-driven drain of a
    /// single kind of work).
    type_filter: Option<TaskType>,
}

impl TaskClaimer {
    pub fn new(pool: SqlitePool, dispatcher_id: Uuid) -> Self {
        Self {
            pool,
            dispatcher_id,
            type_filter: None,
        }
    }

    pub fn with_type_filter(mut self, task_type: TaskType) -> Self {
        self.type_filter = Some(task_type);
        self
    }

    /// Claim the highest-priority, oldest pending task, if any.
    #[instrument(skip(self), fields(dispatcher_id = %self.dispatcher_id))]
    pub async fn claim_next(&self) -> Result<Option<Task>> {
        let claimed = Task::claim_next_pending(&self.pool, self.type_filter).await?;

        if let Some(task) = &claimed {
            debug!(
                task_id = task.id,
                task_type = %task.task_type,
                priority = task.priority,
                "claimed task"
            );
        }

        Ok(claimed)
    }
}
