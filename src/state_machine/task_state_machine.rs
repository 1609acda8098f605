//! # Task State Machine
//!
//! Owns the status transition table and persists transitions as guarded,
//! single-statement updates.
//!
//! Every edge is written as `UPDATE ... WHERE id = ? AND status = <expected>`
//! so that concurrent callers can never double-apply a transition: the
//! loser's update affects zero rows and surfaces as
//! [`StateMachineError::ConcurrentTransition`]. Timestamps are write-once
//! via `COALESCE`, so replaying a terminal transition can never move
//! `started_at` or `completed_at`.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::TaskEvent;
use super::states::TaskStatus;

/// Status transition driver for a task table.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    pool: SqlitePool,
}

impl TaskStateMachine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Pure transition table. Returns the target status for a
    /// (current, event) pair or an `InvalidTransition` error; never touches
    /// the database.
    pub fn determine_target_state(
        current: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        let target = match (current, event) {
            (TaskStatus::Pending, TaskEvent::Start) => TaskStatus::Running,

            (TaskStatus::Running, TaskEvent::Complete) => TaskStatus::Completed,
            (TaskStatus::Running, TaskEvent::Fail(_)) => TaskStatus::Failed,

            (TaskStatus::Pending, TaskEvent::Cancel(_)) => TaskStatus::Cancelled,
            (TaskStatus::Running, TaskEvent::Cancel(_)) => TaskStatus::Cancelled,

            // Retry re-enters the ready set, but as a successor record
            // created by the enqueuer; the finalized source row keeps its
            // status. The edge exists here so retry eligibility is decided
            // by the same table as everything else.
            (TaskStatus::Failed, TaskEvent::Retry) => TaskStatus::Pending,
            (TaskStatus::Cancelled, TaskEvent::Retry) => TaskStatus::Pending,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.name().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Apply `event` to the task, persisting the transition with a status
    /// guard. Returns the new status.
    ///
    /// `Retry` is not persistable in place (the enqueuer creates the
    /// successor record) and is rejected here.
    pub async fn transition(
        &self,
        task_id: i64,
        event: TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        let current = self.current_status(task_id).await?;
        let target = Self::determine_target_state(current, &event)?;

        let now = Utc::now();
        let rows_affected = match &event {
            TaskEvent::Start => {
                sqlx::query(
                    "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?2) \
                     WHERE id = ?1 AND status = 'pending'",
                )
                .bind(task_id)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            TaskEvent::Complete => {
                sqlx::query(
                    "UPDATE tasks SET status = 'completed', \
                     completed_at = COALESCE(completed_at, ?2) \
                     WHERE id = ?1 AND status = 'running'",
                )
                .bind(task_id)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            TaskEvent::Fail(message) => {
                sqlx::query(
                    "UPDATE tasks SET status = 'failed', error_message = ?3, \
                     completed_at = COALESCE(completed_at, ?2) \
                     WHERE id = ?1 AND status = 'running'",
                )
                .bind(task_id)
                .bind(now)
                .bind(message)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            TaskEvent::Cancel(reason) => {
                sqlx::query(
                    "UPDATE tasks SET status = 'cancelled', error_message = ?3, \
                     completed_at = COALESCE(completed_at, ?2) \
                     WHERE id = ?1 AND status IN ('pending', 'running')",
                )
                .bind(task_id)
                .bind(now)
                .bind(reason)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            TaskEvent::Retry => {
                return Err(StateMachineError::InvalidTransition {
                    from: current,
                    event: event.name().to_string(),
                })
            }
        };

        if rows_affected == 0 {
            return Err(StateMachineError::ConcurrentTransition {
                task_id,
                expected: current,
            });
        }

        debug!(task_id, from = %current, to = %target, event = event.name(), "task transitioned");
        Ok(target)
    }

    async fn current_status(&self, task_id: i64) -> StateMachineResult<TaskStatus> {
        let row: Option<(TaskStatus,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(status,)| status)
            .ok_or(StateMachineError::TaskNotFound(task_id))
    }
}
