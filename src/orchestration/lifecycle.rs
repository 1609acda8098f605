//! # Lifecycle Tracker
//!
//! Read views for monitoring: per-task status for UI polling, the
//! aggregate status counts for the dashboard, stale-running detection,
//! and the explicit maintenance operations (timeout cancel, history
//! cleanup).

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::models::task::{Page, Task, TaskFilters};
use crate::state_machine::states::TaskStatus;

/// Per-task polling view.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub duration_secs: Option<i64>,
    pub is_finalized: bool,
    pub is_active: bool,
    pub error_message: Option<String>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.to_string(),
            status: task.status,
            duration_secs: task.duration_secs(),
            is_finalized: task.is_finalized(),
            is_active: task.is_active(),
            error_message: task.error_message.clone(),
        }
    }
}

/// Dashboard aggregate: task counts per status. Statuses with no tasks
/// report zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl TaskStatistics {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    fn from_counts(counts: &[(TaskStatus, i64)]) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            match status {
                TaskStatus::Pending => stats.pending = *count,
                TaskStatus::Running => stats.running = *count,
                TaskStatus::Completed => stats.completed = *count,
                TaskStatus::Failed => stats.failed = *count,
                TaskStatus::Cancelled => stats.cancelled = *count,
            }
        }
        stats
    }
}

/// Read-side component over the task table.
#[derive(Debug, Clone)]
pub struct LifecycleTracker {
    pool: SqlitePool,
    stale_running_threshold: Duration,
}

impl LifecycleTracker {
    pub fn new(pool: SqlitePool, stale_running_threshold: Duration) -> Self {
        Self {
            pool,
            stale_running_threshold,
        }
    }

    /// Polling endpoint payload for one task.
    pub async fn get_status(&self, task_id: i64) -> Result<TaskStatusView> {
        let task = Task::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        Ok(TaskStatusView::from(&task))
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        Task::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// One cheap GROUP BY, suitable for periodic dashboard polling.
    pub async fn get_statistics(&self) -> Result<TaskStatistics> {
        let counts = Task::status_counts(&self.pool).await?;
        Ok(TaskStatistics::from_counts(&counts))
    }

    /// Read-only browsing of the task table.
    pub async fn list_tasks(&self, filters: &TaskFilters, page: Page) -> Result<Vec<Task>> {
        Ok(Task::find_by_filters(&self.pool, filters, page).await?)
    }

    /// Task history for one catalog entity, newest first.
    pub async fn find_for_entity(
        &self,
        mbid: Option<&str>,
        entity_id: Option<i64>,
    ) -> Result<Vec<Task>> {
        Ok(Task::find_for_entity(&self.pool, mbid, entity_id).await?)
    }

    /// Running tasks older than the configured threshold. Surfaced for
    /// operator intervention; nothing is cancelled here.
    pub async fn find_stale_running(&self) -> Result<Vec<Task>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_running_threshold)
                .map_err(|e| EngineError::Configuration(format!("stale threshold: {e}")))?;
        let stale = Task::find_stale_running(&self.pool, cutoff).await?;
        if !stale.is_empty() {
            warn!(count = stale.len(), "stale running tasks detected");
        }
        Ok(stale)
    }

    /// Explicit timeout policy: cancel running tasks older than the
    /// threshold. Returns how many were cancelled.
    pub async fn cancel_stale_running(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_running_threshold)
                .map_err(|e| EngineError::Configuration(format!("stale threshold: {e}")))?;
        let cancelled =
            Task::cancel_stale_running(&self.pool, cutoff, "Task cancelled due to timeout").await?;
        if cancelled > 0 {
            warn!(cancelled, "cancelled stale running tasks");
        }
        Ok(cancelled)
    }

    /// Explicit maintenance: delete finalized tasks older than `days`.
    pub async fn cleanup_old_tasks(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let deleted = Task::cleanup_finalized_before(&self.pool, cutoff).await?;
        info!(deleted, days, "cleaned up old tasks");
        Ok(deleted)
    }
}
