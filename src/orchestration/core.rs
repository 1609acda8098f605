//! # Task Engine
//!
//! The facade the surrounding application talks to. Wires the pool,
//! registry, event publisher and worker pool together and exposes the
//! public operations: enqueue, status/statistics polling, retry, cancel
//! (single and bulk), browsing, staleness and maintenance.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::EngineConfig;
use crate::db;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::models::task::{Page, Task, TaskFilters};
use crate::registry::TaskHandlerRegistry;

use super::dispatcher::Dispatcher;
use super::lifecycle::{LifecycleTracker, TaskStatistics, TaskStatusView};
use super::task_enqueuer::{EnqueueOutcome, EnqueueRequest, TaskEnqueuer};
use super::task_finalizer::TaskFinalizer;

/// Per-id result of a bulk retry/cancel. A batch never aborts on one bad
/// id; each outcome stands alone.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub task_id: i64,
    pub success: bool,
    /// For retry: id of the task now active for the key (successor, or
    /// the existing active task when deduplicated).
    pub active_task_id: Option<i64>,
    pub error: Option<String>,
}

/// The background task orchestration engine.
pub struct TaskEngine {
    pool: SqlitePool,
    registry: Arc<TaskHandlerRegistry>,
    events: EventPublisher,
    enqueuer: TaskEnqueuer,
    finalizer: TaskFinalizer,
    lifecycle: LifecycleTracker,
    dispatcher: Dispatcher,
}

impl TaskEngine {
    /// Open the configured database (running migrations) and assemble the
    /// engine. Handlers are registered on [`TaskEngine::registry`] before
    /// calling [`TaskEngine::start`].
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let pool = db::init_pool(&config.database_url).await?;
        Ok(Self::with_pool(pool, config))
    }

    /// Assemble the engine over an existing pool (tests, shared app pool).
    pub fn with_pool(pool: SqlitePool, config: EngineConfig) -> Self {
        let registry = Arc::new(TaskHandlerRegistry::new());
        let events = EventPublisher::new(config.event_channel_capacity);
        let enqueuer = TaskEnqueuer::new(pool.clone(), events.clone());
        let finalizer = TaskFinalizer::new(pool.clone(), events.clone());
        let lifecycle = LifecycleTracker::new(pool.clone(), config.stale_running_threshold);
        let dispatcher = Dispatcher::new(
            pool.clone(),
            Arc::clone(&registry),
            events.clone(),
            config,
        );

        Self {
            pool,
            registry,
            events,
            enqueuer,
            finalizer,
            lifecycle,
            dispatcher,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<TaskHandlerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Start the worker pool.
    pub fn start(&self) -> Result<()> {
        self.dispatcher.start()
    }

    /// Stop the worker pool, waiting up to `timeout` per worker for
    /// in-flight tasks to finish.
    pub async fn stop(&self, timeout: Duration) {
        self.dispatcher.stop(timeout).await;
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Idempotent enqueue (§ dedup): returns the active task for the
    /// request's key, newly created or pre-existing.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        let outcome = self.enqueuer.enqueue(request).await?;
        self.dispatcher.wake();
        Ok(outcome)
    }

    /// UI polling payload for one task.
    pub async fn get_status(&self, task_id: i64) -> Result<TaskStatusView> {
        self.lifecycle.get_status(task_id).await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        self.lifecycle.get_task(task_id).await
    }

    /// Dashboard aggregate counts.
    pub async fn get_statistics(&self) -> Result<TaskStatistics> {
        self.lifecycle.get_statistics().await
    }

    pub async fn list_tasks(&self, filters: &TaskFilters, page: Page) -> Result<Vec<Task>> {
        self.lifecycle.list_tasks(filters, page).await
    }

    pub async fn find_for_entity(
        &self,
        mbid: Option<&str>,
        entity_id: Option<i64>,
    ) -> Result<Vec<Task>> {
        self.lifecycle.find_for_entity(mbid, entity_id).await
    }

    /// Re-run a failed or cancelled task. Returns the task now active for
    /// the key.
    pub async fn retry(&self, task_id: i64) -> Result<Task> {
        let outcome = self.enqueuer.retry(task_id).await?;
        self.dispatcher.wake();
        Ok(outcome.task)
    }

    /// Cancel an active task, recording `reason`.
    pub async fn cancel(&self, task_id: i64, reason: &str) -> Result<()> {
        self.finalizer.cancel(task_id, reason).await?;
        Ok(())
    }

    /// Bulk retry; each id is attempted independently.
    pub async fn retry_bulk(&self, task_ids: &[i64]) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            let outcome = match self.enqueuer.retry(task_id).await {
                Ok(result) => BulkOutcome {
                    task_id,
                    success: true,
                    active_task_id: Some(result.task.id),
                    error: None,
                },
                Err(e) => BulkOutcome {
                    task_id,
                    success: false,
                    active_task_id: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        if outcomes.iter().any(|o| o.success) {
            self.dispatcher.wake();
        }
        outcomes
    }

    /// Bulk cancel; each id is attempted independently.
    pub async fn cancel_bulk(&self, task_ids: &[i64], reason: &str) -> Vec<BulkOutcome> {
        let mut outcomes = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            let outcome = match self.finalizer.cancel(task_id, reason).await {
                Ok(_) => BulkOutcome {
                    task_id,
                    success: true,
                    active_task_id: None,
                    error: None,
                },
                Err(e) => BulkOutcome {
                    task_id,
                    success: false,
                    active_task_id: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Running tasks exceeding the stale threshold, surfaced for the
    /// operator.
    pub async fn find_stale_running(&self) -> Result<Vec<Task>> {
        self.lifecycle.find_stale_running().await
    }

    /// Opt-in timeout policy over stale running tasks.
    pub async fn cancel_stale_running(&self) -> Result<u64> {
        self.lifecycle.cancel_stale_running().await
    }

    /// Delete finalized tasks older than `days`.
    pub async fn cleanup_old_tasks(&self, days: u32) -> Result<u64> {
        self.lifecycle.cleanup_old_tasks(days).await
    }
}
