//! # Dispatcher / Worker Pool
//!
//! A fixed pool of workers that claim ready tasks and drive them through
//! their handlers. Each worker loops claim → resolve → execute →
//! finalize; handlers run in their own spawned task so a panic is
//! contained as a join error and becomes a `failed` task instead of a
//! dead worker.
//!
//! Idle workers park on a notify handle that the enqueuer pokes, with the
//! poll interval as a fallback timeout, so new work starts promptly
//! without a busy loop. Shutdown is cooperative: the running flag drops,
//! the notify wakes everyone, and workers finish their in-flight task
//! before exiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{event_names, EventPublisher};
use crate::models::task::Task;
use crate::registry::{TaskContext, TaskHandlerRegistry};

use super::task_claimer::TaskClaimer;
use super::task_enqueuer::TaskEnqueuer;
use super::task_finalizer::{FinalizationAction, TaskFinalizer};

struct DispatcherInner {
    id: Uuid,
    pool: SqlitePool,
    registry: Arc<TaskHandlerRegistry>,
    claimer: TaskClaimer,
    finalizer: TaskFinalizer,
    enqueuer: TaskEnqueuer,
    events: EventPublisher,
    config: EngineConfig,
    running: AtomicBool,
    wake: Notify,
}

/// Worker pool over the shared persisted queue.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<TaskHandlerRegistry>,
        events: EventPublisher,
        config: EngineConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        let claimer = TaskClaimer::new(pool.clone(), id);
        let finalizer = TaskFinalizer::new(pool.clone(), events.clone());
        let enqueuer = TaskEnqueuer::new(pool.clone(), events.clone());

        Self {
            inner: Arc::new(DispatcherInner {
                id,
                pool,
                registry,
                claimer,
                finalizer,
                enqueuer,
                events,
                config,
                running: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Wake idle workers; called after every enqueue.
    pub fn wake(&self) {
        self.inner.wake.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the worker pool. Idempotent start is an error so a
    /// double-started deployment is caught loudly.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Configuration(
                "dispatcher is already running".to_string(),
            ));
        }

        let worker_count = self.inner.config.worker_count.max(1);
        let mut workers = self.workers.lock();
        for worker_index in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_index)));
        }

        info!(
            dispatcher_id = %self.inner.id,
            worker_count,
            "dispatcher started"
        );
        Ok(())
    }

    /// Stop the pool, letting each worker finish its in-flight task.
    /// Workers still alive after `timeout` are aborted.
    pub async fn stop(&self, timeout: Duration) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.wake.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock());
        for mut handle in workers {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(dispatcher_id = %self.inner.id, "worker did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(dispatcher_id = %self.inner.id, "dispatcher stopped");
    }
}

async fn worker_loop(inner: Arc<DispatcherInner>, worker_index: usize) {
    debug!(dispatcher_id = %inner.id, worker_index, "worker started");

    while inner.running.load(Ordering::Acquire) {
        match inner.claimer.claim_next().await {
            Ok(Some(task)) => {
                execute_claimed(&inner, task).await;
            }
            Ok(None) => {
                // Nothing ready: wait for an enqueue wake-up or re-poll
                // after the idle interval.
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(inner.config.poll_interval) => {}
                }
            }
            Err(e) => {
                warn!(worker_index, error = %e, "claim failed, backing off");
                tokio::time::sleep(inner.config.poll_interval).await;
            }
        }
    }

    debug!(dispatcher_id = %inner.id, worker_index, "worker stopped");
}

/// Run one claimed task to a terminal state. Never returns an error:
/// every failure path ends in a finalized task, and finalization problems
/// are logged rather than propagated so the worker keeps serving the
/// queue.
async fn execute_claimed(inner: &Arc<DispatcherInner>, task: Task) {
    inner.events.publish_task(event_names::TASK_STARTED, &task);

    let Some(handler) = inner.registry.resolve(task.task_type) else {
        let message = EngineError::HandlerNotRegistered(task.task_type.to_string()).to_string();
        error!(task_id = task.id, task_type = %task.task_type, "{message}");
        finalize_failed(inner, &task, message, false).await;
        return;
    };

    let context = TaskContext::new(task.clone(), inner.pool.clone());
    let execution = tokio::spawn(async move { handler.execute(&context).await });

    match execution.await {
        Ok(Ok(outcome)) => {
            if let Err(e) = inner.finalizer.complete(task.id, outcome).await {
                error!(task_id = task.id, error = %e, "failed to record completion");
            }
        }
        Ok(Err(handler_error)) => {
            let message = format!("{handler_error:#}");
            finalize_failed(inner, &task, message, true).await;
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                format!("Handler panicked: {}", panic_message(join_error))
            } else {
                "Handler task was aborted".to_string()
            };
            finalize_failed(inner, &task, message, true).await;
        }
    }
}

async fn finalize_failed(
    inner: &Arc<DispatcherInner>,
    task: &Task,
    message: String,
    requeue_eligible: bool,
) {
    match inner.finalizer.fail(task.id, message.clone()).await {
        Ok(result) if result.action == FinalizationAction::Failed => {}
        // A cancel won while the handler was running; keep that decision.
        Ok(_) => return,
        Err(e) => {
            error!(task_id = task.id, error = %e, "failed to record failure");
            return;
        }
    }

    // Optional crash requeue, bounded per lineage. Configuration errors
    // (missing handler) never requeue.
    if requeue_eligible && inner.config.max_auto_requeues > 0 {
        match inner
            .enqueuer
            .requeue_crashed(task, &message, inner.config.max_auto_requeues)
            .await
        {
            Ok(Some(successor)) => {
                debug!(task_id = task.id, successor_id = successor.id, "auto-requeued");
                inner.wake.notify_waiters();
            }
            Ok(None) => {}
            Err(e) => error!(task_id = task.id, error = %e, "auto-requeue failed"),
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    match join_error.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        }
        Err(_) => "task cancelled".to_string(),
    }
}
