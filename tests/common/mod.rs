//! Shared fixtures for the integration suites: temp databases, a fast
//! engine configuration, fixture handlers, and polling helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::watch;

use medley_task_core::models::TaskType;
use medley_task_core::orchestration::TaskStatistics;
use medley_task_core::{
    EngineConfig, HandlerOutcome, Task, TaskContext, TaskEngine, TaskHandler, TaskStatus,
};

/// Temp-file SQLite database with migrations applied. Keep the `TempDir`
/// alive for the duration of the test.
pub async fn temp_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("tasks.db");
    let url = format!("sqlite:{}", db_path.display());
    let pool = medley_task_core::db::init_pool(&url)
        .await
        .expect("init test database");
    (pool, dir)
}

/// Engine configuration tuned for tests: small pool, fast idle poll.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        database_url: "sqlite::memory:".to_string(),
        worker_count: 2,
        poll_interval: Duration::from_millis(50),
        stale_running_threshold: Duration::from_secs(3600),
        max_auto_requeues: 0,
        event_channel_capacity: 64,
    }
}

pub async fn test_engine() -> (TaskEngine, TempDir) {
    let (pool, dir) = temp_db().await;
    (TaskEngine::with_pool(pool, test_config()), dir)
}

pub async fn test_engine_with_config(config: EngineConfig) -> (TaskEngine, TempDir) {
    let (pool, dir) = temp_db().await;
    (TaskEngine::with_pool(pool, config), dir)
}

/// Poll statistics until `predicate` holds or `timeout` elapses.
pub async fn wait_for_stats(
    engine: &TaskEngine,
    timeout: Duration,
    predicate: impl Fn(&TaskStatistics) -> bool,
) -> TaskStatistics {
    let start = Instant::now();
    loop {
        let stats = engine.get_statistics().await.expect("statistics");
        if predicate(&stats) {
            return stats;
        }
        assert!(
            start.elapsed() < timeout,
            "timed out waiting for statistics, last seen: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll one task until it reaches `status` or `timeout` elapses.
pub async fn wait_for_status(
    engine: &TaskEngine,
    task_id: i64,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let start = Instant::now();
    loop {
        let task = engine.get_task(task_id).await.expect("task exists");
        if task.status == status {
            return task;
        }
        assert!(
            start.elapsed() < timeout,
            "timed out waiting for task {task_id} to become {status}, currently {}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Records every executed task id and succeeds.
pub struct RecordingHandler {
    types: Vec<TaskType>,
    pub executed: Mutex<Vec<i64>>,
}

impl RecordingHandler {
    pub fn new(types: Vec<TaskType>) -> Arc<Self> {
        Arc::new(Self {
            types,
            executed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    fn task_types(&self) -> &[TaskType] {
        &self.types
    }

    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<HandlerOutcome> {
        self.executed.lock().push(ctx.task().id);
        Ok(HandlerOutcome::with_message("done"))
    }
}

/// Always fails with a fixed message.
pub struct FailingHandler {
    types: Vec<TaskType>,
    pub message: &'static str,
}

impl FailingHandler {
    pub fn new(types: Vec<TaskType>, message: &'static str) -> Arc<Self> {
        Arc::new(Self { types, message })
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    fn task_types(&self) -> &[TaskType] {
        &self.types
    }

    async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<HandlerOutcome> {
        Err(anyhow::anyhow!(self.message))
    }
}

/// Fails the first `fail_times` executions, then succeeds.
pub struct FlakyHandler {
    types: Vec<TaskType>,
    fail_times: usize,
    attempts: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(types: Vec<TaskType>, fail_times: usize) -> Arc<Self> {
        Arc::new(Self {
            types,
            fail_times,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn task_types(&self) -> &[TaskType] {
        &self.types
    }

    async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<HandlerOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            anyhow::bail!("metadata provider returned an error");
        }
        Ok(HandlerOutcome::success())
    }
}

/// Panics on every execution.
pub struct PanickingHandler {
    types: Vec<TaskType>,
}

impl PanickingHandler {
    pub fn new(types: Vec<TaskType>) -> Arc<Self> {
        Arc::new(Self { types })
    }
}

#[async_trait]
impl TaskHandler for PanickingHandler {
    fn task_types(&self) -> &[TaskType] {
        &self.types
    }

    async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<HandlerOutcome> {
        panic!("handler exploded");
    }
}

/// Blocks until released, so tests can observe the running state.
pub struct GateHandler {
    types: Vec<TaskType>,
    release_tx: watch::Sender<bool>,
    release_rx: watch::Receiver<bool>,
    started: AtomicUsize,
}

impl GateHandler {
    pub fn new(types: Vec<TaskType>) -> Arc<Self> {
        let (release_tx, release_rx) = watch::channel(false);
        Arc::new(Self {
            types,
            release_tx,
            release_rx,
            started: AtomicUsize::new(0),
        })
    }

    /// Let every blocked execution finish.
    pub fn release(&self) {
        let _ = self.release_tx.send(true);
    }

    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for GateHandler {
    fn task_types(&self) -> &[TaskType] {
        &self.types
    }

    async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<HandlerOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.release_rx.clone();
        while !*rx.borrow() {
            rx.changed().await?;
        }
        Ok(HandlerOutcome::success())
    }
}
