use crate::error::{EngineError, Result};
use std::time::Duration;

/// Engine configuration with environment-variable overrides.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite connection URL for the task database.
    pub database_url: String,
    /// Number of concurrent dispatcher workers. A single worker is the
    /// degenerate-but-correct deployment.
    pub worker_count: usize,
    /// How long an idle worker sleeps before re-polling the ready set when
    /// no enqueue wake-up arrives.
    pub poll_interval: Duration,
    /// A running task older than this is considered stale and surfaced for
    /// operator intervention.
    pub stale_running_threshold: Duration,
    /// Maximum number of automatic re-enqueues for a task whose handler
    /// crashed. Zero disables the behavior; failed tasks then only re-run
    /// through the manual retry operation.
    pub max_auto_requeues: u32,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:medley_tasks.db".to_string(),
            worker_count: 4,
            poll_interval: Duration::from_secs(5),
            stale_running_threshold: Duration::from_secs(24 * 3600),
            max_auto_requeues: 0,
            event_channel_capacity: 1000,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from defaults plus `MEDLEY_*` environment
    /// overrides. Unparseable values are configuration errors rather than
    /// silent fallbacks.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(value) = std::env::var("MEDLEY_WORKER_COUNT") {
            config.worker_count = value.parse().map_err(|e| {
                EngineError::Configuration(format!("Invalid MEDLEY_WORKER_COUNT: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("MEDLEY_POLL_INTERVAL_SECS") {
            let secs: u64 = value.parse().map_err(|e| {
                EngineError::Configuration(format!("Invalid MEDLEY_POLL_INTERVAL_SECS: {e}"))
            })?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(value) = std::env::var("MEDLEY_STALE_RUNNING_HOURS") {
            let hours: u64 = value.parse().map_err(|e| {
                EngineError::Configuration(format!("Invalid MEDLEY_STALE_RUNNING_HOURS: {e}"))
            })?;
            config.stale_running_threshold = Duration::from_secs(hours * 3600);
        }

        if let Ok(value) = std::env::var("MEDLEY_MAX_AUTO_REQUEUES") {
            config.max_auto_requeues = value.parse().map_err(|e| {
                EngineError::Configuration(format!("Invalid MEDLEY_MAX_AUTO_REQUEUES: {e}"))
            })?;
        }

        Ok(config)
    }
}
