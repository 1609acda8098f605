//! Structured logging setup: console output plus a JSON log file, with
//! environment-aware default levels. Initialization is idempotent so
//! embedding applications that already install a subscriber keep theirs.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with a console layer and a non-blocking JSON file
/// layer under `log/`. Safe to call more than once; later calls are
/// no-ops, as is running under an application that installed its own
/// global subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from("log");
        if !log_dir.exists() && fs::create_dir_all(&log_dir).is_err() {
            // No writable log directory: console-only logging.
            let _ = tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_filter(EnvFilter::new(log_level)),
                )
                .try_init();
            return;
        }

        let file_name = format!("{}.{}.log", environment, process::id());
        let file_appender = tracing_appender::rolling::never(&log_dir, &file_name);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level)),
            );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already installed, keeping it");
        } else {
            tracing::info!(
                environment = %environment,
                log_file = %log_dir.join(&file_name).display(),
                "structured logging initialized"
            );
        }

        // Keep the writer guard alive for the process lifetime.
        std::mem::forget(guard);
    });
}

fn get_environment() -> String {
    std::env::var("MEDLEY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    if let Ok(level) = std::env::var("RUST_LOG") {
        return level;
    }
    match environment {
        "production" => "medley_task_core=info".to_string(),
        "test" => "medley_task_core=warn".to_string(),
        _ => "medley_task_core=debug".to_string(),
    }
}
