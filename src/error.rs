use crate::state_machine::errors::StateMachineError;
use crate::state_machine::states::TaskStatus;

/// Crate-wide error type covering every failure class the engine can
/// report to a caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Retry/cancel was requested from a status that does not allow it.
    /// Reported to the caller; the task row is left untouched.
    #[error("Task {task_id} is {status} and cannot be {operation}")]
    InvalidState {
        task_id: i64,
        status: TaskStatus,
        operation: &'static str,
    },

    /// No handler registered for a task type. A configuration error, not a
    /// transient condition: the task fails and is never retried
    /// automatically.
    #[error("No handler registered for task type \"{0}\"")]
    HandlerNotRegistered(String),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Event error: {0}")]
    Event(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
