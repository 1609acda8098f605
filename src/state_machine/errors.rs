use crate::state_machine::states::TaskStatus;

/// Errors raised while evaluating or persisting a status transition.
#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// The requested edge does not exist in the transition table. The
    /// database is not touched.
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: TaskStatus, event: String },

    /// The guarded update affected zero rows: another caller moved the
    /// task first. Losers handle this quietly (re-claim, keep the winner's
    /// state); it is never surfaced to end users.
    #[error("Task {task_id} was concurrently transitioned away from {expected}")]
    ConcurrentTransition {
        task_id: i64,
        expected: TaskStatus,
    },

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Database error during transition: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
