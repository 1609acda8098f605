use serde::{Deserialize, Serialize};

/// Events that drive task status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// Dispatcher claimed the task for execution.
    Start,
    /// Handler finished successfully.
    Complete,
    /// Handler returned or raised an error; carries the message.
    Fail(String),
    /// Caller or operator cancelled the task; carries the reason.
    Cancel(String),
    /// Caller asked for a finalized task to run again. Validated through
    /// the transition table, realized as a successor record by the
    /// enqueuer.
    Retry,
}

impl TaskEvent {
    /// Short name used in logs and published events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel(_) => "cancel",
            Self::Retry => "retry",
        }
    }
}
