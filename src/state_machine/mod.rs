// Task lifecycle state management: the closed status set, the events that
// move between statuses, and guarded persistence of each transition.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::TaskStatus;
pub use task_state_machine::TaskStateMachine;
