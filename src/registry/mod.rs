// Handler registration and dispatch-table lookup.

pub mod task_handler_registry;

pub use task_handler_registry::{HandlerOutcome, TaskContext, TaskHandler, TaskHandlerRegistry};
