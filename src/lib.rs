//! # Medley Task Core
//!
//! Background task orchestration engine for the Medley music library
//! manager. The web layer enqueues units of work (sync an artist,
//! download an album, scan a library, install a plugin, …); this crate
//! deduplicates and prioritizes them, executes them on a worker pool
//! outside the request cycle, tracks their lifecycle, and answers the
//! status/retry/cancel operations the UI polls.
//!
//! ## Architecture
//!
//! - [`models`] - the task table: queue, ready set, and audit history
//! - [`state_machine`] - status transitions as guarded atomic updates
//! - [`registry`] - task type → handler dispatch table
//! - [`orchestration`] - enqueue/claim/execute/finalize plus read views
//! - [`events`] - lifecycle event broadcasting
//! - [`config`] / [`logging`] / [`error`] - ambient plumbing
//!
//! ## Guarantees
//!
//! - At most one active (pending or running) task per dedup key,
//!   enforced by a partial unique index.
//! - Pending tasks run in priority-descending, oldest-first order.
//! - Every status change is a single guarded UPDATE; concurrent workers
//!   and callers cannot double-apply a transition.
//! - `started_at` / `completed_at` are write-once.
//! - A handler failure or panic finalizes its own task and nothing else.
//!
//! ## Quick start
//!
//! ```ignore
//! use medley_task_core::{EngineConfig, TaskEngine};
//! use medley_task_core::models::{EntityRef, TaskType};
//! use medley_task_core::orchestration::EnqueueRequest;
//!
//! let engine = TaskEngine::connect(EngineConfig::from_env()?).await?;
//! engine.registry().register(std::sync::Arc::new(SyncArtistHandler::new(..)));
//! engine.start()?;
//!
//! let outcome = engine
//!     .enqueue(EnqueueRequest::new(TaskType::SyncArtist, EntityRef::for_id(7)))
//!     .await?;
//! let view = engine.get_status(outcome.task.id).await?;
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{EventPublisher, LifecycleEvent};
pub use models::{EntityRef, NewTask, Page, Task, TaskFilters, TaskType};
pub use orchestration::{
    BulkOutcome, EnqueueOutcome, EnqueueRequest, TaskEngine, TaskStatistics, TaskStatusView,
};
pub use registry::{HandlerOutcome, TaskContext, TaskHandler, TaskHandlerRegistry};
pub use state_machine::{TaskEvent, TaskStatus};
