// Data layer. One model: the task table is the queue, the ready set, and
// the audit history all at once.

pub mod task;

pub use task::{
    derive_unique_key, priority, EntityRef, NewTask, Page, SortOrder, Task, TaskFilters, TaskSort,
    TaskType,
};
