//! Core domain models for phase execution.
//!
//! Tasks, the validated dependency graph, and task list loading.

pub mod dag;
pub mod task;
pub mod tasklist;

pub use dag::TaskGraph;
pub use task::{Task, TaskId, TaskSpec, TaskStatus, WorkerId};
pub use tasklist::TaskList;
