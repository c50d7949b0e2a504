use crate::core::{TaskId, WorkerId};
use crate::store::TaskRunId;
use thiserror::Error;

/// Exit code for a run that completed with every task successful.
pub const EXIT_OK: i32 = 0;
/// Exit code for a run that halted or ended with incomplete tasks.
pub const EXIT_INCOMPLETE: i32 = 1;
/// Exit code when the task list fails graph validation.
pub const EXIT_GRAPH: i32 = 2;
/// Exit code when the scheduler detects a deadlock.
pub const EXIT_DEADLOCK: i32 = 3;
/// Exit code when the run store is unavailable.
pub const EXIT_PERSISTENCE: i32 = 4;
/// Exit code for configuration and usage errors.
pub const EXIT_USAGE: i32 = 5;

/// Structural problems found while validating a task list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("dependency cycle detected: {}", format_path(cycle_path))]
    CycleDetected { cycle_path: Vec<TaskId> },

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("task at position {0} has an empty id")]
    EmptyTaskId(usize),
}

fn format_path(path: &[TaskId]) -> String {
    let mut parts: Vec<String> = path.iter().map(|id| id.to_string()).collect();
    if let Some(first) = path.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Claim conflict on task {task_id}")]
    ClaimConflict { task_id: TaskId },

    #[error("Task {task_id} is not ready to be claimed")]
    TaskNotReady { task_id: TaskId },

    #[error("Worker {worker_id} does not own task {task_id}")]
    NotOwner { task_id: TaskId, worker_id: WorkerId },

    #[error("Quality gate failed for task run {task_run_id}: {summary}")]
    QualityGateFailure {
        task_run_id: TaskRunId,
        summary: String,
    },

    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    #[error("Deadlock: tasks [{}] can never become ready", format_ids(blocked))]
    Deadlock { blocked: Vec<TaskId> },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task run not found: {0}")]
    TaskRunNotFound(TaskRunId),

    /// The run was already closed, e.g. failed after its owner went silent.
    #[error("Task run {0} is already closed")]
    TaskRunClosed(TaskRunId),

    /// A store write that is not a legal transition of the recorded state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Phase run not found: {0}")]
    PhaseRunNotFound(String),

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: WorkerId },

    #[error("Worker pool is full (max {max})")]
    PoolFull { max: usize },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Conditions the orchestrator absorbs without surfacing to the operator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ClaimConflict { .. }
                | Error::TaskNotReady { .. }
                | Error::QualityGateFailure { .. }
        )
    }

    /// Process exit code for an error that halts the run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Graph(_) => EXIT_GRAPH,
            Error::Deadlock { .. } => EXIT_DEADLOCK,
            Error::Persistence(_) | Error::Io(_) | Error::Json(_) => EXIT_PERSISTENCE,
            Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Validation(_)
            | Error::NoHomeDir
            | Error::PhaseRunNotFound(_) => EXIT_USAGE,
            _ => EXIT_INCOMPLETE,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
