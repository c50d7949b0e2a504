//! Task data model for the phase graph.
//!
//! Tasks are the atomic units of work claimed by workers. Each task
//! tracks its status, current owner, and how many attempts have failed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a task within a task list.
///
/// Task ids are authored by the task-list collaborator, so they are
/// free-form strings rather than generated UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a worker execution context.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Create a new unique worker identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One record of the task list handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub subject: String,
    /// Which kind of agent should pick this task up.
    #[serde(default, alias = "agent_hint", skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_minutes: Option<u32>,
}

impl TaskSpec {
    pub fn new(id: &str, subject: &str) -> Self {
        Self {
            id: TaskId::from(id),
            subject: subject.to_string(),
            agent: None,
            depends_on: Vec::new(),
            estimate_minutes: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn with_estimate(mut self, minutes: u32) -> Self {
        self.estimate_minutes = Some(minutes);
        self
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Dependencies not yet satisfied, or returned to the pool after a failure.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a worker to claim it.
    Ready,
    /// Owned by a worker that has not started executing yet.
    Claimed,
    /// Owned by a worker that is executing or retrying the quality gate.
    InProgress,
    /// Passed the quality gate; terminal.
    Completed,
    /// Exhausted its attempts; terminal for this run.
    Failed,
}

impl TaskStatus {
    /// Whether a worker currently owns the task.
    pub fn is_owned(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }

    /// Whether the task may still be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Claimed => write!(f, "claimed"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single task in the phase graph.
///
/// Created by the graph builder and never deleted within a run. Status and
/// owner only change through the dispatcher's claim/complete/fail/release
/// transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub subject: String,
    pub agent_hint: Option<String>,
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    pub owner: Option<WorkerId>,
    pub estimated_duration: Option<Duration>,
    /// Advisory topological layer, filled in by the graph builder.
    pub wave_index: usize,
    /// Number of attempts that ended in a worker failure.
    pub failed_attempts: u32,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self {
            id: spec.id.clone(),
            subject: spec.subject.clone(),
            agent_hint: spec.agent.clone(),
            depends_on: spec.depends_on.clone(),
            status: TaskStatus::Pending,
            owner: None,
            estimated_duration: spec
                .estimate_minutes
                .map(|m| Duration::from_secs(u64::from(m) * 60)),
            wave_index: 0,
            failed_attempts: 0,
        }
    }

    /// Mark the task as ready for execution.
    pub fn mark_ready(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Ready;
        }
    }

    /// Take ownership of the task for a worker.
    pub fn claim(&mut self, worker: WorkerId) {
        self.status = TaskStatus::Claimed;
        self.owner = Some(worker);
    }

    /// The owner began executing the task.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
    }

    /// Mark the task as completed. The completing owner is kept for reporting.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
    }

    /// Give the task back without counting a failed attempt.
    pub fn release(&mut self) {
        self.status = TaskStatus::Pending;
        self.owner = None;
    }

    /// Record a failed attempt and drop ownership.
    ///
    /// Returns `true` when the task can be claimed again, `false` once
    /// `max_attempts` failures have accumulated and the task is failed.
    pub fn fail_attempt(&mut self, max_attempts: Option<u32>) -> bool {
        self.failed_attempts += 1;
        self.owner = None;
        match max_attempts {
            Some(max) if self.failed_attempts >= max => {
                self.status = TaskStatus::Failed;
                false
            }
            _ => {
                self.status = TaskStatus::Pending;
                true
            }
        }
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status.is_owned() && self.owner.as_ref() == Some(worker)
    }
}
