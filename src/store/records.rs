//! Durable records of phase execution.

use crate::core::{TaskId, TaskSpec, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task run exit code for a run that passed its quality gate.
pub const EXIT_SUCCESS: i32 = 0;
/// Task run exit code for a failed attempt (worker crash, timeout, abort).
pub const EXIT_FAILED: i32 = 1;
/// Task run exit code when the owner released the task unfinished.
pub const EXIT_RELEASED: i32 = 2;
/// Task run exit code for runs left open by a coordinator that went away.
pub const EXIT_ABANDONED: i32 = 3;

/// Unique identifier for a phase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseRunId(pub Uuid);

impl PhaseRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PhaseRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PhaseRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PhaseRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a task run (one attempt at one task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRunId(pub Uuid);

impl TaskRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRunStatus {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for PhaseRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseRunStatus::InProgress => write!(f, "in_progress"),
            PhaseRunStatus::Completed => write!(f, "completed"),
            PhaseRunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One execution attempt of a whole task list.
///
/// Reused, not recreated, when the run is resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRun {
    pub id: PhaseRunId,
    pub phase_name: String,
    pub project_name: String,
    pub status: PhaseRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_agent: String,
    /// Snapshot of the task list so the run can be resumed without it.
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// One attempt of one task inside a phase run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub phase_run_id: PhaseRunId,
    pub task_id: TaskId,
    pub owner: WorkerId,
    pub claimed_at: DateTime<Utc>,
    /// Set only when the run passed its gate (`exit_code == 0`).
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the run closed for any reason.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl TaskRun {
    pub fn is_open(&self) -> bool {
        self.exit_code.is_none()
    }

    pub fn is_successful(&self) -> bool {
        self.exit_code == Some(EXIT_SUCCESS)
    }

    /// `completed_at - claimed_at` for a successful run.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.claimed_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Lint,
    Build,
    Test,
    Review,
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateType::Lint => write!(f, "lint"),
            GateType::Build => write!(f, "build"),
            GateType::Test => write!(f, "test"),
            GateType::Review => write!(f, "review"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Passed => write!(f, "passed"),
            GateStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub phase_run_id: PhaseRunId,
    pub task_run_id: TaskRunId,
    pub gate_type: GateType,
    pub status: GateStatus,
    pub summary: String,
    pub checked_by: String,
    /// 1-based gate evaluation this result belongs to.
    pub attempt: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    NeedsFollowup,
}

impl std::fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewVerdict::Approved => write!(f, "approved"),
            ReviewVerdict::NeedsFollowup => write!(f, "needs_followup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeReview {
    pub phase_run_id: PhaseRunId,
    pub task_run_id: TaskRunId,
    pub reviewer: String,
    pub verdict: ReviewVerdict,
    pub summary: String,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Advisory persistence point for a long-running task. Never a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase_run_id: PhaseRunId,
    pub task_run_id: TaskRunId,
    pub attempt: u32,
    pub elapsed_secs: u64,
    pub note: String,
    pub recorded_at: DateTime<Utc>,
}
