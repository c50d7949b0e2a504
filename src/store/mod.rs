//! Run persistence with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: append-only JSON-lines journal, replayed on open
//!
//! Every lifecycle event is written to the backend before it is applied
//! to the in-memory view, so the store is the source of truth for what
//! happened during a run.

mod file;
mod ledger;
mod memory;
mod records;

pub use file::{FileJournal, FileStore, JOURNAL_FILE};
pub use ledger::{Journal, Ledger, LedgerStore, StoreRecord};
pub use memory::{MemoryJournal, MemoryStore};
pub use records::{
    Checkpoint, CodeReview, GateStatus, GateType, PhaseRun, PhaseRunId, PhaseRunStatus,
    QualityGateResult, ReviewVerdict, TaskRun, TaskRunId, EXIT_ABANDONED, EXIT_FAILED,
    EXIT_RELEASED, EXIT_SUCCESS,
};

use crate::core::{TaskId, TaskSpec, WorkerId};
use crate::error::Result;
use async_trait::async_trait;

/// Run store trait - implemented by all storage backends.
///
/// The `on_*` methods are the lifecycle events exchanged with the
/// persistence collaborator; the rest are queries used by resume and
/// reporting.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    async fn on_phase_run_start(
        &self,
        phase_name: &str,
        project_name: &str,
        assigned_agent: &str,
        tasks: &[TaskSpec],
    ) -> Result<PhaseRunId>;

    async fn on_task_run_start(
        &self,
        phase_run_id: PhaseRunId,
        task_id: &TaskId,
        assigned_agent: WorkerId,
    ) -> Result<TaskRun>;

    async fn on_task_run_complete(&self, task_run_id: TaskRunId, exit_code: i32) -> Result<()>;

    async fn on_quality_gate(&self, result: QualityGateResult) -> Result<()>;

    async fn on_code_review(&self, review: CodeReview) -> Result<()>;

    async fn on_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;

    async fn on_phase_run_complete(
        &self,
        phase_run_id: PhaseRunId,
        exit_code: i32,
        summary: &str,
    ) -> Result<()>;

    /// Put a finished phase run back in progress for a resume.
    async fn reopen_phase_run(&self, phase_run_id: PhaseRunId) -> Result<()>;

    async fn phase_run(&self, phase_run_id: PhaseRunId) -> Result<Option<PhaseRun>>;

    /// Most recent phase run for the same phase, project, and task list.
    async fn find_phase_run(
        &self,
        phase_name: &str,
        project_name: &str,
        tasks: &[TaskSpec],
    ) -> Result<Option<PhaseRun>>;

    /// All phase runs, oldest first.
    async fn phase_runs(&self) -> Result<Vec<PhaseRun>>;

    async fn task_run(&self, task_run_id: TaskRunId) -> Result<Option<TaskRun>>;

    /// Task runs of a phase run, in the order they were claimed.
    async fn task_runs(&self, phase_run_id: PhaseRunId) -> Result<Vec<TaskRun>>;

    async fn gate_results(&self, task_run_id: TaskRunId) -> Result<Vec<QualityGateResult>>;

    async fn phase_gate_results(&self, phase_run_id: PhaseRunId)
        -> Result<Vec<QualityGateResult>>;

    async fn code_reviews(&self, task_run_id: TaskRunId) -> Result<Vec<CodeReview>>;

    async fn checkpoints(&self, task_run_id: TaskRunId) -> Result<Vec<Checkpoint>>;
}
