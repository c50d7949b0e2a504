//! Journal records and the in-memory view rebuilt from them.

use super::records::{
    Checkpoint, CodeReview, PhaseRun, PhaseRunId, PhaseRunStatus, QualityGateResult, TaskRun,
    TaskRunId, EXIT_SUCCESS,
};
use super::RunStore;
use crate::core::{TaskId, TaskSpec, WorkerId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// One appended state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreRecord {
    PhaseRunStarted(PhaseRun),
    PhaseRunReopened {
        phase_run_id: PhaseRunId,
        at: DateTime<Utc>,
    },
    PhaseRunCompleted {
        phase_run_id: PhaseRunId,
        exit_code: i32,
        summary: String,
        at: DateTime<Utc>,
    },
    TaskRunStarted(TaskRun),
    TaskRunCompleted {
        task_run_id: TaskRunId,
        exit_code: i32,
        at: DateTime<Utc>,
    },
    QualityGate(QualityGateResult),
    CodeReview(CodeReview),
    Checkpoint(Checkpoint),
}

/// The state of a store, as the fold of its records.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    phase_runs: HashMap<PhaseRunId, PhaseRun>,
    phase_order: Vec<PhaseRunId>,
    task_runs: HashMap<TaskRunId, TaskRun>,
    task_run_order: Vec<TaskRunId>,
    gate_results: Vec<QualityGateResult>,
    reviews: Vec<CodeReview>,
    checkpoints: Vec<Checkpoint>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject records that would not be a legal transition of the current state.
    pub fn check(&self, record: &StoreRecord) -> Result<()> {
        match record {
            StoreRecord::PhaseRunStarted(run) => {
                if self.phase_runs.contains_key(&run.id) {
                    return Err(Error::InvalidTransition(format!(
                        "phase run {} already exists",
                        run.id
                    )));
                }
            }
            StoreRecord::PhaseRunReopened { phase_run_id, .. }
            | StoreRecord::PhaseRunCompleted { phase_run_id, .. } => {
                self.require_phase_run(phase_run_id)?;
            }
            StoreRecord::TaskRunStarted(run) => {
                self.require_phase_run(&run.phase_run_id)?;
            }
            StoreRecord::TaskRunCompleted { task_run_id, .. } => {
                self.require_open_task_run(task_run_id)?;
            }
            StoreRecord::QualityGate(result) => {
                self.require_open_task_run(&result.task_run_id)?;
            }
            StoreRecord::CodeReview(review) => {
                self.require_open_task_run(&review.task_run_id)?;
            }
            StoreRecord::Checkpoint(checkpoint) => {
                self.require_open_task_run(&checkpoint.task_run_id)?;
            }
        }
        Ok(())
    }

    fn require_phase_run(&self, id: &PhaseRunId) -> Result<&PhaseRun> {
        self.phase_runs
            .get(id)
            .ok_or_else(|| Error::PhaseRunNotFound(id.to_string()))
    }

    fn require_open_task_run(&self, id: &TaskRunId) -> Result<&TaskRun> {
        let run = self.task_runs.get(id).ok_or(Error::TaskRunNotFound(*id))?;
        if !run.is_open() {
            return Err(Error::TaskRunClosed(*id));
        }
        Ok(run)
    }

    /// Fold a record into the state. Records are assumed to have passed `check`.
    pub fn apply(&mut self, record: StoreRecord) {
        match record {
            StoreRecord::PhaseRunStarted(run) => {
                self.phase_order.push(run.id);
                self.phase_runs.insert(run.id, run);
            }
            StoreRecord::PhaseRunReopened { phase_run_id, .. } => {
                if let Some(run) = self.phase_runs.get_mut(&phase_run_id) {
                    run.status = PhaseRunStatus::InProgress;
                    run.completed_at = None;
                    run.exit_code = None;
                    run.summary = None;
                }
            }
            StoreRecord::PhaseRunCompleted {
                phase_run_id,
                exit_code,
                summary,
                at,
            } => {
                if let Some(run) = self.phase_runs.get_mut(&phase_run_id) {
                    run.status = if exit_code == EXIT_SUCCESS {
                        PhaseRunStatus::Completed
                    } else {
                        PhaseRunStatus::Failed
                    };
                    run.completed_at = Some(at);
                    run.exit_code = Some(exit_code);
                    run.summary = Some(summary);
                }
            }
            StoreRecord::TaskRunStarted(run) => {
                self.task_run_order.push(run.id);
                self.task_runs.insert(run.id, run);
            }
            StoreRecord::TaskRunCompleted {
                task_run_id,
                exit_code,
                at,
            } => {
                if let Some(run) = self.task_runs.get_mut(&task_run_id) {
                    run.exit_code = Some(exit_code);
                    run.ended_at = Some(at);
                    if exit_code == EXIT_SUCCESS {
                        run.completed_at = Some(at);
                    }
                }
            }
            StoreRecord::QualityGate(result) => self.gate_results.push(result),
            StoreRecord::CodeReview(review) => self.reviews.push(review),
            StoreRecord::Checkpoint(checkpoint) => self.checkpoints.push(checkpoint),
        }
    }

    pub fn phase_run(&self, id: &PhaseRunId) -> Option<&PhaseRun> {
        self.phase_runs.get(id)
    }

    pub fn phase_runs(&self) -> Vec<PhaseRun> {
        self.phase_order
            .iter()
            .filter_map(|id| self.phase_runs.get(id).cloned())
            .collect()
    }

    pub fn find_phase_run(
        &self,
        phase_name: &str,
        project_name: &str,
        tasks: &[TaskSpec],
    ) -> Option<&PhaseRun> {
        self.phase_order
            .iter()
            .rev()
            .filter_map(|id| self.phase_runs.get(id))
            .find(|run| {
                run.phase_name == phase_name
                    && run.project_name == project_name
                    && run.tasks == tasks
            })
    }

    pub fn task_run(&self, id: &TaskRunId) -> Option<&TaskRun> {
        self.task_runs.get(id)
    }

    pub fn task_runs(&self, phase_run_id: &PhaseRunId) -> Vec<TaskRun> {
        self.task_run_order
            .iter()
            .filter_map(|id| self.task_runs.get(id))
            .filter(|run| &run.phase_run_id == phase_run_id)
            .cloned()
            .collect()
    }

    pub fn gate_results(&self, task_run_id: &TaskRunId) -> Vec<QualityGateResult> {
        self.gate_results
            .iter()
            .filter(|r| &r.task_run_id == task_run_id)
            .cloned()
            .collect()
    }

    pub fn phase_gate_results(&self, phase_run_id: &PhaseRunId) -> Vec<QualityGateResult> {
        self.gate_results
            .iter()
            .filter(|r| &r.phase_run_id == phase_run_id)
            .cloned()
            .collect()
    }

    pub fn code_reviews(&self, task_run_id: &TaskRunId) -> Vec<CodeReview> {
        self.reviews
            .iter()
            .filter(|r| &r.task_run_id == task_run_id)
            .cloned()
            .collect()
    }

    pub fn checkpoints(&self, task_run_id: &TaskRunId) -> Vec<Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|c| &c.task_run_id == task_run_id)
            .cloned()
            .collect()
    }
}

/// Where records go before they are applied.
#[async_trait]
pub trait Journal: Send + Sync {
    fn is_persistent(&self) -> bool;

    /// Durably append one record. Must not return before the record is durable.
    async fn append(&self, record: &StoreRecord) -> Result<()>;
}

/// A `RunStore` built from a journal backend and the ledger it feeds.
///
/// Writes hold the ledger lock across the journal append, which makes
/// every transition serializable.
pub struct LedgerStore<J: Journal> {
    journal: J,
    ledger: RwLock<Ledger>,
}

impl<J: Journal> LedgerStore<J> {
    pub fn with_ledger(journal: J, ledger: Ledger) -> Self {
        Self {
            journal,
            ledger: RwLock::new(ledger),
        }
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    /// Check, append, then apply a record.
    async fn commit(&self, record: StoreRecord) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        ledger.check(&record)?;
        self.journal.append(&record).await?;
        ledger.apply(record);
        Ok(())
    }
}

#[async_trait]
impl<J: Journal> RunStore for LedgerStore<J> {
    fn is_persistent(&self) -> bool {
        self.journal.is_persistent()
    }

    async fn on_phase_run_start(
        &self,
        phase_name: &str,
        project_name: &str,
        assigned_agent: &str,
        tasks: &[TaskSpec],
    ) -> Result<PhaseRunId> {
        let run = PhaseRun {
            id: PhaseRunId::new(),
            phase_name: phase_name.to_string(),
            project_name: project_name.to_string(),
            status: PhaseRunStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            assigned_agent: assigned_agent.to_string(),
            tasks: tasks.to_vec(),
            exit_code: None,
            summary: None,
        };
        let id = run.id;
        self.commit(StoreRecord::PhaseRunStarted(run)).await?;
        debug!(phase_run = %id.short(), phase_name, project_name, "phase run recorded");
        Ok(id)
    }

    async fn on_task_run_start(
        &self,
        phase_run_id: PhaseRunId,
        task_id: &TaskId,
        assigned_agent: WorkerId,
    ) -> Result<TaskRun> {
        let run = TaskRun {
            id: TaskRunId::new(),
            phase_run_id,
            task_id: task_id.clone(),
            owner: assigned_agent,
            claimed_at: Utc::now(),
            completed_at: None,
            ended_at: None,
            exit_code: None,
        };
        self.commit(StoreRecord::TaskRunStarted(run.clone())).await?;
        Ok(run)
    }

    async fn on_task_run_complete(&self, task_run_id: TaskRunId, exit_code: i32) -> Result<()> {
        self.commit(StoreRecord::TaskRunCompleted {
            task_run_id,
            exit_code,
            at: Utc::now(),
        })
        .await
    }

    async fn on_quality_gate(&self, result: QualityGateResult) -> Result<()> {
        self.commit(StoreRecord::QualityGate(result)).await
    }

    async fn on_code_review(&self, review: CodeReview) -> Result<()> {
        self.commit(StoreRecord::CodeReview(review)).await
    }

    async fn on_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        self.commit(StoreRecord::Checkpoint(checkpoint)).await
    }

    async fn on_phase_run_complete(
        &self,
        phase_run_id: PhaseRunId,
        exit_code: i32,
        summary: &str,
    ) -> Result<()> {
        self.commit(StoreRecord::PhaseRunCompleted {
            phase_run_id,
            exit_code,
            summary: summary.to_string(),
            at: Utc::now(),
        })
        .await
    }

    async fn reopen_phase_run(&self, phase_run_id: PhaseRunId) -> Result<()> {
        self.commit(StoreRecord::PhaseRunReopened {
            phase_run_id,
            at: Utc::now(),
        })
        .await
    }

    async fn phase_run(&self, phase_run_id: PhaseRunId) -> Result<Option<PhaseRun>> {
        Ok(self.ledger.read().await.phase_run(&phase_run_id).cloned())
    }

    async fn find_phase_run(
        &self,
        phase_name: &str,
        project_name: &str,
        tasks: &[TaskSpec],
    ) -> Result<Option<PhaseRun>> {
        Ok(self
            .ledger
            .read()
            .await
            .find_phase_run(phase_name, project_name, tasks)
            .cloned())
    }

    async fn phase_runs(&self) -> Result<Vec<PhaseRun>> {
        Ok(self.ledger.read().await.phase_runs())
    }

    async fn task_run(&self, task_run_id: TaskRunId) -> Result<Option<TaskRun>> {
        Ok(self.ledger.read().await.task_run(&task_run_id).cloned())
    }

    async fn task_runs(&self, phase_run_id: PhaseRunId) -> Result<Vec<TaskRun>> {
        Ok(self.ledger.read().await.task_runs(&phase_run_id))
    }

    async fn gate_results(&self, task_run_id: TaskRunId) -> Result<Vec<QualityGateResult>> {
        Ok(self.ledger.read().await.gate_results(&task_run_id))
    }

    async fn phase_gate_results(
        &self,
        phase_run_id: PhaseRunId,
    ) -> Result<Vec<QualityGateResult>> {
        Ok(self.ledger.read().await.phase_gate_results(&phase_run_id))
    }

    async fn code_reviews(&self, task_run_id: TaskRunId) -> Result<Vec<CodeReview>> {
        Ok(self.ledger.read().await.code_reviews(&task_run_id))
    }

    async fn checkpoints(&self, task_run_id: TaskRunId) -> Result<Vec<Checkpoint>> {
        Ok(self.ledger.read().await.checkpoints(&task_run_id))
    }
}
