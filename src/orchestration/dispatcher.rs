//! Worker Dispatcher: the claim protocol.
//!
//! All task ownership lives on one board behind an async mutex. A claim is
//! a compare-and-swap on `(status, owner)` performed while holding that lock,
//! and the store append happens inside the same critical section, so the
//! journal order is the transition order and concurrent claims on a task
//! yield exactly one winner.
//!
//! Only `claim`, `start`, `complete`, `fail` and `release` change ownership.
//! Every transition bumps a version on a `watch` channel so waiting workers
//! can recompute the ready set.

use crate::core::{Task, TaskGraph, TaskId, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use crate::quality::GateRequirements;
use crate::store::{
    PhaseRunId, RunStore, TaskRun, TaskRunId, EXIT_FAILED, EXIT_RELEASED, EXIT_SUCCESS,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle events for observers of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TaskClaimed {
        task_id: TaskId,
        worker_id: WorkerId,
        task_run_id: TaskRunId,
    },
    TaskCompleted {
        task_id: TaskId,
        task_run_id: TaskRunId,
    },
    TaskFailed {
        task_id: TaskId,
        task_run_id: TaskRunId,
        reason: String,
        /// Whether the task went back to the pool.
        requeued: bool,
    },
    TaskReleased {
        task_id: TaskId,
        task_run_id: TaskRunId,
    },
    GateBlocked {
        task_id: TaskId,
        task_run_id: TaskRunId,
        attempt: u32,
        failures: Vec<String>,
    },
    Checkpointed {
        task_id: TaskId,
        task_run_id: TaskRunId,
        elapsed_secs: u64,
    },
}

/// A consistent copy of every task's state.
#[derive(Debug, Clone)]
pub struct BoardSnapshot {
    pub version: u64,
    pub tasks: HashMap<TaskId, Task>,
}

impl BoardSnapshot {
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn owner(&self, id: &TaskId) -> Option<WorkerId> {
        self.tasks.get(id).and_then(|t| t.owner)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

/// A task run the dispatcher currently tracks as open.
#[derive(Debug, Clone)]
struct ActiveRun {
    task_id: TaskId,
    owner: WorkerId,
}

/// A run failed by `reap` because its owner stopped heartbeating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedRun {
    pub task_run_id: TaskRunId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub silent_for: Duration,
    pub requeued: bool,
}

#[derive(Debug, Default)]
struct Board {
    tasks: HashMap<TaskId, Task>,
    runs: HashMap<TaskRunId, ActiveRun>,
    heartbeats: HashMap<WorkerId, Instant>,
}

impl Board {
    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Promote pending tasks whose dependencies are all completed.
    fn refresh_ready(&mut self) {
        let ready: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.deps_completed(t))
            .map(|t| t.id.clone())
            .collect();
        for id in ready {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.mark_ready();
            }
        }
    }
}

pub struct Dispatcher {
    phase_run_id: PhaseRunId,
    store: Arc<dyn RunStore>,
    requirements: GateRequirements,
    max_task_attempts: Option<u32>,
    board: Mutex<Board>,
    version: watch::Sender<u64>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl Dispatcher {
    pub fn new(
        phase_run_id: PhaseRunId,
        graph: &TaskGraph,
        store: Arc<dyn RunStore>,
        requirements: GateRequirements,
    ) -> Self {
        let mut board = Board {
            tasks: graph.tasks().map(|t| (t.id.clone(), t.clone())).collect(),
            ..Board::default()
        };
        board.refresh_ready();
        let (version, _) = watch::channel(0);
        Self {
            phase_run_id,
            store,
            requirements,
            max_task_attempts: None,
            board: Mutex::new(board),
            version,
            events: None,
        }
    }

    /// Worker failures per task before it is marked failed. `None` never gives up.
    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_task_attempts = max;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Mark tasks that already have a successful task run (resume).
    pub fn with_completed(mut self, completed: &HashSet<TaskId>) -> Self {
        let board = self.board.get_mut();
        for id in completed {
            if let Some(task) = board.tasks.get_mut(id) {
                task.complete();
            }
        }
        board.refresh_ready();
        self
    }

    pub fn phase_run_id(&self) -> PhaseRunId {
        self.phase_run_id
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Receiver that changes after every ownership transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn bump(&self) -> u64 {
        let mut next = 0;
        self.version.send_modify(|v| {
            *v += 1;
            next = *v;
        });
        next
    }

    /// Atomically take ownership of a task and open a task run for it.
    ///
    /// # Errors
    ///
    /// - `ClaimConflict` if another worker owns or already finished the task
    /// - `TaskNotReady` if its dependencies are incomplete or it has failed
    /// - any store error; the board is left unchanged
    pub async fn claim(&self, task_id: &TaskId, worker: WorkerId) -> Result<TaskRun> {
        let mut board = self.board.lock().await;
        let task = board
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

        if task.status.is_owned() || task.status == TaskStatus::Completed || task.owner.is_some()
        {
            debug!(task = %task_id, worker = %worker.short(), "claim conflict");
            return Err(Error::ClaimConflict {
                task_id: task_id.clone(),
            });
        }
        if !task.status.is_claimable() || !board.deps_completed(task) {
            return Err(Error::TaskNotReady {
                task_id: task_id.clone(),
            });
        }

        let run = self
            .store
            .on_task_run_start(self.phase_run_id, task_id, worker)
            .await?;

        board.task_mut(task_id)?.claim(worker);
        board.runs.insert(
            run.id,
            ActiveRun {
                task_id: task_id.clone(),
                owner: worker,
            },
        );
        board.heartbeats.insert(worker, Instant::now());
        drop(board);

        info!(task = %task_id, worker = %worker.short(), run = %run.id.short(), "task claimed");
        self.bump();
        self.emit(RunEvent::TaskClaimed {
            task_id: task_id.clone(),
            worker_id: worker,
            task_run_id: run.id,
        });
        Ok(run)
    }

    fn owned_run<'a>(
        board: &'a Board,
        task_run_id: TaskRunId,
        worker: WorkerId,
    ) -> Result<&'a ActiveRun> {
        let run = board
            .runs
            .get(&task_run_id)
            .ok_or(Error::TaskRunNotFound(task_run_id))?;
        if run.owner != worker {
            return Err(Error::NotOwner {
                task_id: run.task_id.clone(),
                worker_id: worker,
            });
        }
        Ok(run)
    }

    /// The owner began executing: `claimed -> in_progress`.
    pub async fn start(&self, task_run_id: TaskRunId, worker: WorkerId) -> Result<()> {
        let mut board = self.board.lock().await;
        let task_id = Self::owned_run(&board, task_run_id, worker)?.task_id.clone();
        board.task_mut(&task_id)?.start();
        board.heartbeats.insert(worker, Instant::now());
        drop(board);
        self.bump();
        Ok(())
    }

    /// Close a task run as successful.
    ///
    /// The gate requirements are re-checked against the store first.
    ///
    /// # Errors
    ///
    /// `QualityGateFailure` if the stored gate results do not allow
    /// completion; the run stays open and owned.
    pub async fn complete(&self, task_run_id: TaskRunId, worker: WorkerId) -> Result<()> {
        let mut board = self.board.lock().await;
        let task_id = Self::owned_run(&board, task_run_id, worker)?.task_id.clone();

        self.requirements
            .verify(self.store.as_ref(), task_run_id)
            .await?;
        self.store
            .on_task_run_complete(task_run_id, EXIT_SUCCESS)
            .await?;

        board.task_mut(&task_id)?.complete();
        board.runs.remove(&task_run_id);
        board.refresh_ready();
        drop(board);

        info!(task = %task_id, run = %task_run_id.short(), "task completed");
        self.bump();
        self.emit(RunEvent::TaskCompleted {
            task_id,
            task_run_id,
        });
        Ok(())
    }

    /// Close a task run as failed and drop ownership.
    ///
    /// Returns whether the task went back to the pool; `false` means it hit
    /// the attempt cap and is now failed.
    pub async fn fail(&self, task_run_id: TaskRunId, reason: &str) -> Result<bool> {
        let mut board = self.board.lock().await;
        let requeued = self.fail_locked(&mut board, task_run_id, reason).await?;
        drop(board);
        self.bump();
        Ok(requeued)
    }

    async fn fail_locked(
        &self,
        board: &mut Board,
        task_run_id: TaskRunId,
        reason: &str,
    ) -> Result<bool> {
        let task_id = board
            .runs
            .get(&task_run_id)
            .ok_or(Error::TaskRunNotFound(task_run_id))?
            .task_id
            .clone();

        self.store
            .on_task_run_complete(task_run_id, EXIT_FAILED)
            .await?;

        board.runs.remove(&task_run_id);
        let requeued = board
            .task_mut(&task_id)?
            .fail_attempt(self.max_task_attempts);
        board.refresh_ready();

        if requeued {
            warn!(task = %task_id, run = %task_run_id.short(), reason, "task attempt failed");
        } else {
            warn!(task = %task_id, run = %task_run_id.short(), reason, "task failed permanently");
        }
        self.emit(RunEvent::TaskFailed {
            task_id,
            task_run_id,
            reason: reason.to_string(),
            requeued,
        });
        Ok(requeued)
    }

    /// Give a claimed task back without counting a failed attempt.
    pub async fn release(&self, task_id: &TaskId, worker: WorkerId) -> Result<()> {
        let mut board = self.board.lock().await;
        let task_run_id = board
            .runs
            .iter()
            .find(|(_, run)| &run.task_id == task_id && run.owner == worker)
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::NotOwner {
                task_id: task_id.clone(),
                worker_id: worker,
            })?;

        self.store
            .on_task_run_complete(task_run_id, EXIT_RELEASED)
            .await?;

        board.runs.remove(&task_run_id);
        board.task_mut(task_id)?.release();
        board.refresh_ready();
        drop(board);

        info!(task = %task_id, worker = %worker.short(), "task released");
        self.bump();
        self.emit(RunEvent::TaskReleased {
            task_id: task_id.clone(),
            task_run_id,
        });
        Ok(())
    }

    /// Record that a worker is alive.
    pub async fn heartbeat(&self, worker: WorkerId) {
        self.board
            .lock()
            .await
            .heartbeats
            .insert(worker, Instant::now());
    }

    /// Stop tracking a worker that exited.
    pub async fn forget_worker(&self, worker: WorkerId) {
        self.board.lock().await.heartbeats.remove(&worker);
    }

    /// Fail every open run owned by `worker`, e.g. after it crashed.
    pub async fn fail_worker(&self, worker: WorkerId, reason: &str) -> Result<Vec<TaskRunId>> {
        let mut board = self.board.lock().await;
        let owned: Vec<TaskRunId> = board
            .runs
            .iter()
            .filter(|(_, run)| run.owner == worker)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            self.fail_locked(&mut board, *id, reason).await?;
        }
        board.heartbeats.remove(&worker);
        drop(board);
        if !owned.is_empty() {
            self.bump();
        }
        Ok(owned)
    }

    /// Fail every open run whose owner has been silent longer than `timeout`.
    pub async fn reap(&self, timeout: Duration) -> Result<Vec<ReapedRun>> {
        let mut board = self.board.lock().await;
        let now = Instant::now();
        let stale: Vec<(TaskRunId, ActiveRun, Duration)> = board
            .runs
            .iter()
            .filter_map(|(id, run)| {
                let silent_for = board
                    .heartbeats
                    .get(&run.owner)
                    .map_or(timeout, |seen| now.saturating_duration_since(*seen));
                (silent_for >= timeout).then(|| (*id, run.clone(), silent_for))
            })
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for (task_run_id, run, silent_for) in stale {
            let reason = format!("worker {} silent for {:?}", run.owner.short(), silent_for);
            let requeued = self.fail_locked(&mut board, task_run_id, &reason).await?;
            board.heartbeats.remove(&run.owner);
            reaped.push(ReapedRun {
                task_run_id,
                task_id: run.task_id,
                worker_id: run.owner,
                silent_for,
                requeued,
            });
        }
        drop(board);
        if !reaped.is_empty() {
            self.bump();
        }
        Ok(reaped)
    }

    pub async fn snapshot(&self) -> BoardSnapshot {
        let board = self.board.lock().await;
        BoardSnapshot {
            version: *self.version.borrow(),
            tasks: board.tasks.clone(),
        }
    }

    /// Open task runs and their owners.
    pub async fn active_runs(&self) -> Vec<(TaskRunId, TaskId, WorkerId)> {
        self.board
            .lock()
            .await
            .runs
            .iter()
            .map(|(id, run)| (*id, run.task_id.clone(), run.owner))
            .collect()
    }
}
