//! Wave Scheduler.
//!
//! Computes the ready set on demand from a board snapshot. Nothing is
//! precomputed: the dispatcher bumps its version after every transition and
//! whoever is waiting calls `next_step` again, so a worker that goes idle
//! picks up newly unblocked work without waiting for the rest of its wave.

use crate::core::{TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::dispatcher::BoardSnapshot;
use std::sync::Arc;
use tracing::debug;

/// What the run should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerStep {
    /// Claimable tasks, by wave index then declaration order.
    Ready(Vec<TaskId>),
    /// Nothing claimable, but owned tasks may still unblock work.
    Waiting { active: Vec<TaskId> },
    /// Every task is completed.
    Complete,
    /// No work is possible because these tasks exhausted their attempts.
    Stalled { failed: Vec<TaskId> },
}

#[derive(Debug, Clone)]
pub struct WaveScheduler {
    graph: Arc<TaskGraph>,
}

impl WaveScheduler {
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Tasks that are unowned, not terminal, and whose dependencies are all completed.
    pub fn ready_set(&self, snapshot: &BoardSnapshot) -> Vec<TaskId> {
        let mut ready: Vec<(usize, TaskId)> = self
            .graph
            .tasks()
            .filter(|task| {
                snapshot.status(&task.id).is_some_and(|s| s.is_claimable())
                    && task
                        .depends_on
                        .iter()
                        .all(|dep| snapshot.status(dep) == Some(TaskStatus::Completed))
            })
            .map(|task| (task.wave_index, task.id.clone()))
            .collect();
        // Stable: ties keep declaration order.
        ready.sort_by_key(|(wave, _)| *wave);
        ready.into_iter().map(|(_, id)| id).collect()
    }

    /// Decide the next step for the current board.
    ///
    /// # Errors
    ///
    /// `Deadlock` when incomplete tasks remain but nothing is ready, owned,
    /// or failed. That cannot happen on a validated graph with correct
    /// transitions, so it is fatal.
    pub fn next_step(&self, snapshot: &BoardSnapshot) -> Result<SchedulerStep> {
        let ids = self.graph.task_ids();
        if ids
            .iter()
            .all(|id| snapshot.status(id) == Some(TaskStatus::Completed))
        {
            return Ok(SchedulerStep::Complete);
        }

        let ready = self.ready_set(snapshot);
        if !ready.is_empty() {
            debug!(version = snapshot.version, ready = ready.len(), "ready set recomputed");
            return Ok(SchedulerStep::Ready(ready));
        }

        let with_status = |wanted: fn(TaskStatus) -> bool| -> Vec<TaskId> {
            ids.iter()
                .filter(|id| snapshot.status(id).is_some_and(wanted))
                .cloned()
                .collect()
        };

        let active = with_status(|s| s.is_owned());
        if !active.is_empty() {
            return Ok(SchedulerStep::Waiting { active });
        }

        let failed = with_status(|s| s == TaskStatus::Failed);
        if !failed.is_empty() {
            return Ok(SchedulerStep::Stalled { failed });
        }

        let blocked = with_status(|s| s != TaskStatus::Completed);
        Err(Error::Deadlock { blocked })
    }
}
