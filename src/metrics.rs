//! Run metrics and reporting.
//!
//! Everything here is derived from store records after the fact, so a
//! report for a resumed or already-finished run is computed the same way
//! as one for a run that just ended.

use crate::core::{TaskGraph, TaskId};
use crate::error::{Result, EXIT_INCOMPLETE};
use crate::store::{
    GateStatus, PhaseRun, PhaseRunId, PhaseRunStatus, RunStore, EXIT_FAILED, EXIT_SUCCESS,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: TaskId,
    pub wave_index: usize,
    /// `completed_at - claimed_at` of the successful task run.
    pub duration_secs: Option<f64>,
    pub estimate_minutes: Option<u64>,
    /// Task runs opened for this task, successful or not.
    pub runs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveMetrics {
    pub wave_index: usize,
    pub tasks: Vec<TaskId>,
    /// Longest successful task duration in the wave.
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub phase_run_id: PhaseRunId,
    pub phase_name: String,
    pub project_name: String,
    pub status: PhaseRunStatus,
    pub exit_code: i32,
    /// Set when the invocation found the run already finished and did nothing.
    pub resumed_noop: bool,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    /// Tasks that ran out of attempts.
    pub failed_tasks: Vec<TaskId>,
    /// Task runs closed as failed attempts.
    pub failed_attempts: usize,
    pub gate_invocations: usize,
    pub gate_first_try_passes: usize,
    pub gate_pass_rate: Option<f64>,
    pub wall_clock_secs: f64,
    pub total_task_secs: f64,
    pub speedup: Option<f64>,
    pub estimated_minutes: u64,
    pub critical_path_minutes: u64,
    pub actual_minutes: f64,
    pub tasks: Vec<TaskMetrics>,
    pub waves: Vec<WaveMetrics>,
}

impl RunReport {
    /// Build a report from the store's records of `phase_run`.
    ///
    /// Status and exit code come from the phase run record; a run that
    /// has not been closed yet reports as failed with `EXIT_INCOMPLETE`
    /// until `with_outcome` says otherwise.
    pub async fn collect(
        store: &dyn RunStore,
        phase_run: &PhaseRun,
        graph: &TaskGraph,
    ) -> Result<Self> {
        let runs = store.task_runs(phase_run.id).await?;
        let gates = store.phase_gate_results(phase_run.id).await?;

        let mut tasks = Vec::with_capacity(graph.task_count());
        for task in graph.tasks() {
            let task_runs: Vec<_> = runs.iter().filter(|r| r.task_id == task.id).collect();
            let duration_secs = task_runs
                .iter()
                .find(|r| r.is_successful())
                .and_then(|r| r.duration())
                .map(|d| d.num_milliseconds() as f64 / 1000.0);
            tasks.push(TaskMetrics {
                task_id: task.id.clone(),
                wave_index: task.wave_index,
                duration_secs,
                estimate_minutes: task.estimated_duration.map(|d| d.as_secs() / 60),
                runs: task_runs.len(),
            });
        }

        let waves = graph
            .waves()
            .into_iter()
            .enumerate()
            .map(|(wave_index, ids)| {
                let duration_secs = tasks
                    .iter()
                    .filter(|t| t.wave_index == wave_index)
                    .filter_map(|t| t.duration_secs)
                    .fold(0.0, f64::max);
                WaveMetrics {
                    wave_index,
                    tasks: ids,
                    duration_secs,
                }
            })
            .collect();

        let total_task_secs: f64 = tasks.iter().filter_map(|t| t.duration_secs).sum();
        let end = phase_run.completed_at.unwrap_or_else(Utc::now);
        let wall_clock_secs = ((end - phase_run.started_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        let speedup = (wall_clock_secs > 0.0 && total_task_secs > 0.0)
            .then(|| total_task_secs / wall_clock_secs);

        let gate_first_try_passes = gates
            .iter()
            .filter(|g| g.attempt == 1 && g.status == GateStatus::Passed)
            .count();
        let gate_pass_rate = (!gates.is_empty())
            .then(|| gate_first_try_passes as f64 / gates.len() as f64);

        let exit_code = phase_run.exit_code.unwrap_or(EXIT_INCOMPLETE);
        Ok(Self {
            phase_run_id: phase_run.id,
            phase_name: phase_run.phase_name.clone(),
            project_name: phase_run.project_name.clone(),
            status: status_for(exit_code),
            exit_code,
            resumed_noop: false,
            tasks_total: graph.task_count(),
            tasks_completed: tasks.iter().filter(|t| t.duration_secs.is_some()).count(),
            failed_tasks: Vec::new(),
            failed_attempts: runs
                .iter()
                .filter(|r| r.exit_code == Some(EXIT_FAILED))
                .count(),
            gate_invocations: gates.len(),
            gate_first_try_passes,
            gate_pass_rate,
            wall_clock_secs,
            total_task_secs,
            speedup,
            estimated_minutes: tasks.iter().filter_map(|t| t.estimate_minutes).sum(),
            critical_path_minutes: graph.critical_path_minutes(),
            actual_minutes: total_task_secs / 60.0,
            tasks,
            waves,
        })
    }

    /// Fix the final exit code and the tasks that ran out of attempts.
    pub fn with_outcome(mut self, exit_code: i32, failed_tasks: Vec<TaskId>) -> Self {
        self.exit_code = exit_code;
        self.status = status_for(exit_code);
        self.failed_tasks = failed_tasks;
        self
    }

    pub fn as_noop(mut self) -> Self {
        self.resumed_noop = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }

    /// One line suitable for the phase run summary.
    pub fn headline(&self) -> String {
        let mut line = format!(
            "{}/{} tasks completed",
            self.tasks_completed, self.tasks_total
        );
        if !self.failed_tasks.is_empty() {
            let ids: Vec<&str> = self.failed_tasks.iter().map(|t| t.as_str()).collect();
            line.push_str(&format!("; failed: {}", ids.join(", ")));
        }
        if let Some(speedup) = self.speedup {
            line.push_str(&format!("; speedup {:.2}x", speedup));
        }
        line
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn status_for(exit_code: i32) -> PhaseRunStatus {
    if exit_code == EXIT_SUCCESS {
        PhaseRunStatus::Completed
    } else {
        PhaseRunStatus::Failed
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Phase run {} ({} / {}): {}{}",
            self.phase_run_id.short(),
            self.phase_name,
            self.project_name,
            self.status,
            if self.resumed_noop { " (already finished)" } else { "" }
        )?;
        writeln!(
            f,
            "  tasks: {}/{} completed, {} failed, {} failed attempts",
            self.tasks_completed,
            self.tasks_total,
            self.failed_tasks.len(),
            self.failed_attempts
        )?;
        for wave in &self.waves {
            let ids: Vec<&str> = wave.tasks.iter().map(|t| t.as_str()).collect();
            writeln!(
                f,
                "  wave {}: {} ({:.1}s)",
                wave.wave_index,
                ids.join(", "),
                wave.duration_secs
            )?;
        }
        match self.speedup {
            Some(speedup) => writeln!(
                f,
                "  wall clock {:.1}s, task time {:.1}s, speedup {:.2}x",
                self.wall_clock_secs, self.total_task_secs, speedup
            )?,
            None => writeln!(f, "  wall clock {:.1}s", self.wall_clock_secs)?,
        }
        if let Some(rate) = self.gate_pass_rate {
            writeln!(
                f,
                "  quality gate: {}/{} passed first try ({:.1}%)",
                self.gate_first_try_passes,
                self.gate_invocations,
                rate * 100.0
            )?;
        }
        write!(
            f,
            "  estimate {} min (critical path {} min), actual {:.1} min",
            self.estimated_minutes, self.critical_path_minutes, self.actual_minutes
        )
    }
}
