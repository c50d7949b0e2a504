//! Phase runner: the top-level run and resume loop.
//!
//! The runner owns one phase run at a time. It builds the graph, finds or
//! creates the phase run, seeds the dispatcher with whatever the store says
//! is already done, and then watches three things until the scheduler says
//! the run is over: board changes, worker lifecycle events, and health
//! ticks. Whatever the ending, workers are shut down and the phase run is
//! closed with an exit code.

use crate::core::{TaskGraph, TaskId, TaskSpec};
use crate::error::{Error, Result, EXIT_INCOMPLETE, EXIT_OK};
use crate::metrics::RunReport;
use crate::orchestration::dispatcher::{Dispatcher, RunEvent};
use crate::orchestration::health::{HealthConfig, HealthEvent, HealthMonitor};
use crate::orchestration::mailbox::Mailbox;
use crate::orchestration::pool::{WorkerEvent, WorkerPool};
use crate::orchestration::scheduler::{SchedulerStep, WaveScheduler};
use crate::orchestration::worker::{TaskExecutor, WorkerContext};
use crate::quality::{GatePolicy, QualityCheck, QualityGate, Reviewer};
use crate::store::{PhaseRun, PhaseRunId, PhaseRunStatus, RunStore, EXIT_ABANDONED};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Knobs for one runner.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_workers: usize,
    /// Recorded on the phase run.
    pub assigned_agent: String,
    /// Worker failures per task before it is marked failed.
    pub max_task_attempts: Option<u32>,
    pub heartbeat_interval: Duration,
    pub health: HealthConfig,
    pub gate: GatePolicy,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            assigned_agent: "phaser".to_string(),
            max_task_attempts: Some(3),
            heartbeat_interval: Duration::from_secs(1),
            health: HealthConfig::default(),
            gate: GatePolicy::default(),
        }
    }
}

enum Finish {
    Completed,
    Stalled(Vec<TaskId>),
}

pub struct PhaseRunner {
    store: Arc<dyn RunStore>,
    executor: Arc<dyn TaskExecutor>,
    checks: Vec<Arc<dyn QualityCheck>>,
    reviewer: Option<Arc<dyn Reviewer>>,
    settings: RunSettings,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl PhaseRunner {
    pub fn new(store: Arc<dyn RunStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            store,
            executor,
            checks: Vec::new(),
            reviewer: None,
            settings: RunSettings::default(),
            events: None,
        }
    }

    pub fn with_checks(mut self, checks: Vec<Arc<dyn QualityCheck>>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run a task list, resuming the latest phase run with the same phase,
    /// project, and task list if there is one.
    ///
    /// # Errors
    ///
    /// `Graph` before anything is written; `Deadlock` and store errors
    /// after the phase run has been closed as failed (when the store allows).
    pub async fn run(
        &self,
        phase_name: &str,
        project_name: &str,
        tasks: &[TaskSpec],
    ) -> Result<RunReport> {
        let graph = TaskGraph::build(tasks)?;
        info!(
            phase = phase_name,
            project = project_name,
            tasks = graph.task_count(),
            waves = graph.waves().len(),
            "task graph validated"
        );

        if let Some(existing) = self
            .store
            .find_phase_run(phase_name, project_name, tasks)
            .await?
        {
            info!(phase_run = %existing.id.short(), "found matching phase run");
            return self.continue_run(existing, graph).await;
        }

        let id = self
            .store
            .on_phase_run_start(phase_name, project_name, &self.settings.assigned_agent, tasks)
            .await?;
        let phase_run = self.load_phase_run(id).await?;
        info!(phase_run = %id.short(), "phase run started");
        self.execute(&phase_run, Arc::new(graph), HashSet::new())
            .await
    }

    /// Continue a phase run by id, rebuilding its graph from the stored task list.
    ///
    /// Resuming a completed run is a no-op that reports the stored outcome.
    pub async fn resume(&self, phase_run_id: PhaseRunId) -> Result<RunReport> {
        let phase_run = self.load_phase_run(phase_run_id).await?;
        let graph = TaskGraph::build(&phase_run.tasks)?;
        self.continue_run(phase_run, graph).await
    }

    async fn load_phase_run(&self, id: PhaseRunId) -> Result<PhaseRun> {
        self.store
            .phase_run(id)
            .await?
            .ok_or_else(|| Error::PhaseRunNotFound(id.to_string()))
    }

    async fn continue_run(&self, phase_run: PhaseRun, graph: TaskGraph) -> Result<RunReport> {
        if phase_run.status == PhaseRunStatus::Completed {
            info!(phase_run = %phase_run.id.short(), "phase run already completed, nothing to do");
            let report = RunReport::collect(self.store.as_ref(), &phase_run, &graph).await?;
            return Ok(report.as_noop());
        }

        let runs = self.store.task_runs(phase_run.id).await?;
        let completed: HashSet<TaskId> = runs
            .iter()
            .filter(|r| r.is_successful())
            .map(|r| r.task_id.clone())
            .collect();

        for open in runs.iter().filter(|r| r.is_open()) {
            warn!(task = %open.task_id, run = %open.id.short(), "closing abandoned task run");
            self.store
                .on_task_run_complete(open.id, EXIT_ABANDONED)
                .await?;
        }
        if phase_run.status != PhaseRunStatus::InProgress {
            self.store.reopen_phase_run(phase_run.id).await?;
        }

        info!(
            phase_run = %phase_run.id.short(),
            completed = completed.len(),
            total = graph.task_count(),
            "resuming phase run"
        );
        self.execute(&phase_run, Arc::new(graph), completed).await
    }

    async fn execute(
        &self,
        phase_run: &PhaseRun,
        graph: Arc<TaskGraph>,
        completed: HashSet<TaskId>,
    ) -> Result<RunReport> {
        let gate = Arc::new(QualityGate::new(
            self.store.clone(),
            self.checks.clone(),
            self.reviewer.clone(),
            self.settings.gate.clone(),
        ));
        let mut dispatcher = Dispatcher::new(
            phase_run.id,
            &graph,
            self.store.clone(),
            gate.requirements(),
        )
        .with_max_attempts(self.settings.max_task_attempts)
        .with_completed(&completed);
        if let Some(events) = &self.events {
            dispatcher = dispatcher.with_events(events.clone());
        }
        let dispatcher = Arc::new(dispatcher);
        let scheduler = WaveScheduler::new(graph.clone());

        let context = WorkerContext {
            dispatcher: dispatcher.clone(),
            scheduler: scheduler.clone(),
            gate,
            executor: self.executor.clone(),
            mailbox: Arc::new(Mailbox::new()),
            heartbeat_interval: self.settings.heartbeat_interval,
            cancel: CancellationToken::new(),
        };
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(self.settings.max_workers, context, worker_tx);
        let health = HealthMonitor::new(self.settings.health.clone(), dispatcher.clone());

        let finish = self
            .drive(&dispatcher, &scheduler, &mut pool, &mut worker_rx, &health)
            .await;
        pool.shutdown().await;

        match finish {
            Ok(finish) => {
                let (exit_code, failed) = match finish {
                    Finish::Completed => (EXIT_OK, Vec::new()),
                    Finish::Stalled(failed) => (EXIT_INCOMPLETE, failed),
                };
                let current = self.load_phase_run(phase_run.id).await?;
                let report = RunReport::collect(self.store.as_ref(), &current, &graph)
                    .await?
                    .with_outcome(exit_code, failed);
                self.store
                    .on_phase_run_complete(phase_run.id, exit_code, &report.headline())
                    .await?;
                info!(
                    phase_run = %phase_run.id.short(),
                    exit_code,
                    replacements = pool.replacements(),
                    summary = %report.headline(),
                    "phase run finished"
                );
                Ok(report)
            }
            Err(err) => {
                let open_runs = dispatcher.active_runs().await;
                error!(
                    phase_run = %phase_run.id.short(),
                    error = %err,
                    open_runs = open_runs.len(),
                    "phase run halted"
                );
                for (task_run_id, task_id, worker_id) in open_runs {
                    warn!(
                        run = %task_run_id.short(),
                        task = %task_id,
                        worker = %worker_id.short(),
                        "task run left open"
                    );
                }
                if let Err(close_err) = self
                    .store
                    .on_phase_run_complete(phase_run.id, err.exit_code(), &err.to_string())
                    .await
                {
                    warn!(error = %close_err, "could not record halted phase run");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        dispatcher: &Arc<Dispatcher>,
        scheduler: &WaveScheduler,
        pool: &mut WorkerPool,
        worker_rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        health: &HealthMonitor,
    ) -> Result<Finish> {
        let wanted = self.settings.max_workers.min(scheduler.graph().task_count());
        pool.spawn_many(wanted).await?;

        let mut version = dispatcher.subscribe();
        let mut health_tick = tokio::time::interval(health.config().check_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            version.borrow_and_update();
            let snapshot = dispatcher.snapshot().await;
            match scheduler.next_step(&snapshot)? {
                SchedulerStep::Complete => return Ok(Finish::Completed),
                SchedulerStep::Stalled { failed } => return Ok(Finish::Stalled(failed)),
                SchedulerStep::Ready(_) | SchedulerStep::Waiting { .. } => {}
            }

            tokio::select! {
                _ = version.changed() => {}
                Some(event) = worker_rx.recv() => {
                    Self::on_worker_event(event, dispatcher, pool).await?;
                }
                _ = health_tick.tick() => {
                    for event in health.check_all().await? {
                        if let HealthEvent::RecoveryTriggered { worker_id, .. } = event {
                            if pool.contains(&worker_id) {
                                pool.terminate(worker_id).await?;
                                let replacement = pool.spawn().await?;
                                info!(
                                    dead = %worker_id.short(),
                                    replacement = %replacement.short(),
                                    active = pool.active_count(),
                                    "silent worker replaced"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    async fn on_worker_event(
        event: WorkerEvent,
        dispatcher: &Dispatcher,
        pool: &mut WorkerPool,
    ) -> Result<()> {
        match event {
            WorkerEvent::Started { worker_id } => {
                debug!(worker = %worker_id.short(), "worker running");
            }
            WorkerEvent::Exited { worker_id, summary } => {
                debug!(
                    worker = %worker_id.short(),
                    completed = summary.completed,
                    failed = summary.failed,
                    released = summary.released,
                    "worker exited"
                );
                pool.remove(worker_id).await;
            }
            WorkerEvent::Crashed { worker_id, reason } => {
                error!(worker = %worker_id.short(), reason = %reason, "worker crashed");
                dispatcher
                    .fail_worker(worker_id, &format!("worker crashed: {}", reason))
                    .await?;
                if pool.contains(&worker_id) {
                    pool.replace(worker_id).await?;
                }
            }
            // A terminated worker can still report on its way out; its task
            // has already been failed and handed on.
            WorkerEvent::Failed { worker_id, error } if !pool.contains(&worker_id) => {
                debug!(worker = %worker_id.short(), error = %error, "terminated worker failed");
            }
            WorkerEvent::Failed { worker_id, error } => {
                pool.remove(worker_id).await;
                return Err(error);
            }
        }
        Ok(())
    }
}
