//! Workers: claim, execute, report.
//!
//! A worker loops over the ready set. It claims the first task it can win,
//! runs the executor, and puts the result through the quality gate. Gate
//! failures are retried in place on the same task run, with the failures
//! handed back to the executor, until the gate passes or the retry cap is
//! hit. Shutdown is honored only between tasks. A worker holding a task
//! either finishes it or releases it first.

use crate::core::{Task, TaskId, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::dispatcher::{Dispatcher, RunEvent};
use crate::orchestration::mailbox::{Mailbox, PeerMessage};
use crate::orchestration::scheduler::{SchedulerStep, WaveScheduler};
use crate::quality::{CheckContext, GateOutcome, QualityGate, ShellCommand};
use crate::store::{PhaseRunId, TaskRun, TaskRunId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything an executor gets to know about the work it is asked to do.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub phase_run_id: PhaseRunId,
    pub task_run_id: TaskRunId,
    pub task_id: TaskId,
    pub subject: String,
    pub agent_hint: Option<String>,
    pub worker_id: WorkerId,
    /// 1-based; greater than 1 when retrying after a blocked gate.
    pub attempt: u32,
    /// Failures from the previous gate evaluation.
    pub gate_errors: Vec<String>,
    /// Peer messages received since the last execution.
    pub messages: Vec<PeerMessage>,
    pub mailbox: Arc<Mailbox>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub success: bool,
    pub summary: String,
}

impl ExecutionReport {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
        }
    }
}

/// Produces the work for one task. What the work is does not matter to
/// the orchestrator.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// An `Err` or an unsuccessful report is an explicit abort and fails the attempt.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionReport>;
}

/// Runs a shell command per task.
pub struct CommandExecutor {
    command: ShellCommand,
}

impl CommandExecutor {
    pub fn new(command: ShellCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionReport> {
        let env = [
            ("PHASER_TASK_ID", ctx.task_id.to_string()),
            ("PHASER_TASK_SUBJECT", ctx.subject.clone()),
            ("PHASER_AGENT_HINT", ctx.agent_hint.clone().unwrap_or_default()),
            ("PHASER_ATTEMPT", ctx.attempt.to_string()),
            ("PHASER_GATE_ERRORS", ctx.gate_errors.join("\n")),
            ("PHASER_WORKER_ID", ctx.worker_id.to_string()),
        ];
        let output = self.command.run(&env).await?;
        let last_line = output
            .stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .to_string();
        if output.success {
            Ok(ExecutionReport::success(last_line))
        } else {
            Ok(ExecutionReport::failure(output.error_items().join("; ")))
        }
    }
}

/// Counters reported when a worker exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
    pub released: usize,
}

pub struct Worker {
    id: WorkerId,
    dispatcher: Arc<Dispatcher>,
    scheduler: WaveScheduler,
    gate: Arc<QualityGate>,
    executor: Arc<dyn TaskExecutor>,
    mailbox: Arc<Mailbox>,
    inbox: mpsc::UnboundedReceiver<PeerMessage>,
    pending: Vec<PeerMessage>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

/// The run state a worker operates on.
#[derive(Clone)]
pub struct WorkerContext {
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: WaveScheduler,
    pub gate: Arc<QualityGate>,
    pub executor: Arc<dyn TaskExecutor>,
    pub mailbox: Arc<Mailbox>,
    pub heartbeat_interval: Duration,
    pub cancel: CancellationToken,
}

enum Attempt {
    Done,
    Retry(Vec<String>),
}

/// The task was taken away, usually reaped after missed heartbeats.
fn lost_ownership(err: &Error) -> bool {
    matches!(
        err,
        Error::TaskRunNotFound(_) | Error::TaskRunClosed(_) | Error::NotOwner { .. }
    )
}

impl Worker {
    pub fn new(
        id: WorkerId,
        context: &WorkerContext,
        inbox: mpsc::UnboundedReceiver<PeerMessage>,
    ) -> Self {
        Self {
            id,
            dispatcher: context.dispatcher.clone(),
            scheduler: context.scheduler.clone(),
            gate: context.gate.clone(),
            executor: context.executor.clone(),
            mailbox: context.mailbox.clone(),
            inbox,
            pending: Vec::new(),
            heartbeat_interval: context.heartbeat_interval,
            cancel: context.cancel.clone(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Work until the run is over or shutdown is requested while idle.
    ///
    /// # Errors
    ///
    /// Store failures and other fatal conditions. Transient claim errors
    /// and lost ownership are absorbed.
    pub async fn run(mut self) -> Result<WorkerSummary> {
        debug!(worker = %self.id.short(), "worker started");
        let result = self.run_loop().await;
        self.mailbox.unregister(self.id).await;
        self.dispatcher.forget_worker(self.id).await;
        debug!(worker = %self.id.short(), ok = result.is_ok(), "worker stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        let mut version = self.dispatcher.subscribe();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            version.borrow_and_update();
            let snapshot = self.dispatcher.snapshot().await;

            match self.scheduler.next_step(&snapshot) {
                Ok(SchedulerStep::Ready(ready)) => {
                    if let Some(run) = self.claim_first(&ready).await? {
                        self.work(run, &mut summary).await?;
                        continue;
                    }
                }
                Ok(SchedulerStep::Waiting { .. }) => {}
                Ok(SchedulerStep::Complete) | Ok(SchedulerStep::Stalled { .. }) => break,
                // The runner reports the deadlock.
                Err(Error::Deadlock { .. }) => break,
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = version.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(msg) = self.inbox.recv() => {
                    debug!(worker = %self.id.short(), from = %msg.from.short(), "peer message queued");
                    self.pending.push(msg);
                }
            }
        }
        Ok(summary)
    }

    /// Try the ready set in order. A conflict moves on to the next task.
    async fn claim_first(&self, ready: &[TaskId]) -> Result<Option<TaskRun>> {
        for task_id in ready {
            match self.dispatcher.claim(task_id, self.id).await {
                Ok(run) => return Ok(Some(run)),
                Err(err) if err.is_transient() => {
                    debug!(worker = %self.id.short(), task = %task_id, error = %err, "claim skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn work(&mut self, run: TaskRun, summary: &mut WorkerSummary) -> Result<()> {
        let task = self
            .scheduler
            .graph()
            .get_task(&run.task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(run.task_id.clone()))?;

        match self.dispatcher.start(run.id, self.id).await {
            Ok(()) => {}
            Err(err) if lost_ownership(&err) => return Ok(()),
            Err(err) => return Err(err),
        }

        let started = Instant::now();
        let mut attempt = 1;
        let mut gate_errors = Vec::new();
        loop {
            let outcome = self
                .attempt(&task, &run, attempt, gate_errors, started)
                .await;
            let failures = match outcome {
                Ok(Attempt::Done) => {
                    summary.completed += 1;
                    return Ok(());
                }
                Ok(Attempt::Retry(failures)) => failures,
                Err(Error::WorkerFailure(reason)) => {
                    summary.failed += 1;
                    return self.give_up(&run, &reason).await;
                }
                Err(err) if lost_ownership(&err) => {
                    warn!(worker = %self.id.short(), task = %task.id, "lost ownership of task");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            self.dispatcher.emit(RunEvent::GateBlocked {
                task_id: task.id.clone(),
                task_run_id: run.id,
                attempt,
                failures: failures.clone(),
            });

            if self.cancel.is_cancelled() {
                summary.released += 1;
                return match self.dispatcher.release(&task.id, self.id).await {
                    Err(err) if !lost_ownership(&err) => Err(err),
                    _ => Ok(()),
                };
            }
            if !self.gate.policy().allows_retry(attempt) {
                summary.failed += 1;
                let reason = format!("quality gate still failing after {} attempts", attempt);
                return self.give_up(&run, &reason).await;
            }
            attempt += 1;
            gate_errors = failures;
        }
    }

    /// Execute once and evaluate the gate.
    async fn attempt(
        &mut self,
        task: &Task,
        run: &TaskRun,
        attempt: u32,
        gate_errors: Vec<String>,
        started: Instant,
    ) -> Result<Attempt> {
        let mut messages = std::mem::take(&mut self.pending);
        while let Ok(msg) = self.inbox.try_recv() {
            messages.push(msg);
        }

        let exec_ctx = ExecutionContext {
            phase_run_id: run.phase_run_id,
            task_run_id: run.id,
            task_id: task.id.clone(),
            subject: task.subject.clone(),
            agent_hint: task.agent_hint.clone(),
            worker_id: self.id,
            attempt,
            gate_errors,
            messages,
            mailbox: self.mailbox.clone(),
        };
        let check_ctx = CheckContext {
            phase_run_id: run.phase_run_id,
            task_run_id: run.id,
            task_id: task.id.clone(),
            subject: task.subject.clone(),
            attempt,
        };

        info!(worker = %self.id.short(), task = %task.id, attempt, "executing task");
        let mut checkpointed = false;
        let executed = self
            .with_heartbeat(
                self.executor.execute(&exec_ctx),
                &check_ctx,
                started,
                &mut checkpointed,
            )
            .await?;
        match executed {
            Ok(report) if report.success => {}
            Ok(report) => {
                return Err(Error::WorkerFailure(format!(
                    "executor reported failure: {}",
                    report.summary
                )))
            }
            Err(err) => return Err(Error::WorkerFailure(err.to_string())),
        }

        let outcome = self
            .with_heartbeat(
                self.gate.evaluate(&check_ctx),
                &check_ctx,
                started,
                &mut checkpointed,
            )
            .await??;
        match outcome {
            GateOutcome::Passed { .. } => match self.dispatcher.complete(run.id, self.id).await {
                Ok(()) => Ok(Attempt::Done),
                Err(err @ Error::QualityGateFailure { .. }) => Ok(Attempt::Retry(vec![err.to_string()])),
                Err(err) => Err(err),
            },
            GateOutcome::Blocked { failures } => Ok(Attempt::Retry(failures)),
        }
    }

    /// Drive `fut` while sending heartbeats, writing one checkpoint once the
    /// task has been running longer than the threshold.
    async fn with_heartbeat<F: Future>(
        &self,
        fut: F,
        ctx: &CheckContext,
        started: Instant,
        checkpointed: &mut bool,
    ) -> Result<F::Output> {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = ticker.tick() => {
                    self.dispatcher.heartbeat(self.id).await;
                    let elapsed = started.elapsed();
                    if !*checkpointed && elapsed >= self.gate.policy().checkpoint_threshold {
                        let note = format!("attempt {} still running", ctx.attempt);
                        self.gate.checkpoint(ctx, elapsed, &note).await?;
                        *checkpointed = true;
                        info!(task = %ctx.task_id, elapsed_secs = elapsed.as_secs(), "checkpoint written");
                        self.dispatcher.emit(RunEvent::Checkpointed {
                            task_id: ctx.task_id.clone(),
                            task_run_id: ctx.task_run_id,
                            elapsed_secs: elapsed.as_secs(),
                        });
                    }
                }
            }
        }
    }

    async fn give_up(&self, run: &TaskRun, reason: &str) -> Result<()> {
        match self.dispatcher.fail(run.id, reason).await {
            Ok(_) => Ok(()),
            Err(err) if lost_ownership(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
