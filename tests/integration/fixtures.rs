//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted executors, checks, and reviewers standing in for commands
//! - Predefined task sets
//! - A harness wiring them into a `PhaseRunner` over an in-memory store

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use phaser::core::{TaskId, TaskSpec, WorkerId};
use phaser::orchestration::{
    ExecutionContext, ExecutionReport, HealthConfig, PhaseRunner, RunSettings, TaskExecutor,
};
use phaser::quality::{CheckContext, CheckResult, GatePolicy, QualityCheck, ReviewOutcome, Reviewer};
use phaser::store::{GateType, MemoryStore, RunStore};
use phaser::Result;

// ========== Executor ==========

/// One call to `ScriptedExecutor::execute`.
#[derive(Debug, Clone)]
pub struct Execution {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub gate_errors: Vec<String>,
}

/// Executor whose behaviour per task is scripted up front.
#[derive(Default)]
pub struct ScriptedExecutor {
    delay: Duration,
    always_fail: HashSet<TaskId>,
    panic_once: Mutex<HashSet<TaskId>>,
    stall_once: Mutex<HashMap<TaskId, Duration>>,
    break_store: Mutex<Option<(TaskId, Arc<MemoryStore>)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    log: Mutex<Vec<Execution>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report failure every time `task` runs.
    pub fn failing(mut self, task: &str) -> Self {
        self.always_fail.insert(TaskId::from(task));
        self
    }

    /// Panic the first time `task` runs.
    pub fn panicking_once(self, task: &str) -> Self {
        self.panic_once
            .lock()
            .unwrap()
            .insert(TaskId::from(task));
        self
    }

    /// Block the executing thread the first time `task` runs, so its
    /// worker cannot heartbeat until `stall` has passed.
    pub fn stalling_once(self, task: &str, stall: Duration) -> Self {
        self.stall_once
            .lock()
            .unwrap()
            .insert(TaskId::from(task), stall);
        self
    }

    /// Make `store` unavailable when `task` starts executing.
    pub fn breaking_store_on(self, task: &str, store: Arc<MemoryStore>) -> Self {
        *self.break_store.lock().unwrap() = Some((TaskId::from(task), store));
        self
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.log.lock().unwrap().clone()
    }

    /// Task ids in the order execution started.
    pub fn order(&self) -> Vec<String> {
        self.executions()
            .into_iter()
            .map(|e| e.task_id.to_string())
            .collect()
    }

    pub fn executions_of(&self, task: &str) -> Vec<Execution> {
        self.executions()
            .into_iter()
            .filter(|e| e.task_id.as_str() == task)
            .collect()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionReport> {
        self.log.lock().unwrap().push(Execution {
            task_id: ctx.task_id.clone(),
            worker_id: ctx.worker_id,
            attempt: ctx.attempt,
            gate_errors: ctx.gate_errors.clone(),
        });

        let should_panic = self.panic_once.lock().unwrap().remove(&ctx.task_id);
        if should_panic {
            panic!("scripted panic in {}", ctx.task_id);
        }

        let stall = self.stall_once.lock().unwrap().remove(&ctx.task_id);
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }

        let broken = {
            let guard = self.break_store.lock().unwrap();
            match guard.as_ref() {
                Some((task, store)) if *task == ctx.task_id => Some(store.clone()),
                _ => None,
            }
        };
        if let Some(store) = broken {
            store.set_unavailable(true);
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail.contains(&ctx.task_id) {
            Ok(ExecutionReport::failure(format!("{} exploded", ctx.task_id)))
        } else {
            Ok(ExecutionReport::success(format!("{} done", ctx.task_id)))
        }
    }
}

// ========== Checks ==========

/// Check that fails for scripted `(task, attempt)` pairs.
pub struct ScriptedCheck {
    gate_type: GateType,
    name: String,
    required: bool,
    failures: Mutex<HashMap<(TaskId, u32), String>>,
    always_fail: Mutex<HashSet<TaskId>>,
    calls: AtomicUsize,
}

impl ScriptedCheck {
    pub fn new(gate_type: GateType, required: bool) -> Self {
        Self {
            gate_type,
            name: format!("scripted-{}", gate_type),
            required,
            failures: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_on(&self, task: &str, attempt: u32, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((TaskId::from(task), attempt), error.to_string());
    }

    pub fn fail_always(&self, task: &str) {
        self.always_fail.lock().unwrap().insert(TaskId::from(task));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityCheck for ScriptedCheck {
    fn gate_type(&self) -> GateType {
        self.gate_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn run(&self, ctx: &CheckContext) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.lock().unwrap().contains(&ctx.task_id) {
            return CheckResult::failed(vec![format!("{} never passes", ctx.task_id)]);
        }
        let key = (ctx.task_id.clone(), ctx.attempt);
        match self.failures.lock().unwrap().get(&key) {
            Some(error) => CheckResult::failed(vec![error.clone()]),
            None => CheckResult::passed(),
        }
    }
}

// ========== Reviewer ==========

/// Reviewer that asks for follow-up on scripted `(task, attempt)` pairs.
#[derive(Default)]
pub struct ScriptedReviewer {
    followups: Mutex<HashSet<(TaskId, u32)>>,
}

impl ScriptedReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn followup_on(&self, task: &str, attempt: u32) {
        self.followups
            .lock()
            .unwrap()
            .insert((TaskId::from(task), attempt));
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    fn name(&self) -> &str {
        "scripted-reviewer"
    }

    async fn review(&self, ctx: &CheckContext, _warnings: &[String]) -> ReviewOutcome {
        let key = (ctx.task_id.clone(), ctx.attempt);
        if self.followups.lock().unwrap().contains(&key) {
            ReviewOutcome::needs_followup(format!("{} needs another pass", ctx.task_id))
        } else {
            ReviewOutcome::approved("lgtm")
        }
    }
}

// ========== Task sets ==========

/// A, then B and C, then D.
pub fn diamond() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("A", "schema").with_estimate(10),
        TaskSpec::new("B", "api").depends_on(&["A"]).with_estimate(20),
        TaskSpec::new("C", "ui").depends_on(&["A"]).with_estimate(15),
        TaskSpec::new("D", "docs").depends_on(&["B", "C"]).with_estimate(5),
    ]
}

/// T0 <- T1 <- ... <- T(n-1)
pub fn chain(n: usize) -> Vec<TaskSpec> {
    (0..n)
        .map(|i| {
            let id = format!("T{}", i);
            let spec = TaskSpec::new(&id, &format!("step {}", i));
            if i == 0 {
                spec
            } else {
                spec.depends_on(&[format!("T{}", i - 1).as_str()])
            }
        })
        .collect()
}

pub fn independent(n: usize) -> Vec<TaskSpec> {
    (0..n)
        .map(|i| TaskSpec::new(&format!("I{}", i), &format!("independent {}", i)))
        .collect()
}

// ========== Harness ==========

/// Settings tuned for fast tests.
pub fn fast_settings(workers: usize) -> RunSettings {
    RunSettings {
        max_workers: workers,
        assigned_agent: "test-agent".to_string(),
        max_task_attempts: Some(3),
        heartbeat_interval: Duration::from_millis(10),
        health: HealthConfig {
            worker_timeout: Duration::from_secs(30),
            check_interval: Duration::from_millis(20),
        },
        gate: GatePolicy::default(),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub lint: Arc<ScriptedCheck>,
    pub build: Arc<ScriptedCheck>,
    pub test: Arc<ScriptedCheck>,
    pub reviewer: Option<Arc<ScriptedReviewer>>,
    pub settings: RunSettings,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            lint: Arc::new(ScriptedCheck::new(GateType::Lint, true)),
            build: Arc::new(ScriptedCheck::new(GateType::Build, true)),
            test: Arc::new(ScriptedCheck::new(GateType::Test, false)),
            reviewer: None,
            settings: fast_settings(workers),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<ScriptedReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn checks(&self) -> Vec<Arc<dyn QualityCheck>> {
        vec![
            self.lint.clone() as Arc<dyn QualityCheck>,
            self.build.clone() as Arc<dyn QualityCheck>,
            self.test.clone() as Arc<dyn QualityCheck>,
        ]
    }

    pub fn runner(&self, executor: Arc<ScriptedExecutor>) -> PhaseRunner {
        runner_over(self.store.clone(), executor, self)
    }
}

/// Runner over any store, with the harness's checks and settings.
pub fn runner_over(
    store: Arc<dyn RunStore>,
    executor: Arc<ScriptedExecutor>,
    harness: &Harness,
) -> PhaseRunner {
    let mut runner = PhaseRunner::new(store, executor)
        .with_checks(harness.checks())
        .with_settings(harness.settings.clone());
    if let Some(reviewer) = &harness.reviewer {
        runner = runner.with_reviewer(reviewer.clone());
    }
    runner
}
