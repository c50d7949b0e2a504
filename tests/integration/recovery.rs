//! Worker failure and recovery integration tests.
//!
//! These tests verify that crashed workers are replaced without losing
//! their task, that repeated failures end the run as incomplete, and that
//! a store outage halts the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use phaser::core::TaskId;
use phaser::error::{EXIT_INCOMPLETE, EXIT_PERSISTENCE};
use phaser::orchestration::{HealthConfig, RunEvent};
use phaser::store::{RunStore, EXIT_FAILED};
use phaser::Error;

use crate::fixtures::{chain, diamond, Harness, ScriptedExecutor};

/// Test: Crashed worker is replaced
/// Given an executor that panics the first time it runs B
/// When the phase runs
/// Then B's task run is failed, B is re-claimed by another worker, and the run completes
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_worker_is_replaced() {
    let harness = Harness::new(2);
    let executor = Arc::new(ScriptedExecutor::new().panicking_once("B"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = harness
        .runner(executor.clone())
        .with_events(tx)
        .run("phase-1", "demo", &diamond())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.failed_attempts, 1);

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    let b_runs: Vec<_> = runs.iter().filter(|r| r.task_id.as_str() == "B").collect();
    assert_eq!(b_runs.len(), 2);
    assert_eq!(b_runs[0].exit_code, Some(EXIT_FAILED));
    assert!(b_runs[1].is_successful());
    assert_ne!(b_runs[0].owner, b_runs[1].owner);

    let b_execs = executor.executions_of("B");
    assert_eq!(b_execs.len(), 2);
    assert_ne!(b_execs[0].worker_id, b_execs[1].worker_id);

    let mut requeued = false;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::TaskFailed {
            task_id,
            requeued: r,
            reason,
            ..
        } = event
        {
            assert_eq!(task_id, TaskId::from("B"));
            assert!(reason.contains("scripted panic"), "reason was {}", reason);
            requeued = r;
        }
    }
    assert!(requeued);
}

/// Test: Silent worker that is still alive
/// Given a worker that blocks its thread past the worker timeout while executing A
/// When the health monitor reaps A and the stalled worker later reports its gate results
/// Then the late writes are dropped, A is re-run by another worker, and the run completes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reaped_worker_waking_up_does_not_halt_the_run() {
    let mut harness = Harness::new(2);
    harness.settings.health = HealthConfig {
        worker_timeout: Duration::from_millis(100),
        check_interval: Duration::from_millis(20),
    };
    let executor = Arc::new(
        ScriptedExecutor::new().stalling_once("A", Duration::from_millis(300)),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = harness
        .runner(executor.clone())
        .with_events(tx)
        .run("phase-1", "demo", &diamond())
        .await
        .unwrap();

    assert!(report.is_success(), "headline: {}", report.headline());
    assert_eq!(report.failed_attempts, 1);

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    let a_runs: Vec<_> = runs.iter().filter(|r| r.task_id.as_str() == "A").collect();
    assert_eq!(a_runs.len(), 2);
    assert_eq!(a_runs[0].exit_code, Some(EXIT_FAILED));
    assert!(a_runs[1].is_successful());
    assert_ne!(a_runs[0].owner, a_runs[1].owner);

    // Nothing the stalled worker sent after its run was closed was recorded.
    let late = harness.store.gate_results(a_runs[0].id).await.unwrap();
    assert!(late.is_empty(), "late gate results: {:?}", late);

    let mut reaped = false;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::TaskFailed { task_id, reason, requeued, .. } = event {
            assert_eq!(task_id, TaskId::from("A"));
            assert!(reason.contains("silent"), "reason was {}", reason);
            assert!(requeued);
            reaped = true;
        }
    }
    assert!(reaped);
}

/// Test: Executor failures exhaust attempts
/// Given an executor that always fails T1 and 2 attempts per task
/// When the phase runs
/// Then T1 fails permanently, later tasks never run, and the run is incomplete
#[tokio::test]
async fn test_exhausted_attempts_end_run_incomplete() {
    let mut harness = Harness::new(2);
    harness.settings.max_task_attempts = Some(2);
    let executor = Arc::new(ScriptedExecutor::new().failing("T1"));

    let report = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &chain(3))
        .await
        .unwrap();

    assert_eq!(report.exit_code, EXIT_INCOMPLETE);
    assert_eq!(report.failed_tasks, vec![TaskId::from("T1")]);
    assert_eq!(report.tasks_completed, 1);
    assert_eq!(executor.executions_of("T1").len(), 2);
    assert!(executor.executions_of("T2").is_empty());
    assert!(report.headline().contains("failed: T1"));

    // Executor failures never reach the gate.
    assert_eq!(harness.lint.calls(), 1);
}

/// Test: Store outage halts the run
/// Given a store that becomes unavailable while T1 executes
/// When the gate tries to record its result
/// Then the run halts with a persistence error and T2 never starts
#[tokio::test]
async fn test_store_outage_halts_the_run() {
    let harness = Harness::new(1);
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_delay(Duration::from_millis(10))
            .breaking_store_on("T1", harness.store.clone()),
    );

    let err = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &chain(3))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Persistence(_)), "got {:?}", err);
    assert_eq!(err.exit_code(), EXIT_PERSISTENCE);
    assert!(executor.executions_of("T2").is_empty());

    harness.store.set_unavailable(false);
    let phases = harness.store.phase_runs().await.unwrap();
    assert_eq!(phases.len(), 1);
    let runs = harness.store.task_runs(phases[0].id).await.unwrap();
    let t1 = runs
        .iter()
        .find(|r| r.task_id.as_str() == "T1")
        .unwrap();
    assert!(
        t1.completed_at.is_none(),
        "nothing may complete without a durable gate result"
    );
}
