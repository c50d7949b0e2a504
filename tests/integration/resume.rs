//! Resume tests.
//!
//! A phase run is reused rather than recreated: completed tasks are never
//! executed again, and finished runs are a no-op.

use std::sync::Arc;

use tempfile::TempDir;

use phaser::core::{TaskId, WorkerId};
use phaser::error::{EXIT_INCOMPLETE, EXIT_OK};
use phaser::store::{FileStore, PhaseRunId, PhaseRunStatus, RunStore, EXIT_ABANDONED};
use phaser::Error;

use crate::fixtures::{diamond, runner_over, Harness, ScriptedExecutor};

/// Test: Re-running a completed phase is a no-op
/// Given a phase run that completed
/// When the same phase, project, and task list are run again
/// Then nothing executes, no task runs are added, and the report is a success
#[tokio::test]
async fn test_rerun_of_completed_phase_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(2);
    let store: Arc<dyn RunStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());

    let first = Arc::new(ScriptedExecutor::new());
    let report = runner_over(store.clone(), first.clone(), &harness)
        .run("phase-1", "demo", &diamond())
        .await
        .unwrap();
    assert!(report.is_success());
    let runs_before = store.task_runs(report.phase_run_id).await.unwrap().len();

    let second = Arc::new(ScriptedExecutor::new());
    let again = runner_over(store.clone(), second.clone(), &harness)
        .run("phase-1", "demo", &diamond())
        .await
        .unwrap();

    assert_eq!(again.phase_run_id, report.phase_run_id);
    assert!(again.resumed_noop);
    assert_eq!(again.exit_code, EXIT_OK);
    assert_eq!(again.tasks_completed, 4);
    assert!(second.executions().is_empty());
    assert_eq!(
        store.task_runs(report.phase_run_id).await.unwrap().len(),
        runs_before
    );
    assert_eq!(store.phase_runs().await.unwrap().len(), 1);
}

/// Test: Resume after an incomplete run
/// Given a run where B failed permanently so D never ran
/// When the run is resumed with a healthy executor, from a reopened store
/// Then only B and D execute, on the same phase run, and the run completes
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_skips_completed_tasks() {
    let dir = TempDir::new().unwrap();
    let mut harness = Harness::new(2);
    harness.settings.max_task_attempts = Some(1);

    let phase_run_id = {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let broken = Arc::new(ScriptedExecutor::new().failing("B"));
        let report = runner_over(store, broken, &harness)
            .run("phase-1", "demo", &diamond())
            .await
            .unwrap();
        assert_eq!(report.exit_code, EXIT_INCOMPLETE);
        assert_eq!(report.failed_tasks, vec![TaskId::from("B")]);
        report.phase_run_id
    };

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let phase = store.phase_run(phase_run_id).await.unwrap().unwrap();
    assert_eq!(phase.status, PhaseRunStatus::Failed);

    let healthy = Arc::new(ScriptedExecutor::new());
    let report = runner_over(store.clone(), healthy.clone(), &harness)
        .resume(phase_run_id)
        .await
        .unwrap();

    assert_eq!(report.phase_run_id, phase_run_id);
    assert_eq!(report.exit_code, EXIT_OK);
    assert!(!report.resumed_noop);
    let mut executed = healthy.order();
    executed.sort();
    assert_eq!(executed, vec!["B", "D"]);

    let runs = store.task_runs(phase_run_id).await.unwrap();
    for task in ["A", "C"] {
        let count = runs.iter().filter(|r| r.task_id.as_str() == task).count();
        assert_eq!(count, 1, "{} must not be re-run", task);
    }
    let phase = store.phase_run(phase_run_id).await.unwrap().unwrap();
    assert_eq!(phase.status, PhaseRunStatus::Completed);
    assert_eq!(store.phase_runs().await.unwrap().len(), 1);
}

/// Test: Task runs left open by a crashed coordinator
/// Given a journal with an open task run for A and no completion
/// When the phase run is resumed
/// Then the stale run is closed as abandoned and A runs again under a new task run
#[tokio::test]
async fn test_resume_closes_abandoned_task_runs() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(1);
    let tasks = diamond();

    let (phase_run_id, stale) = {
        let store = FileStore::open(dir.path()).await.unwrap();
        let id = store
            .on_phase_run_start("phase-1", "demo", "test-agent", &tasks)
            .await
            .unwrap();
        let run = store
            .on_task_run_start(id, &TaskId::from("A"), WorkerId::new())
            .await
            .unwrap();
        (id, run.id)
    };

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let executor = Arc::new(ScriptedExecutor::new());
    let report = runner_over(store.clone(), executor.clone(), &harness)
        .run("phase-1", "demo", &tasks)
        .await
        .unwrap();

    assert_eq!(report.phase_run_id, phase_run_id);
    assert!(report.is_success());
    let closed = store.task_run(stale).await.unwrap().unwrap();
    assert_eq!(closed.exit_code, Some(EXIT_ABANDONED));
    assert!(closed.completed_at.is_none());
    assert_eq!(executor.executions_of("A").len(), 1);
}

/// Test: Unknown phase run id
/// Given an empty store
/// When resume is called with a random id
/// Then PhaseRunNotFound is returned
#[tokio::test]
async fn test_resume_unknown_phase_run() {
    let harness = Harness::new(1);
    let err = harness
        .runner(Arc::new(ScriptedExecutor::new()))
        .resume(PhaseRunId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PhaseRunNotFound(_)));
}

/// Test: A different task list starts a new phase run
/// Given a completed phase run
/// When the same phase is run with a changed task list
/// Then a second phase run is created
#[tokio::test]
async fn test_changed_task_list_starts_fresh() {
    let harness = Harness::new(2);
    let executor = Arc::new(ScriptedExecutor::new());
    let first = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &diamond())
        .await
        .unwrap();

    let mut changed = diamond();
    changed.pop();
    let second = harness
        .runner(executor)
        .run("phase-1", "demo", &changed)
        .await
        .unwrap();

    assert_ne!(first.phase_run_id, second.phase_run_id);
    assert!(!second.resumed_noop);
    assert_eq!(harness.store.phase_runs().await.unwrap().len(), 2);
}
