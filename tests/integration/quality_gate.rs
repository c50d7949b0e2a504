//! Quality gate enforcement through whole runs.
//!
//! A blocked gate keeps the task with its owner and retries in place; the
//! task only completes once the store holds passing results for every
//! required check and an approved review.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use phaser::core::{TaskId, TaskSpec};
use phaser::error::EXIT_INCOMPLETE;
use phaser::orchestration::RunEvent;
use phaser::store::{GateStatus, GateType, PhaseRunStatus, ReviewVerdict, RunStore, EXIT_FAILED};

use crate::fixtures::{Harness, ScriptedExecutor, ScriptedReviewer};

fn pair() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("A", "feature"),
        TaskSpec::new("B", "follow-up").depends_on(&["A"]),
    ]
}

// ========== Retry in place ==========

/// Test: Lint fails, then build fails, then everything passes
/// Given a task whose lint fails on attempt 1 and build fails on attempt 2
/// When the phase runs
/// Then the same task run is retried with the gate errors fed back, and completes on attempt 3
#[tokio::test]
async fn test_gate_retries_in_place_until_it_passes() {
    let harness = Harness::new(1);
    harness.lint.fail_on("A", 1, "unused import");
    harness.build.fail_on("A", 2, "missing semicolon");
    let executor = Arc::new(ScriptedExecutor::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = harness
        .runner(executor.clone())
        .with_events(tx)
        .run("phase-1", "demo", &pair())
        .await
        .unwrap();
    assert!(report.is_success());

    let attempts = executor.executions_of("A");
    assert_eq!(attempts.len(), 3);
    assert_eq!(
        attempts.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts[0].gate_errors.is_empty());
    assert_eq!(attempts[1].gate_errors, vec!["lint: unused import".to_string()]);
    assert_eq!(attempts[2].gate_errors, vec!["build: missing semicolon".to_string()]);

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    let a_runs: Vec<_> = runs.iter().filter(|r| r.task_id.as_str() == "A").collect();
    assert_eq!(a_runs.len(), 1, "retries stay on one task run");
    let a_run = a_runs[0];
    assert!(a_run.is_successful());

    let results = harness.store.gate_results(a_run.id).await.unwrap();
    let by_attempt = |n: u32| -> Vec<(GateType, GateStatus)> {
        results
            .iter()
            .filter(|r| r.attempt == n)
            .map(|r| (r.gate_type, r.status))
            .collect()
    };
    assert_eq!(by_attempt(1), vec![(GateType::Lint, GateStatus::Failed)]);
    assert_eq!(
        by_attempt(2),
        vec![
            (GateType::Lint, GateStatus::Passed),
            (GateType::Build, GateStatus::Failed)
        ]
    );
    assert_eq!(
        by_attempt(3),
        vec![
            (GateType::Lint, GateStatus::Passed),
            (GateType::Build, GateStatus::Passed),
            (GateType::Test, GateStatus::Passed),
            (GateType::Review, GateStatus::Passed)
        ]
    );

    let b = runs
        .iter()
        .find(|r| r.task_id.as_str() == "B")
        .unwrap();
    assert!(b.claimed_at >= a_run.completed_at.unwrap());

    let mut blocked = 0;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::GateBlocked { task_id, .. } = event {
            assert_eq!(task_id, TaskId::from("A"));
            blocked += 1;
        }
    }
    assert_eq!(blocked, 2);
    assert_eq!(report.gate_first_try_passes, 4, "B passes lint, build, test, review first time");
}

/// Test: Review follow-up blocks completion
/// Given a reviewer that asks for follow-up on the first attempt
/// When the phase runs
/// Then the task is executed again with the review comment and then completes
#[tokio::test]
async fn test_review_followup_blocks_until_approved() {
    let reviewer = Arc::new(ScriptedReviewer::new());
    reviewer.followup_on("A", 1);
    let harness = Harness::new(1).with_reviewer(reviewer);
    let executor = Arc::new(ScriptedExecutor::new());

    let report = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &[TaskSpec::new("A", "feature")])
        .await
        .unwrap();
    assert!(report.is_success());

    let attempts = executor.executions_of("A");
    assert_eq!(attempts.len(), 2);
    assert_eq!(
        attempts[1].gate_errors,
        vec!["review: A needs another pass".to_string()]
    );

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    let reviews = harness.store.code_reviews(runs[0].id).await.unwrap();
    let verdicts: Vec<_> = reviews.iter().map(|r| r.verdict).collect();
    assert_eq!(
        verdicts,
        vec![ReviewVerdict::NeedsFollowup, ReviewVerdict::Approved]
    );
    assert!(reviews.iter().all(|r| r.reviewer == "scripted-reviewer"));
}

// ========== Optional checks ==========

/// Test: Optional check failures are warnings
/// Given an optional test check that always fails and the default reviewer
/// When the phase runs
/// Then the task completes and the review lists the warning
#[tokio::test]
async fn test_optional_failure_does_not_block() {
    let harness = Harness::new(1);
    harness.test.fail_always("A");
    let executor = Arc::new(ScriptedExecutor::new());

    let report = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &[TaskSpec::new("A", "feature")])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(executor.executions_of("A").len(), 1);
    assert_eq!(harness.test.calls(), 1);

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    let reviews = harness.store.code_reviews(runs[0].id).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].verdict, ReviewVerdict::Approved);
    assert!(
        reviews[0].summary.contains("test: A never passes"),
        "summary was {}",
        reviews[0].summary
    );
}

/// Test: Required checks short-circuit
/// Given lint failing on attempt 1
/// When the gate evaluates
/// Then build and test are not run for that attempt
#[tokio::test]
async fn test_required_failure_skips_later_checks() {
    let harness = Harness::new(1);
    harness.lint.fail_on("A", 1, "bad style");
    let executor = Arc::new(ScriptedExecutor::new());

    harness
        .runner(executor)
        .run("phase-1", "demo", &[TaskSpec::new("A", "feature")])
        .await
        .unwrap();

    assert_eq!(harness.lint.calls(), 2);
    assert_eq!(harness.build.calls(), 1);
    assert_eq!(harness.test.calls(), 1);
}

// ========== Caps and checkpoints ==========

/// Test: Retry cap turns a stuck gate into failed attempts
/// Given a gate that never passes for A, a retry cap of 2, and 2 attempts per task
/// When the phase runs
/// Then A fails permanently, B never runs, and the run ends incomplete
#[tokio::test]
async fn test_retry_cap_fails_the_task() {
    let mut harness = Harness::new(2);
    harness.settings.gate.retry_cap = Some(2);
    harness.settings.max_task_attempts = Some(2);
    harness.lint.fail_always("A");
    let executor = Arc::new(ScriptedExecutor::new());

    let report = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &pair())
        .await
        .unwrap();

    assert_eq!(report.exit_code, EXIT_INCOMPLETE);
    assert_eq!(report.status, PhaseRunStatus::Failed);
    assert_eq!(report.failed_tasks, vec![TaskId::from("A")]);
    assert_eq!(report.failed_attempts, 2);
    assert_eq!(executor.executions_of("A").len(), 4);
    assert!(executor.executions_of("B").is_empty());

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.exit_code == Some(EXIT_FAILED)));
    assert!(runs.iter().all(|r| r.completed_at.is_none()));

    let phase = harness
        .store
        .phase_run(report.phase_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(phase.status, PhaseRunStatus::Failed);
    assert_eq!(phase.exit_code, Some(EXIT_INCOMPLETE));
}

/// Test: Long-running tasks checkpoint once per attempt
/// Given a checkpoint threshold shorter than the task's execution time
/// When the phase runs
/// Then exactly one checkpoint is recorded and the task still completes normally
#[tokio::test]
async fn test_long_task_writes_one_checkpoint() {
    let mut harness = Harness::new(1);
    harness.settings.gate.checkpoint_threshold = Duration::from_millis(40);
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(200)));

    let report = harness
        .runner(executor)
        .run("phase-1", "demo", &[TaskSpec::new("A", "slow")])
        .await
        .unwrap();
    assert!(report.is_success());

    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    let checkpoints = harness.store.checkpoints(runs[0].id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].attempt, 1);
    assert!(runs[0].is_successful());
}
