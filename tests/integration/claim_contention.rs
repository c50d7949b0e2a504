//! Claim contention tests.
//!
//! These tests verify that concurrent claims on the same task resolve to
//! exactly one owner and one task run.

use std::sync::Arc;
use std::time::Duration;

use phaser::core::{TaskGraph, TaskId, TaskSpec, TaskStatus, WorkerId};
use phaser::orchestration::Dispatcher;
use phaser::quality::GateRequirements;
use phaser::store::{MemoryStore, RunStore};
use phaser::Error;

use crate::fixtures::{independent, Harness, ScriptedExecutor};

async fn single_task_dispatcher() -> (Arc<Dispatcher>, Arc<MemoryStore>) {
    let specs = [TaskSpec::new("A", "contended")];
    let store = Arc::new(MemoryStore::new());
    let phase = store
        .on_phase_run_start("phase-1", "demo", "test-agent", &specs)
        .await
        .unwrap();
    let graph = TaskGraph::build(&specs).unwrap();
    let dispatcher = Dispatcher::new(
        phase,
        &graph,
        store.clone(),
        GateRequirements {
            required: vec![],
            require_review: false,
        },
    );
    (Arc::new(dispatcher), store)
}

/// Test: First claim wins
/// Given 16 workers racing to claim the same ready task
/// When they all claim at once
/// Then exactly one succeeds and the rest see ClaimConflict
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let (dispatcher, store) = single_task_dispatcher().await;
    let task = TaskId::from("A");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let dispatcher = dispatcher.clone();
        let task = task.clone();
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::new();
            dispatcher.claim(&task, worker).await.map(|run| (worker, run))
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(win) => winners.push(win),
            Err(Error::ClaimConflict { task_id }) => {
                assert_eq!(task_id, task);
                conflicts += 1;
            }
            Err(other) => panic!("unexpected claim error: {}", other),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 15);
    let (owner, run) = &winners[0];
    let snapshot = dispatcher.snapshot().await;
    assert_eq!(snapshot.status(&task), Some(TaskStatus::Claimed));
    assert_eq!(snapshot.owner(&task), Some(*owner));

    let runs = store.task_runs(dispatcher.phase_run_id()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run.id);
    assert_eq!(runs[0].owner, *owner);
}

/// Test: A failed store write leaves the task claimable
/// Given an unavailable store
/// When a worker claims
/// Then the claim fails with a persistence error and the task stays ready
#[tokio::test]
async fn test_claim_is_not_granted_without_a_durable_record() {
    let (dispatcher, store) = single_task_dispatcher().await;
    let task = TaskId::from("A");

    store.set_unavailable(true);
    let err = dispatcher.claim(&task, WorkerId::new()).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
    assert_eq!(dispatcher.snapshot().await.status(&task), Some(TaskStatus::Ready));

    store.set_unavailable(false);
    assert!(dispatcher.claim(&task, WorkerId::new()).await.is_ok());
}

/// Test: More workers than tasks
/// Given 3 independent tasks and 8 workers
/// When the phase runs
/// Then each task has exactly one task run
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_surplus_workers_never_double_run_a_task() {
    let harness = Harness::new(8);
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(30)));

    let report = harness
        .runner(executor.clone())
        .run("phase-1", "demo", &independent(3))
        .await
        .unwrap();

    assert!(report.is_success());
    let runs = harness.store.task_runs(report.phase_run_id).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.is_successful()));
    assert_eq!(executor.executions().len(), 3);
}
