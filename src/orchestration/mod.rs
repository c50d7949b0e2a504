//! Orchestration layer: scheduling, dispatch, workers, and the phase runner.
//!
//! The `Dispatcher` is the only place task status changes. Workers read
//! board snapshots through the `WaveScheduler`, claim through the
//! dispatcher, and run each claimed task through the quality gate. The
//! `PhaseRunner` ties these together for one phase run and the
//! `HealthMonitor` reaps workers that stop heartbeating.

mod dispatcher;
mod health;
mod mailbox;
mod pool;
mod runner;
mod scheduler;
mod worker;

pub use dispatcher::{BoardSnapshot, Dispatcher, ReapedRun, RunEvent};
pub use health::{
    HealthConfig, HealthEvent, HealthMonitor, RecoveryAction, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_WORKER_TIMEOUT_SECS,
};
pub use mailbox::{Mailbox, PeerMessage};
pub use pool::{WorkerEvent, WorkerPool};
pub use runner::{PhaseRunner, RunSettings};
pub use scheduler::{SchedulerStep, WaveScheduler};
pub use worker::{
    CommandExecutor, ExecutionContext, ExecutionReport, TaskExecutor, Worker, WorkerContext,
    WorkerSummary,
};
