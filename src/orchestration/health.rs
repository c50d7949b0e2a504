//! Health monitoring for workers.
//!
//! Workers heartbeat while they own a task. The `HealthMonitor` periodically
//! asks the dispatcher to reap runs whose owner has gone silent for longer
//! than the configured timeout, and turns each reaped run into events plus
//! the recovery action the runner should take.

use crate::core::{TaskId, WorkerId};
use crate::error::Result;
use crate::orchestration::dispatcher::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default time without a heartbeat before a worker is considered failed.
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 600;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub worker_timeout: Duration,
    /// How often the monitor looks for silent workers.
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
            check_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }
}

impl HealthConfig {
    pub fn with_worker_timeout(timeout: Duration) -> Self {
        Self {
            worker_timeout: timeout,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Stop the silent worker and let another one claim the task.
    Reassign,
    /// The task ran out of attempts; an operator has to look at it.
    Escalate { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    WorkerSilent {
        worker_id: WorkerId,
        task_id: TaskId,
        silent_for: Duration,
    },
    RecoveryTriggered {
        worker_id: WorkerId,
        task_id: TaskId,
        action: RecoveryAction,
    },
}

pub struct HealthMonitor {
    config: HealthConfig,
    dispatcher: Arc<Dispatcher>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Reap silent owners and report what happened.
    ///
    /// # Errors
    ///
    /// Store failures while failing the reaped runs.
    pub async fn check_all(&self) -> Result<Vec<HealthEvent>> {
        let reaped = self.dispatcher.reap(self.config.worker_timeout).await?;
        let mut events = Vec::with_capacity(reaped.len() * 2);
        for run in reaped {
            warn!(
                worker = %run.worker_id.short(),
                task = %run.task_id,
                silent_secs = run.silent_for.as_secs(),
                "worker timed out"
            );
            let action = if run.requeued {
                RecoveryAction::Reassign
            } else {
                RecoveryAction::Escalate {
                    reason: format!("task {} exhausted its attempts", run.task_id),
                }
            };
            events.push(HealthEvent::WorkerSilent {
                worker_id: run.worker_id,
                task_id: run.task_id.clone(),
                silent_for: run.silent_for,
            });
            events.push(HealthEvent::RecoveryTriggered {
                worker_id: run.worker_id,
                task_id: run.task_id,
                action,
            });
        }
        Ok(events)
    }
}
