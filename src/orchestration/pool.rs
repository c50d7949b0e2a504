//! Worker pool.
//!
//! The `WorkerPool` spawns workers as tokio tasks up to a fixed capacity and
//! reports how each one ended on a channel. A panicking worker is caught
//! and reported as `Crashed` so the runner can fail its task and spawn a
//! replacement.

use crate::core::WorkerId;
use crate::error::{Error, Result};
use crate::orchestration::worker::{Worker, WorkerContext, WorkerSummary};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How a worker's life went.
#[derive(Debug)]
pub enum WorkerEvent {
    Started {
        worker_id: WorkerId,
    },
    /// The worker returned normally.
    Exited {
        worker_id: WorkerId,
        summary: WorkerSummary,
    },
    /// The worker stopped on a fatal error.
    Failed {
        worker_id: WorkerId,
        error: Error,
    },
    /// The worker panicked.
    Crashed {
        worker_id: WorkerId,
        reason: String,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerEvent::Started { worker_id }
            | WorkerEvent::Exited { worker_id, .. }
            | WorkerEvent::Failed { worker_id, .. }
            | WorkerEvent::Crashed { worker_id, .. } => *worker_id,
        }
    }
}

pub struct WorkerPool {
    context: WorkerContext,
    workers: HashMap<WorkerId, JoinHandle<()>>,
    max_workers: usize,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    replacements: usize,
}

impl WorkerPool {
    pub fn new(
        max_workers: usize,
        context: WorkerContext,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            context,
            workers: HashMap::new(),
            max_workers,
            event_tx,
            replacements: 0,
        }
    }

    /// Spawn one worker.
    ///
    /// # Errors
    ///
    /// `PoolFull` if the pool is at capacity.
    pub async fn spawn(&mut self) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_workers,
            });
        }

        let id = WorkerId::new();
        let inbox = self.context.mailbox.register(id).await;
        let worker = Worker::new(id, &self.context, inbox);
        let tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let _ = tx.send(WorkerEvent::Started { worker_id: id });
            let event = match AssertUnwindSafe(worker.run()).catch_unwind().await {
                Ok(Ok(summary)) => WorkerEvent::Exited {
                    worker_id: id,
                    summary,
                },
                Ok(Err(error)) => WorkerEvent::Failed {
                    worker_id: id,
                    error,
                },
                Err(panic) => WorkerEvent::Crashed {
                    worker_id: id,
                    reason: panic_message(panic.as_ref()),
                },
            };
            let _ = tx.send(event);
        });

        self.workers.insert(id, handle);
        debug!(worker = %id.short(), active = self.workers.len(), "worker spawned");
        Ok(id)
    }

    /// Spawn up to `count` workers, bounded by capacity.
    pub async fn spawn_many(&mut self, count: usize) -> Result<Vec<WorkerId>> {
        let mut spawned = Vec::new();
        while spawned.len() < count && self.has_capacity() {
            spawned.push(self.spawn().await?);
        }
        Ok(spawned)
    }

    /// Forget a worker that has ended.
    pub async fn remove(&mut self, id: WorkerId) {
        self.workers.remove(&id);
        self.context.mailbox.unregister(id).await;
    }

    /// Abort a worker that stopped responding. Its subprocesses are killed
    /// when their futures drop.
    pub async fn terminate(&mut self, id: WorkerId) -> Result<()> {
        let handle = self
            .workers
            .remove(&id)
            .ok_or(Error::WorkerNotFound { id })?;
        handle.abort();
        self.context.mailbox.unregister(id).await;
        self.context.dispatcher.forget_worker(id).await;
        info!(worker = %id.short(), "worker terminated");
        Ok(())
    }

    /// Remove `dead` and spawn a worker in its place.
    pub async fn replace(&mut self, dead: WorkerId) -> Result<WorkerId> {
        self.remove(dead).await;
        let id = self.spawn().await?;
        self.replacements += 1;
        info!(dead = %dead.short(), replacement = %id.short(), "worker replaced");
        Ok(id)
    }

    /// Request shutdown and wait for every worker to finish or release.
    pub async fn shutdown(&mut self) {
        self.context.cancel.cancel();
        for (id, handle) in self.workers.drain() {
            if let Err(err) = handle.await {
                debug!(worker = %id.short(), error = %err, "worker join failed");
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.max_workers
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn replacements(&self) -> usize {
        self.replacements
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}
