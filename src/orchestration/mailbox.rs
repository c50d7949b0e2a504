//! Peer messaging between active workers.
//!
//! Messages are addressed by worker id and delivered over per-worker
//! channels. The mailbox has no access to the dispatcher, so a message can
//! never change task ownership.

use crate::core::WorkerId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub from: WorkerId,
    pub to: WorkerId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    inboxes: RwLock<HashMap<WorkerId, mpsc::UnboundedSender<PeerMessage>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inbox for `worker`, replacing any previous one.
    pub async fn register(&self, worker: WorkerId) -> mpsc::UnboundedReceiver<PeerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(worker, tx);
        rx
    }

    pub async fn unregister(&self, worker: WorkerId) {
        self.inboxes.write().await.remove(&worker);
    }

    /// # Errors
    ///
    /// `WorkerNotFound` if `to` has no inbox or has dropped it.
    pub async fn send(&self, from: WorkerId, to: WorkerId, body: &str) -> Result<()> {
        let inboxes = self.inboxes.read().await;
        let inbox = inboxes.get(&to).ok_or(Error::WorkerNotFound { id: to })?;
        inbox
            .send(PeerMessage {
                from,
                to,
                body: body.to_string(),
                sent_at: Utc::now(),
            })
            .map_err(|_| Error::WorkerNotFound { id: to })?;
        debug!(from = %from.short(), to = %to.short(), "peer message sent");
        Ok(())
    }

    /// Send to every registered worker except the sender. Returns how many got it.
    pub async fn broadcast(&self, from: WorkerId, body: &str) -> usize {
        let inboxes = self.inboxes.read().await;
        let now = Utc::now();
        inboxes
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(id, tx)| {
                tx.send(PeerMessage {
                    from,
                    to: **id,
                    body: body.to_string(),
                    sent_at: now,
                })
                .is_ok()
            })
            .count()
    }

    pub async fn workers(&self) -> Vec<WorkerId> {
        self.inboxes.read().await.keys().copied().collect()
    }
}
