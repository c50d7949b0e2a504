//! In-memory run store (non-persistent).

use super::ledger::{Journal, Ledger, LedgerStore, StoreRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Journal that keeps nothing; the ledger is the only copy.
///
/// It can be switched to an unavailable state to exercise the
/// orchestrator's handling of a store outage.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    unavailable: AtomicBool,
}

#[async_trait]
impl Journal for MemoryJournal {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn append(&self, _record: &StoreRecord) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Persistence("memory store is unavailable".to_string()));
        }
        Ok(())
    }
}

pub type MemoryStore = LedgerStore<MemoryJournal>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_ledger(MemoryJournal::default(), Ledger::new())
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.journal().unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
