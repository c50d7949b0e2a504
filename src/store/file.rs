//! Append-only JSON-lines run store.

use super::ledger::{Journal, Ledger, LedgerStore, StoreRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Journal file name inside the store directory.
pub const JOURNAL_FILE: &str = "journal.jsonl";

/// One JSON record per line, synced to disk before `append` returns.
///
/// A failed append is cut back to the previous length so the journal never
/// keeps a fragment in front of later records. If that cut fails too, the
/// journal refuses further appends until the store is reopened.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    poisoned: AtomicBool,
}

#[async_trait]
impl Journal for FileJournal {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn append(&self, record: &StoreRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Persistence(format!(
                "journal {} holds a partial write; reopen the store",
                self.path.display()
            )));
        }
        let len = file
            .metadata()
            .await
            .map_err(|e| persistence(&self.path, "stat", e))?
            .len();

        if let Err(err) = write_line(&mut file, &line).await {
            self.roll_back(&mut file, len).await;
            return Err(persistence(&self.path, "append to", err));
        }
        Ok(())
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

impl FileJournal {
    fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Mutex::new(file),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate to `len`, dropping whatever part of a failed append reached the file.
    async fn roll_back(&self, file: &mut File, len: u64) {
        match file.set_len(len).await {
            Ok(()) => debug!(path = %self.path.display(), len, "failed append rolled back"),
            Err(err) => {
                self.poisoned.store(true, Ordering::Release);
                warn!(path = %self.path.display(), error = %err, "journal rollback failed");
            }
        }
    }
}

fn persistence(path: &Path, action: &str, err: std::io::Error) -> Error {
    Error::Persistence(format!("failed to {} {}: {}", action, path.display(), err))
}

pub type FileStore = LedgerStore<FileJournal>;

impl FileStore {
    /// Open (or create) the store in `dir`, replaying its journal.
    ///
    /// A torn final line left by a crash mid-append is dropped. Any other
    /// unreadable line means the journal is corrupt and opening fails.
    pub async fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| persistence(dir, "create", e))?;
        let path = dir.join(JOURNAL_FILE);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(persistence(&path, "read", err)),
        };

        let (ledger, torn) = replay(&content, &path)?;
        if torn {
            rewrite_without_torn_tail(&path, &content).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| persistence(&path, "open", e))?;

        debug!(path = %path.display(), "file store opened");
        Ok(Self::with_ledger(FileJournal::new(path, file), ledger))
    }
}

/// Rebuild the ledger from journal text. Returns whether the last line was torn.
fn replay(content: &str, path: &Path) -> Result<(Ledger, bool)> {
    let mut ledger = Ledger::new();
    let lines: Vec<&str> = content.lines().collect();
    let ends_cleanly = content.is_empty() || content.ends_with('\n');

    for (number, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoreRecord>(line) {
            Ok(record) => ledger.apply(record),
            Err(err) if number + 1 == lines.len() && !ends_cleanly => {
                warn!(path = %path.display(), error = %err, "dropping torn journal tail");
                return Ok((ledger, true));
            }
            Err(err) => {
                return Err(Error::Persistence(format!(
                    "corrupt journal {} at line {}: {}",
                    path.display(),
                    number + 1,
                    err
                )));
            }
        }
    }
    Ok((ledger, false))
}

async fn rewrite_without_torn_tail(path: &Path, content: &str) -> Result<()> {
    let keep = match content.rfind('\n') {
        Some(idx) => &content[..=idx],
        None => "",
    };
    let tmp_path = path.with_extension("jsonl.tmp");
    fs::write(&tmp_path, keep)
        .await
        .map_err(|e| persistence(&tmp_path, "write", e))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| persistence(path, "finalize", e))?;
    Ok(())
}
