//! Where entries live: a queryable store and the durable JSON-lines journal.

use crate::entry::TransactionLogEntry;
use crate::error::{Result, TxLogError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Journal file name inside the transaction log directory.
pub const JOURNAL_FILE: &str = "transactions.jsonl";

/// Append-only entry storage with time-range queries.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends one entry.
    async fn append(&self, entry: &TransactionLogEntry) -> Result<()>;

    /// Entries with `start <= timestamp` and, if given, `timestamp <= end`,
    /// ascending by timestamp. Equal timestamps keep append order.
    async fn range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionLogEntry>>;

    /// Every entry, ascending by timestamp.
    async fn all(&self) -> Result<Vec<TransactionLogEntry>> {
        self.range(None, None).await
    }
}

fn select(
    entries: impl IntoIterator<Item = TransactionLogEntry>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<TransactionLogEntry> {
    let mut out: Vec<TransactionLogEntry> = entries
        .into_iter()
        .filter(|e| start.map_or(true, |s| e.timestamp >= s))
        .filter(|e| end.map_or(true, |t| e.timestamp <= t))
        .collect();
    out.sort_by_key(|e| e.timestamp);
    out
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: RwLock<Vec<TransactionLogEntry>>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `entries`.
    pub fn with_entries(entries: Vec<TransactionLogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Number of entries held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when no entries are held.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: &TransactionLogEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionLogEntry>> {
        let entries = self.entries.read().await;
        Ok(select(entries.iter().cloned(), start, end))
    }
}

/// Durable journal: one JSON object per line, appended and synced per entry.
#[derive(Debug)]
pub struct JsonlLogStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLogStore {
    /// Journal at `path`; the file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Journal named [`JOURNAL_FILE`] inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(JOURNAL_FILE))
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decodes the whole journal in file order.
    ///
    /// A final line without a trailing newline is a torn write from a crash
    /// and is skipped. Any other undecodable line is an error.
    pub async fn read_all(&self) -> Result<Vec<TransactionLogEntry>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let complete = text.ends_with('\n');
        let lines: Vec<&str> = text.lines().collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransactionLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() && !complete => {
                    warn!(path = %self.path.display(), line = i + 1, error = %e, "skipping torn journal line");
                }
                Err(e) => {
                    return Err(TxLogError::Corrupt {
                        line: i + 1,
                        msg: e.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }

    /// Cuts a torn final line off the journal so the next append starts on
    /// a fresh line. Returns the number of bytes dropped.
    pub async fn repair(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.trim_torn_tail().await
    }

    async fn trim_torn_tail(&self) -> Result<u64> {
        let mut file = match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(0);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(0)).await?;
        let mut bytes = Vec::with_capacity(len as usize);
        file.read_to_end(&mut bytes).await?;
        let keep = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos as u64 + 1);
        file.set_len(keep).await?;
        file.sync_data().await?;
        let dropped = len - keep;
        warn!(path = %self.path.display(), dropped, "truncated torn journal tail");
        Ok(dropped)
    }
}

#[async_trait]
impl LogStore for JsonlLogStore {
    async fn append(&self, entry: &TransactionLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.trim_torn_tail().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        debug!(entry_id = %entry.id, path = %self.path.display(), "journaled entry");
        Ok(())
    }

    async fn range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionLogEntry>> {
        Ok(select(self.read_all().await?, start, end))
    }
}
