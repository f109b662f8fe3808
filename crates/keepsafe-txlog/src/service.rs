//! The transaction log service.
//!
//! Every mutation is written to the durable journal first and then to the
//! queryable store. Logging is unconditional: rolling back a transaction
//! only closes it, entries already logged stay.
//!
//! The "current transaction" is a single slot owned by this instance. Callers
//! that share one instance across writers must serialize begin/commit, or
//! thread their own id through [`TransactionLog::log_in_transaction`].

use crate::entry::{Mutation, OperationCounts, TransactionLogEntry, STANDALONE_TX};
use crate::error::Result;
use crate::store::{JsonlLogStore, LogStore, MemoryLogStore};
use chrono::{DateTime, Utc};
use keepsafe_backup::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Transaction log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogConfig {
    /// Directory holding the journal file.
    pub dir: PathBuf,
}

impl Default for TxLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/keepsafe/txlog"),
        }
    }
}

/// Aggregate view of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogStats {
    /// Number of entries.
    pub total: u64,
    /// Distinct transaction ids, `standalone` included.
    pub transactions: u64,
    /// Earliest entry time.
    pub oldest: Option<DateTime<Utc>>,
    /// Latest entry time.
    pub newest: Option<DateTime<Utc>>,
    /// Entries per operation kind.
    pub operations: OperationCounts,
}

impl TxLogStats {
    /// Aggregates over `entries`.
    pub fn from_entries(entries: &[TransactionLogEntry]) -> Self {
        let transactions: HashSet<&str> = entries.iter().map(|e| e.tx_id.as_str()).collect();
        Self {
            total: entries.len() as u64,
            transactions: transactions.len() as u64,
            oldest: entries.iter().map(|e| e.timestamp).min(),
            newest: entries.iter().map(|e| e.timestamp).max(),
            operations: OperationCounts::tally(entries),
        }
    }
}

/// Append-only mutation journal with time-range queries.
pub struct TransactionLog {
    journal: Option<JsonlLogStore>,
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<String>>,
}

impl TransactionLog {
    /// Log over `store` with no separate journal.
    pub fn new(store: Arc<dyn LogStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            journal: None,
            store,
            clock,
            current: Mutex::new(None),
        }
    }

    /// Opens the journal under `config.dir` and loads it into memory.
    pub async fn open(config: &TxLogConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Like [`TransactionLog::open`] with an explicit clock.
    pub async fn open_with_clock(config: &TxLogConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let journal = JsonlLogStore::in_dir(&config.dir);
        journal.repair().await?;
        let existing = journal.read_all().await?;
        info!(path = %journal.path().display(), entries = existing.len(), "transaction log opened");
        Ok(Self {
            journal: Some(journal),
            store: Arc::new(MemoryLogStore::with_entries(existing)),
            clock,
            current: Mutex::new(None),
        })
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens a transaction and returns its id. An already open transaction
    /// is replaced.
    pub fn begin_transaction(&self) -> String {
        let tx_id = uuid::Uuid::new_v4().to_string();
        let previous = self.slot().replace(tx_id.clone());
        if let Some(previous) = previous {
            warn!(previous = %previous, tx_id = %tx_id, "transaction replaced before commit");
        }
        debug!(tx_id = %tx_id, "transaction started");
        tx_id
    }

    /// Id of the open transaction.
    pub fn current_transaction(&self) -> Option<String> {
        self.slot().clone()
    }

    /// Logs under the open transaction, or `standalone` if none is open.
    pub async fn log(&self, mutation: Mutation) -> Result<TransactionLogEntry> {
        let tx_id = self
            .current_transaction()
            .unwrap_or_else(|| STANDALONE_TX.to_string());
        self.log_in_transaction(&tx_id, mutation).await
    }

    /// Logs under an explicit transaction id, ignoring the open one.
    pub async fn log_in_transaction(&self, tx_id: &str, mutation: Mutation) -> Result<TransactionLogEntry> {
        let entry = TransactionLogEntry::from_mutation(mutation, tx_id, self.clock.now());
        if let Some(journal) = &self.journal {
            journal.append(&entry).await?;
        }
        self.store.append(&entry).await?;
        debug!(
            entry_id = %entry.id,
            tx_id = %entry.tx_id,
            operation = %entry.operation,
            table = %entry.table,
            "mutation logged"
        );
        Ok(entry)
    }

    /// Closes the open transaction and returns its id.
    pub fn commit_transaction(&self) -> Option<String> {
        let closed = self.slot().take();
        if let Some(tx_id) = &closed {
            debug!(tx_id = %tx_id, "transaction committed");
        }
        closed
    }

    /// Closes the open transaction without removing its entries.
    pub fn rollback_transaction(&self) -> Option<String> {
        let closed = self.slot().take();
        if let Some(tx_id) = &closed {
            info!(tx_id = %tx_id, "transaction rolled back; logged entries are kept");
        }
        closed
    }

    /// Entries at or after `since`, oldest first.
    pub async fn get_logs_since(&self, since: DateTime<Utc>) -> Result<Vec<TransactionLogEntry>> {
        self.store.range(Some(since), None).await
    }

    /// Entries within `[start, end]`, oldest first. Empty if `start > end`.
    pub async fn get_logs_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TransactionLogEntry>> {
        if start > end {
            return Ok(Vec::new());
        }
        self.store.range(Some(start), Some(end)).await
    }

    /// Totals over the whole log.
    pub async fn get_stats(&self) -> Result<TxLogStats> {
        Ok(TxLogStats::from_entries(&self.store.all().await?))
    }
}
