//! Point-in-time recovery: a base backup plus the mutation log up to a target.

use crate::error::{RecoveryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepsafe_backup::{BackupKind, BackupMetadata, Backups};
use keepsafe_txlog::{Operation, OperationCounts, TransactionLog, TransactionLogEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cost model and defaults for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitrConfig {
    /// Fixed cost of a restore, in seconds.
    pub base_cost_secs: u64,
    /// Replay cost per log entry, in milliseconds.
    pub per_entry_cost_ms: u64,
    /// Default row limit of [`PitrEngine::get_recovery_points`].
    pub points_limit: usize,
}

impl Default for PitrConfig {
    fn default() -> Self {
        Self {
            base_cost_secs: 30,
            per_entry_cost_ms: 10,
            points_limit: 10,
        }
    }
}

impl PitrConfig {
    /// Estimated restore plus replay time for `entries` log entries.
    pub fn estimate_ms(&self, entries: u64) -> u64 {
        self.base_cost_secs * 1000 + entries * self.per_entry_cost_ms
    }
}

/// Applies replayed mutations to the restored database.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Applies one entry.
    async fn apply(&self, entry: &TransactionLogEntry) -> Result<()>;
}

/// Replay target that records intent in the log and changes nothing.
///
/// The journal holds row images, not statements, so applying them needs
/// schema knowledge this crate does not have. Deployments that can apply
/// row images plug in their own [`ReplayTarget`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReplayTarget;

#[async_trait]
impl ReplayTarget for LoggingReplayTarget {
    async fn apply(&self, entry: &TransactionLogEntry) -> Result<()> {
        match entry.operation {
            Operation::Insert => info!(table = %entry.table, record_id = %entry.record_id, "replay INSERT"),
            Operation::Update => info!(table = %entry.table, record_id = %entry.record_id, "replay UPDATE"),
            Operation::Delete => info!(table = %entry.table, record_id = %entry.record_id, "replay DELETE"),
        }
        Ok(())
    }
}

/// A base backup and the log window on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPoint {
    /// Requested recovery time.
    pub timestamp: DateTime<Utc>,
    /// Chosen base backup.
    pub backup_id: String,
    /// When the base backup was taken.
    pub backup_timestamp: DateTime<Utc>,
    /// Log entries in `[backup_timestamp, timestamp]`.
    pub log_entries: u64,
}

/// One entry that could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFailure {
    /// Entry id.
    pub entry_id: String,
    /// Cause.
    pub error: String,
}

/// Result of [`PitrEngine::recover_to_point`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOutcome {
    /// The point recovered to.
    pub recovery_point: RecoveryPoint,
    /// True if nothing was changed.
    pub dry_run: bool,
    /// Backup of the state that was replaced.
    pub pre_recovery_backup: Option<String>,
    /// Entries applied.
    pub replayed: u64,
    /// Entries that failed and were skipped.
    pub skipped: u64,
    /// Why each skipped entry failed.
    pub failures: Vec<ReplayFailure>,
}

/// Log window summary used by recovery tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogWindow {
    /// Entries in the window.
    pub count: u64,
    /// Entries per operation kind.
    pub operations: OperationCounts,
}

/// Result of [`PitrEngine::test_recovery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTestReport {
    /// Requested recovery time.
    pub target: DateTime<Utc>,
    /// Chosen base backup.
    pub backup_id: String,
    /// Whether the base backup passed verification.
    pub can_recover: bool,
    /// Log window on top of the base backup.
    pub transaction_logs: LogWindow,
    /// Estimated restore plus replay time.
    pub estimated_duration_ms: u64,
}

/// How far the log has moved past one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPointLag {
    /// Backup id.
    pub backup_id: String,
    /// Backup time.
    pub timestamp: DateTime<Utc>,
    /// Log entries logged since the backup.
    pub entries_since: u64,
}

/// Finds recovery points and recovers to them.
pub struct PitrEngine {
    backups: Arc<dyn Backups>,
    txlog: Arc<TransactionLog>,
    replay: Arc<dyn ReplayTarget>,
    config: PitrConfig,
}

impl PitrEngine {
    /// Engine replaying through [`LoggingReplayTarget`].
    pub fn new(backups: Arc<dyn Backups>, txlog: Arc<TransactionLog>, config: PitrConfig) -> Self {
        Self::with_replay_target(backups, txlog, Arc::new(LoggingReplayTarget), config)
    }

    /// Engine replaying through `replay`.
    pub fn with_replay_target(
        backups: Arc<dyn Backups>,
        txlog: Arc<TransactionLog>,
        replay: Arc<dyn ReplayTarget>,
        config: PitrConfig,
    ) -> Self {
        Self {
            backups,
            txlog,
            replay,
            config,
        }
    }

    /// Engine settings.
    pub fn config(&self) -> &PitrConfig {
        &self.config
    }

    async fn base_backup(&self, target: DateTime<Utc>) -> Result<BackupMetadata> {
        self.backups
            .list_backups()
            .await?
            .into_iter()
            .find(|b| b.is_success() && b.timestamp <= target)
            .ok_or(RecoveryError::NoRecoveryPoint { target })
    }

    async fn window(&self, base: &BackupMetadata, target: DateTime<Utc>) -> Result<Vec<TransactionLogEntry>> {
        Ok(self.txlog.get_logs_in_range(base.timestamp, target).await?)
    }

    /// Newest successful backup taken at or before `target`.
    pub async fn find_recovery_point(&self, target: DateTime<Utc>) -> Result<RecoveryPoint> {
        let base = self.base_backup(target).await?;
        let entries = self.window(&base, target).await?;
        Ok(RecoveryPoint {
            timestamp: target,
            backup_id: base.id,
            backup_timestamp: base.timestamp,
            log_entries: entries.len() as u64,
        })
    }

    /// Restores the base backup for `target` and replays the log up to it.
    ///
    /// A fresh backup of the current state is taken first; its retention pass
    /// never removes the base backup. Entries that fail
    /// to replay are counted and skipped. With `dry_run` nothing is touched.
    pub async fn recover_to_point(&self, target: DateTime<Utc>, dry_run: bool) -> Result<RecoveryOutcome> {
        let base = self.base_backup(target).await?;
        let entries = self.window(&base, target).await?;
        let recovery_point = RecoveryPoint {
            timestamp: target,
            backup_id: base.id.clone(),
            backup_timestamp: base.timestamp,
            log_entries: entries.len() as u64,
        };

        if dry_run {
            info!(
                target = %target,
                backup_id = %base.id,
                log_entries = entries.len(),
                "dry run: recovery plan computed"
            );
            return Ok(RecoveryOutcome {
                recovery_point,
                dry_run: true,
                pre_recovery_backup: None,
                replayed: 0,
                skipped: 0,
                failures: Vec::new(),
            });
        }

        info!(target = %target, backup_id = %base.id, "taking pre-recovery backup");
        let safety = self
            .backups
            .backup_retaining(BackupKind::Full, std::slice::from_ref(&base.id))
            .await?;

        info!(backup_id = %base.id, "restoring base backup");
        self.backups.restore(&base.id, None).await?;

        let mut replayed = 0u64;
        let mut failures = Vec::new();
        for entry in &entries {
            debug!(entry_id = %entry.id, operation = %entry.operation, table = %entry.table, "replaying entry");
            match self.replay.apply(entry).await {
                Ok(()) => replayed += 1,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "replay failed, skipping entry");
                    failures.push(ReplayFailure {
                        entry_id: entry.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            target = %target,
            backup_id = %base.id,
            replayed,
            skipped = failures.len(),
            "point-in-time recovery finished"
        );
        Ok(RecoveryOutcome {
            recovery_point,
            dry_run: false,
            pre_recovery_backup: Some(safety.id),
            replayed,
            skipped: failures.len() as u64,
            failures,
        })
    }

    /// Read-only rehearsal of a recovery to `target`.
    pub async fn test_recovery(&self, target: DateTime<Utc>) -> Result<RecoveryTestReport> {
        let base = self.base_backup(target).await?;
        let entries = self.window(&base, target).await?;
        let can_recover = self.backups.verify_backup(&base.id).await?;
        let count = entries.len() as u64;
        Ok(RecoveryTestReport {
            target,
            backup_id: base.id,
            can_recover,
            transaction_logs: LogWindow {
                count,
                operations: OperationCounts::tally(&entries),
            },
            estimated_duration_ms: self.config.estimate_ms(count),
        })
    }

    /// Log lag behind each of the `limit` newest successful backups.
    pub async fn get_recovery_points(&self, limit: usize) -> Result<Vec<RecoveryPointLag>> {
        let recent: Vec<BackupMetadata> = self
            .backups
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| b.is_success())
            .take(limit)
            .collect();
        let mut points = Vec::with_capacity(recent.len());
        for backup in recent {
            let entries_since = self.txlog.get_logs_since(backup.timestamp).await?.len() as u64;
            points.push(RecoveryPointLag {
                backup_id: backup.id,
                timestamp: backup.timestamp,
                entries_since,
            });
        }
        Ok(points)
    }
}
