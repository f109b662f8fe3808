//! The backup service: dump, compress, checksum, record, clean up.

use crate::checksum;
use crate::clock::{Clock, SystemClock};
use crate::compression::{self, CompressionConfig};
use crate::db::{Catalog, DumpTool};
use crate::error::{BackupError, Result};
use crate::metadata::{unique_backup_id, BackupKind, BackupMetadata, BackupStats, BackupStatus};
use crate::retention::{plan_retention, RetentionPolicy, RetentionReport};
use crate::store::BackupStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Operations other subsystems need from the backup service.
#[async_trait]
pub trait Backups: Send + Sync {
    /// Takes a backup. Failures are recorded in the index, then returned.
    async fn backup(&self, kind: BackupKind) -> Result<BackupMetadata>;

    /// Takes a backup whose retention pass leaves the artifacts of `keep`
    /// in place. Implementations without retention just take the backup.
    async fn backup_retaining(&self, kind: BackupKind, _keep: &[String]) -> Result<BackupMetadata> {
        self.backup(kind).await
    }

    /// Restores a successful backup into `target`, or the configured database.
    async fn restore(&self, backup_id: &str, target: Option<&str>) -> Result<()>;

    /// Rechecks checksum, size and container integrity of an artifact.
    async fn verify_backup(&self, backup_id: &str) -> Result<bool>;

    /// All metadata records, newest first.
    async fn list_backups(&self) -> Result<Vec<BackupMetadata>>;
}

/// Backup service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding artifacts, `metadata.json` and `backup.log`.
    pub backup_dir: PathBuf,
    /// Connection string of the database to back up.
    pub database_url: Option<String>,
    /// Artifact retention limits.
    pub retention: RetentionPolicy,
    /// Artifact compression settings.
    pub compression: CompressionConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/lib/keepsafe/backups"),
            database_url: None,
            retention: RetentionPolicy::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Produces, verifies and restores database backups.
pub struct BackupService {
    config: BackupConfig,
    store: BackupStore,
    dump: Arc<dyn DumpTool>,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    issued: std::sync::Mutex<HashSet<String>>,
}

impl BackupService {
    /// Creates a service using the wall clock.
    pub fn new(config: BackupConfig, dump: Arc<dyn DumpTool>, catalog: Arc<dyn Catalog>) -> Self {
        Self::with_clock(config, dump, catalog, Arc::new(SystemClock))
    }

    /// Creates a service reading time from `clock`.
    pub fn with_clock(
        config: BackupConfig,
        dump: Arc<dyn DumpTool>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = BackupStore::new(config.backup_dir.clone());
        Self {
            config,
            store,
            dump,
            catalog,
            clock,
            issued: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// The underlying directory store.
    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Service settings.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    fn connection<'a>(&'a self, target: Option<&'a str>) -> Result<&'a str> {
        target
            .or(self.config.database_url.as_deref())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BackupError::Configuration("database connection string is not set".into()))
    }

    /// Picks an id for a backup starting at `timestamp` that no indexed or
    /// previously issued backup uses.
    async fn claim_id(&self, timestamp: DateTime<Utc>) -> Result<String> {
        let indexed = self.store.read_index().await?;
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        issued.extend(indexed.into_iter().map(|r| r.id));
        let id = unique_backup_id(timestamp, &issued);
        issued.insert(id.clone());
        Ok(id)
    }

    async fn produce_artifact(&self, mut record: BackupMetadata, started: Instant) -> Result<BackupMetadata> {
        self.store.init().await?;
        let connection = self.connection(None)?.to_string();

        let staging = self.store.staging_path(&record.id);
        self.dump.dump(&connection, &staging).await?;
        record.uncompressed_bytes = tokio::fs::metadata(&staging).await?.len();

        let level = self.config.compression;
        let artifact = tokio::task::spawn_blocking(move || compression::compress_file(&staging, level)).await??;
        let hashed = artifact.clone();
        record.checksum = tokio::task::spawn_blocking(move || checksum::file_sha256(&hashed)).await??;
        record.size_bytes = tokio::fs::metadata(&artifact).await?.len();

        record.record_count = match self.catalog.total_rows().await {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(backup_id = %record.id, error = %e, "could not count table rows");
                None
            }
        };
        record.compressed = true;
        record.status = BackupStatus::Success;
        record.duration_ms = started.elapsed().as_millis() as u64;
        Ok(record)
    }

    async fn discard_partial(&self, record: &BackupMetadata) {
        let staging = self.store.staging_path(&record.id);
        for path in [staging.clone(), compression::compressed_path(&staging)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not remove partial artifact");
                }
            }
        }
    }

    /// Removes artifacts past the age limit, then the oldest beyond the count limit.
    ///
    /// Only artifacts that belong to a metadata record are considered, and a
    /// file that cannot be removed is logged and skipped.
    pub async fn cleanup_old_backups(&self) -> Result<RetentionReport> {
        self.cleanup_retaining(&HashSet::new()).await
    }

    /// Like [`BackupService::cleanup_old_backups`], never touching `keep`.
    pub async fn cleanup_retaining(&self, keep: &HashSet<String>) -> Result<RetentionReport> {
        let records = self.store.read_index().await?;
        let mut present = HashSet::new();
        for record in records.iter().filter(|r| r.is_success()) {
            if self.store.artifact_exists(record).await {
                present.insert(record.id.clone());
            }
        }

        let plan =
            plan_retention(&records, &present, self.clock.now(), &self.config.retention).sparing(keep);
        let mut report = RetentionReport::default();
        for (ids, counter) in [
            (&plan.by_age, &mut report.removed_by_age),
            (&plan.by_count, &mut report.removed_by_count),
        ] {
            for id in ids {
                let Some(record) = records.iter().find(|r| &r.id == id) else {
                    continue;
                };
                match self.store.remove_artifact(record).await {
                    Ok(true) => *counter += 1,
                    Ok(false) => {}
                    Err(e) => warn!(backup_id = %id, error = %e, "could not remove expired artifact"),
                }
            }
        }

        if report.removed_by_age + report.removed_by_count > 0 {
            info!(
                by_age = report.removed_by_age,
                by_count = report.removed_by_count,
                "retention cleanup removed artifacts"
            );
        }
        Ok(report)
    }

    /// Aggregates over every record in the index.
    pub async fn get_backup_stats(&self) -> Result<BackupStats> {
        Ok(BackupStats::from_records(&self.list_backups().await?))
    }

    async fn verify_record(&self, record: &BackupMetadata) -> Result<bool> {
        let artifact = self.store.artifact_path(record);
        let size = match tokio::fs::metadata(&artifact).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backup_id = %record.id, "artifact missing");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if size != record.size_bytes {
            warn!(backup_id = %record.id, expected = record.size_bytes, actual = size, "artifact size mismatch");
            return Ok(false);
        }

        let expected = record.checksum.clone();
        let path = artifact.clone();
        let (matches, _) = tokio::task::spawn_blocking(move || checksum::verify_file(&path, &expected)).await??;
        if !matches {
            warn!(backup_id = %record.id, "artifact checksum mismatch");
            return Ok(false);
        }

        let intact = tokio::task::spawn_blocking(move || compression::test_integrity(&artifact)).await??;
        if !intact {
            warn!(backup_id = %record.id, "artifact failed container integrity test");
        }
        Ok(intact)
    }

    async fn apply_dump(&self, record: &BackupMetadata, connection: &str, temp: &Path) -> Result<()> {
        let artifact = self.store.artifact_path(record);
        let out = temp.to_path_buf();
        tokio::task::spawn_blocking(move || compression::decompress_file(&artifact, &out)).await??;
        self.dump.restore(connection, temp).await
    }
}

#[async_trait]
impl Backups for BackupService {
    async fn backup(&self, kind: BackupKind) -> Result<BackupMetadata> {
        self.backup_retaining(kind, &[]).await
    }

    async fn backup_retaining(&self, kind: BackupKind, keep: &[String]) -> Result<BackupMetadata> {
        let started = Instant::now();
        let timestamp = self.clock.now();
        let provisional = BackupMetadata::started(self.claim_id(timestamp).await?, timestamp, kind);
        info!(backup_id = %provisional.id, kind = %kind, protected = keep.len(), "starting backup");

        let outcome = match self.produce_artifact(provisional.clone(), started).await {
            Ok(record) => self.store.append(&record).await.map(|_| record),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(record) => {
                if let Err(e) = self.store.append_log_line(&record).await {
                    warn!(backup_id = %record.id, error = %e, "could not write backup.log");
                }
                info!(
                    backup_id = %record.id,
                    size_bytes = record.size_bytes,
                    duration_ms = record.duration_ms,
                    "backup completed"
                );
                let keep: HashSet<String> = keep.iter().cloned().collect();
                if let Err(e) = self.cleanup_retaining(&keep).await {
                    warn!(error = %e, "retention cleanup failed");
                }
                Ok(record)
            }
            Err(e) => {
                self.discard_partial(&provisional).await;
                let failed = provisional.into_failed(e.to_string(), started.elapsed().as_millis() as u64);
                error!(backup_id = %failed.id, error = %e, "backup failed");
                if let Err(store_err) = self.store.append(&failed).await {
                    error!(backup_id = %failed.id, error = %store_err, "could not record failed backup");
                }
                if let Err(log_err) = self.store.append_log_line(&failed).await {
                    warn!(backup_id = %failed.id, error = %log_err, "could not write backup.log");
                }
                Err(e)
            }
        }
    }

    async fn restore(&self, backup_id: &str, target: Option<&str>) -> Result<()> {
        let record = self
            .store
            .find(backup_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;
        if !record.is_success() {
            return Err(BackupError::InvalidState(format!(
                "backup {} has status {}",
                backup_id, record.status
            )));
        }

        let artifact = self.store.artifact_path(&record);
        if !self.store.artifact_exists(&record).await {
            return Err(BackupError::NotFound(format!("artifact for {}", backup_id)));
        }
        let expected = record.checksum.clone();
        let (matches, actual) =
            tokio::task::spawn_blocking(move || checksum::verify_file(&artifact, &expected)).await??;
        if !matches {
            error!(backup_id = %backup_id, "refusing to restore corrupt artifact");
            return Err(BackupError::Integrity {
                backup_id: backup_id.to_string(),
                expected: record.checksum.clone(),
                actual,
            });
        }

        let connection = self.connection(target)?.to_string();
        let temp = self.store.dir().join(format!("{}.restore.sql", record.id));
        info!(backup_id = %backup_id, "restoring backup");
        let result = self.apply_dump(&record, &connection, &temp).await;
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp.display(), error = %e, "could not remove restore temp file");
            }
        }
        match &result {
            Ok(()) => info!(backup_id = %backup_id, "restore completed"),
            Err(e) => error!(backup_id = %backup_id, error = %e, "restore failed"),
        }
        result
    }

    async fn verify_backup(&self, backup_id: &str) -> Result<bool> {
        let Some(record) = self.store.find(backup_id).await? else {
            warn!(backup_id = %backup_id, "verify: unknown backup");
            return Ok(false);
        };
        if !record.is_success() {
            return Ok(false);
        }
        self.verify_record(&record).await
    }

    async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let mut indexed: Vec<(usize, BackupMetadata)> =
            self.store.read_index().await?.into_iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
        Ok(indexed.into_iter().map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct TextDump {
        restores: AtomicUsize,
        fail_dump: bool,
    }

    #[async_trait]
    impl DumpTool for TextDump {
        async fn dump(&self, _connection: &str, dest: &Path) -> Result<()> {
            if self.fail_dump {
                return Err(BackupError::Dump {
                    stage: "dump",
                    msg: "connection refused".into(),
                });
            }
            tokio::fs::write(dest, b"CREATE TABLE users (id int);\n".repeat(50)).await?;
            Ok(())
        }

        async fn restore(&self, _connection: &str, src: &Path) -> Result<()> {
            assert!(src.exists());
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TwoTables;

    #[async_trait]
    impl Catalog for TwoTables {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn table_row_counts(&self) -> Result<BTreeMap<String, u64>> {
            Ok([("users".to_string(), 4), ("points".to_string(), 6)].into())
        }
    }

    fn service(dir: &TempDir, dump: Arc<TextDump>) -> (BackupService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap()));
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            database_url: Some("postgres://localhost/app".into()),
            ..BackupConfig::default()
        };
        (
            BackupService::with_clock(config, dump, Arc::new(TwoTables), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_backup_records_success() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(TextDump::default()));
        let record = svc.backup(BackupKind::Full).await.unwrap();
        assert!(record.is_success());
        assert_eq!(record.record_count, Some(10));
        assert!(record.size_bytes > 0);
        assert!(record.uncompressed_bytes > record.size_bytes);
        assert!(!svc.store().staging_path(&record.id).exists());
        assert_eq!(svc.list_backups().await.unwrap(), vec![record.clone()]);
        assert!(svc.verify_backup(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_backup_is_recorded_and_returned() {
        let dir = TempDir::new().unwrap();
        let dump = Arc::new(TextDump {
            fail_dump: true,
            ..TextDump::default()
        });
        let (svc, _) = service(&dir, dump);
        let err = svc.backup(BackupKind::Full).await.unwrap_err();
        assert!(matches!(err, BackupError::Dump { .. }));
        let records = svc.list_backups().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert_eq!(records[0].checksum, "");
        assert!(records[0].error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_missing_connection_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            database_url: None,
            ..BackupConfig::default()
        };
        let svc = BackupService::new(config, Arc::new(TextDump::default()), Arc::new(TwoTables));
        let err = svc.backup(BackupKind::Full).await.unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_restore_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(TextDump::default()));
        let err = svc.restore("backup-nope", None).await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restore_failed_backup_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let dump = Arc::new(TextDump {
            fail_dump: true,
            ..TextDump::default()
        });
        let (svc, _) = service(&dir, dump);
        let _ = svc.backup(BackupKind::Full).await;
        let id = svc.list_backups().await.unwrap()[0].id.clone();
        let err = svc.restore(&id, None).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_restore_cleans_temp_file() {
        let dir = TempDir::new().unwrap();
        let dump = Arc::new(TextDump::default());
        let (svc, _) = service(&dir, dump.clone());
        let record = svc.backup(BackupKind::Full).await.unwrap();
        svc.restore(&record.id, Some("postgres://localhost/scratch")).await.unwrap();
        assert_eq!(dump.restores.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join(format!("{}.restore.sql", record.id)).exists());
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let (svc, clock) = service(&dir, Arc::new(TextDump::default()));
        let first = svc.backup(BackupKind::Full).await.unwrap();
        clock.advance(Duration::hours(1));
        let second = svc.backup(BackupKind::Incremental).await.unwrap();
        let listed = svc.list_backups().await.unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        let stats = svc.get_backup_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.oldest, Some(first.timestamp));
        assert_eq!(stats.newest, Some(second.timestamp));
    }

    #[tokio::test]
    async fn test_same_instant_backups_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(TextDump::default()));
        let first = svc.backup(BackupKind::Full).await.unwrap();
        let second = svc.backup(BackupKind::Full).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.timestamp, second.timestamp);
        assert_ne!(svc.store().artifact_path(&first), svc.store().artifact_path(&second));
        assert_eq!(svc.store().find(&first.id).await.unwrap().unwrap(), first);
        assert_eq!(svc.store().find(&second.id).await.unwrap().unwrap(), second);
        assert!(svc.verify_backup(&first.id).await.unwrap());
        assert!(svc.verify_backup(&second.id).await.unwrap());
    }

    fn capped(dir: &TempDir, max_backups: usize) -> (BackupService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            database_url: Some("postgres://localhost/app".into()),
            retention: RetentionPolicy {
                max_age_days: 30,
                max_backups,
            },
            ..BackupConfig::default()
        };
        let svc = BackupService::with_clock(config, Arc::new(TextDump::default()), Arc::new(TwoTables), clock.clone());
        (svc, clock)
    }

    #[tokio::test]
    async fn test_count_limit_removes_oldest_artifact() {
        let dir = TempDir::new().unwrap();
        let (svc, clock) = capped(&dir, 2);
        let oldest = svc.backup(BackupKind::Full).await.unwrap();
        for _ in 0..2 {
            clock.advance(Duration::hours(1));
            svc.backup(BackupKind::Full).await.unwrap();
        }
        assert!(!svc.store().artifact_exists(&oldest).await);
        assert_eq!(svc.list_backups().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_backup_retaining_spares_protected_artifact() {
        let dir = TempDir::new().unwrap();
        let (svc, clock) = capped(&dir, 2);
        let oldest = svc.backup(BackupKind::Full).await.unwrap();
        clock.advance(Duration::hours(1));
        svc.backup(BackupKind::Full).await.unwrap();
        clock.advance(Duration::hours(1));
        svc.backup_retaining(BackupKind::Full, &[oldest.id.clone()]).await.unwrap();
        assert!(svc.store().artifact_exists(&oldest).await);
        svc.restore(&oldest.id, None).await.unwrap();

        let report = svc.cleanup_old_backups().await.unwrap();
        assert_eq!(report.removed_by_count, 1);
        assert!(!svc.store().artifact_exists(&oldest).await);
    }

    #[tokio::test]
    async fn test_verify_detects_size_change() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(TextDump::default()));
        let record = svc.backup(BackupKind::Full).await.unwrap();
        let path = svc.store().artifact_path(&record);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(0);
        std::fs::write(&path, bytes).unwrap();
        assert!(!svc.verify_backup(&record.id).await.unwrap());
        assert!(!svc.verify_backup("backup-unknown").await.unwrap());
    }
}
