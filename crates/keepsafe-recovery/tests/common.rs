//! In-memory collaborators for recovery integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use keepsafe_backup::{
    BackupConfig, BackupError, BackupKind, BackupMetadata, BackupService, BackupStatus, Backups, Catalog, Clock,
    DumpTool, ManualClock, RetentionPolicy,
};
use keepsafe_recovery::{
    DisasterRecoveryOrchestrator, FlagFileWriteControl, OrchestratorConfig, PitrConfig, PitrEngine,
    RecoveryError, ReplayTarget,
};
use keepsafe_txlog::{MemoryLogStore, Mutation, Operation, TransactionLog, TransactionLogEntry};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

/// Backup service double that keeps metadata in memory and counts calls.
pub struct MemoryBackups {
    clock: Arc<ManualClock>,
    records: Mutex<Vec<BackupMetadata>>,
    corrupt: Mutex<HashSet<String>>,
    pub backups: AtomicUsize,
    pub restores: Mutex<Vec<String>>,
    pub verifies: AtomicUsize,
    pub fail_backup: AtomicBool,
    pub fail_restore: AtomicBool,
}

impl MemoryBackups {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            records: Mutex::new(Vec::new()),
            corrupt: Mutex::new(HashSet::new()),
            backups: AtomicUsize::new(0),
            restores: Mutex::new(Vec::new()),
            verifies: AtomicUsize::new(0),
            fail_backup: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
        }
    }

    /// Seeds a record without counting it as a backup call.
    pub fn seed(&self, id: &str, timestamp: DateTime<Utc>, status: BackupStatus) {
        let record = BackupMetadata {
            status,
            ..BackupMetadata::started(id.to_string(), timestamp, BackupKind::Full)
        };
        self.records.lock().unwrap().push(record);
    }

    pub fn corrupt(&self, id: &str) {
        self.corrupt.lock().unwrap().insert(id.to_string());
    }

    pub fn backup_calls(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    pub fn restored(&self) -> Vec<String> {
        self.restores.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backups for MemoryBackups {
    async fn backup(&self, kind: BackupKind) -> keepsafe_backup::Result<BackupMetadata> {
        let n = self.backups.fetch_add(1, Ordering::SeqCst);
        if self.fail_backup.load(Ordering::SeqCst) {
            return Err(BackupError::Dump {
                stage: "dump",
                msg: "no space left on device".into(),
            });
        }
        let record = BackupMetadata {
            status: BackupStatus::Success,
            ..BackupMetadata::started(format!("backup-live-{}", n), self.clock.now(), kind)
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn restore(&self, id: &str, _target: Option<&str>) -> keepsafe_backup::Result<()> {
        self.restores.lock().unwrap().push(id.to_string());
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(BackupError::Dump {
                stage: "restore",
                msg: "psql exited with status 3".into(),
            });
        }
        if !self.records.lock().unwrap().iter().any(|r| r.id == id) {
            return Err(BackupError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn verify_backup(&self, id: &str) -> keepsafe_backup::Result<bool> {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        let known = self.records.lock().unwrap().iter().any(|r| r.id == id && r.is_success());
        Ok(known && !self.corrupt.lock().unwrap().contains(id))
    }

    async fn list_backups(&self) -> keepsafe_backup::Result<Vec<BackupMetadata>> {
        let mut indexed: Vec<(usize, BackupMetadata)> =
            self.records.lock().unwrap().clone().into_iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
        Ok(indexed.into_iter().map(|(_, r)| r).collect())
    }
}

/// Catalog double with a switchable outage.
pub struct FakeCatalog {
    pub down: AtomicBool,
    pub empty: AtomicBool,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        Self {
            down: AtomicBool::new(false),
            empty: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn ping(&self) -> keepsafe_backup::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackupError::Dump {
                stage: "catalog",
                msg: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn table_row_counts(&self) -> keepsafe_backup::Result<BTreeMap<String, u64>> {
        self.ping().await?;
        if self.empty.load(Ordering::SeqCst) {
            return Ok(BTreeMap::new());
        }
        Ok([("users".to_string(), 3), ("points".to_string(), 8)].into())
    }
}

/// Replay target rejecting one operation kind.
pub struct RejectingReplay {
    pub rejects: Operation,
    pub applied: AtomicUsize,
}

#[async_trait]
impl ReplayTarget for RejectingReplay {
    async fn apply(&self, entry: &TransactionLogEntry) -> keepsafe_recovery::Result<()> {
        if entry.operation == self.rejects {
            return Err(RecoveryError::Replay {
                entry_id: entry.id.clone(),
                msg: "constraint violation".into(),
            });
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Rig {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub backups: Arc<MemoryBackups>,
    pub catalog: Arc<FakeCatalog>,
    pub txlog: Arc<TransactionLog>,
    pub writes: Arc<FlagFileWriteControl>,
    pub pitr: Arc<PitrEngine>,
    pub orchestrator: DisasterRecoveryOrchestrator,
}

pub fn rig() -> Rig {
    rig_with_replay(None)
}

pub fn rig_with_replay(replay: Option<Arc<dyn ReplayTarget>>) -> Rig {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let backups = Arc::new(MemoryBackups::new(clock.clone()));
    let catalog = Arc::new(FakeCatalog::default());
    let txlog = Arc::new(TransactionLog::new(Arc::new(MemoryLogStore::new()), clock.clone()));
    let pitr = Arc::new(match replay {
        Some(replay) => PitrEngine::with_replay_target(backups.clone(), txlog.clone(), replay, PitrConfig::default()),
        None => PitrEngine::new(backups.clone(), txlog.clone(), PitrConfig::default()),
    });
    let config = OrchestratorConfig {
        plan_path: dir.path().join("recovery-plan.json"),
        maintenance_flag: dir.path().join("maintenance"),
        ..OrchestratorConfig::default()
    };
    let writes = Arc::new(FlagFileWriteControl::new(config.maintenance_flag.clone()));
    let orchestrator = DisasterRecoveryOrchestrator::new(
        &config,
        backups.clone(),
        catalog.clone(),
        writes.clone(),
        pitr.clone(),
        clock.clone(),
    );
    Rig {
        dir,
        clock,
        backups,
        catalog,
        txlog,
        writes,
        pitr,
        orchestrator,
    }
}

/// Logs `op` on `table` at `secs` past [`t0`].
pub async fn log_at(rig: &Rig, secs: i64, op: Operation) {
    rig.clock.set(at(secs));
    let mutation = match op {
        Operation::Insert => Mutation::insert("points", &secs.to_string(), json!({"amount": secs})),
        Operation::Update => Mutation::update("points", &secs.to_string(), json!({"amount": 0}), json!({"amount": secs})),
        Operation::Delete => Mutation::delete("points", &secs.to_string(), json!({"amount": secs})),
    };
    rig.txlog.log(mutation).await.unwrap();
}

/// Dump tool writing a fixed SQL script and remembering which files it restored.
#[derive(Default)]
pub struct ScriptDump {
    pub restored: Mutex<Vec<String>>,
}

#[async_trait]
impl DumpTool for ScriptDump {
    async fn dump(&self, _connection: &str, dest: &Path) -> keepsafe_backup::Result<()> {
        tokio::fs::write(dest, b"INSERT INTO points VALUES (1, 10);\n".repeat(40)).await?;
        Ok(())
    }

    async fn restore(&self, _connection: &str, src: &Path) -> keepsafe_backup::Result<()> {
        let name = src.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let id = name.trim_end_matches(".restore.sql").to_string();
        self.restored.lock().unwrap().push(id);
        Ok(())
    }
}

/// Recovery wiring over a real on-disk backup service.
pub struct ServiceRig {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub dump: Arc<ScriptDump>,
    pub backups: Arc<BackupService>,
    pub txlog: Arc<TransactionLog>,
    pub writes: Arc<FlagFileWriteControl>,
    pub pitr: Arc<PitrEngine>,
    pub orchestrator: DisasterRecoveryOrchestrator,
}

impl ServiceRig {
    pub fn restored(&self) -> Vec<String> {
        self.dump.restored.lock().unwrap().clone()
    }
}

/// Backups kept to `max_backups` artifacts, clock starting at 2024-03-01.
pub fn service_rig(max_backups: usize) -> ServiceRig {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    let dump = Arc::new(ScriptDump::default());
    let catalog = Arc::new(FakeCatalog::default());
    let config = BackupConfig {
        backup_dir: dir.path().join("backups"),
        database_url: Some("postgres://localhost/app".into()),
        retention: RetentionPolicy {
            max_age_days: 30,
            max_backups,
        },
        ..BackupConfig::default()
    };
    let backups = Arc::new(BackupService::with_clock(config, dump.clone(), catalog.clone(), clock.clone()));
    let txlog = Arc::new(TransactionLog::new(Arc::new(MemoryLogStore::new()), clock.clone()));
    let pitr = Arc::new(PitrEngine::new(backups.clone(), txlog.clone(), PitrConfig::default()));
    let config = OrchestratorConfig {
        plan_path: dir.path().join("recovery-plan.json"),
        maintenance_flag: dir.path().join("maintenance"),
        ..OrchestratorConfig::default()
    };
    let writes = Arc::new(FlagFileWriteControl::new(config.maintenance_flag.clone()));
    let orchestrator = DisasterRecoveryOrchestrator::new(
        &config,
        backups.clone(),
        catalog,
        writes.clone(),
        pitr.clone(),
        clock.clone(),
    );
    ServiceRig {
        dir,
        clock,
        dump,
        backups,
        txlog,
        writes,
        pitr,
        orchestrator,
    }
}
