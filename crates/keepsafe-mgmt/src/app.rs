//! Service wiring shared by the CLI commands and the daemon.

use crate::config::KeepsafeConfig;
use keepsafe_backup::{
    BackupScheduler, BackupService, Backups, Catalog, Clock, DumpTool, PgDumpTool, PsqlCatalog, SnapshotJob,
    SystemClock, TableCountSnapshot,
};
use keepsafe_recovery::{DisasterRecoveryOrchestrator, FlagFileWriteControl, PitrEngine};
use keepsafe_txlog::TransactionLog;
use std::sync::Arc;
use tracing::debug;

/// The assembled subsystem.
pub struct Keepsafe {
    /// Effective configuration.
    pub config: KeepsafeConfig,
    /// Backup service.
    pub backups: Arc<BackupService>,
    /// Database catalog used for pings and row counts.
    pub catalog: Arc<dyn Catalog>,
    /// Transaction journal.
    pub txlog: Arc<TransactionLog>,
    /// Point-in-time recovery.
    pub pitr: Arc<PitrEngine>,
    /// Disaster-recovery plans.
    pub orchestrator: DisasterRecoveryOrchestrator,
    clock: Arc<dyn Clock>,
}

impl Keepsafe {
    /// Wires the services against PostgreSQL through `pg_dump` and `psql`.
    pub async fn open(config: KeepsafeConfig) -> anyhow::Result<Self> {
        let timeout = config.dump_timeout();
        let connection = config.database_url.clone().unwrap_or_default();
        let dump: Arc<dyn DumpTool> = Arc::new(PgDumpTool::new(timeout));
        let catalog: Arc<dyn Catalog> = Arc::new(PsqlCatalog::new(&connection, timeout));
        Self::with_tools(config, dump, catalog, Arc::new(SystemClock)).await
    }

    /// Wires the services against the given database tools.
    pub async fn with_tools(
        config: KeepsafeConfig,
        dump: Arc<dyn DumpTool>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let backups = Arc::new(BackupService::with_clock(
            config.backup_config(),
            dump,
            catalog.clone(),
            clock.clone(),
        ));
        let txlog = Arc::new(TransactionLog::open_with_clock(&config.txlog_config(), clock.clone()).await?);
        let as_backups: Arc<dyn Backups> = backups.clone();
        let pitr = Arc::new(PitrEngine::new(as_backups.clone(), txlog.clone(), config.pitr_config()));
        let orchestrator = DisasterRecoveryOrchestrator::new(
            &config.orchestrator_config(),
            as_backups,
            catalog.clone(),
            Arc::new(FlagFileWriteControl::new(config.maintenance_flag.clone())),
            pitr.clone(),
            clock.clone(),
        );
        debug!(
            backup_dir = %config.backup_dir.display(),
            txlog_dir = %config.txlog_dir.display(),
            "services wired"
        );
        Ok(Self {
            config,
            backups,
            catalog,
            txlog,
            pitr,
            orchestrator,
            clock,
        })
    }

    /// Scheduler running the full backup and both snapshot jobs.
    pub fn scheduler(&self) -> BackupScheduler {
        let points: Arc<dyn SnapshotJob> = Arc::new(self.snapshot_job("points", &self.config.points_tables));
        let activity: Arc<dyn SnapshotJob> = Arc::new(self.snapshot_job("activity", &self.config.activity_tables));
        BackupScheduler::with_clock(
            self.config.schedule_config(),
            self.backups.clone(),
            points,
            activity,
            self.clock.clone(),
        )
    }

    /// Table-count snapshot job writing under the configured snapshot dir.
    pub fn snapshot_job(&self, label: &str, tables: &[String]) -> TableCountSnapshot {
        TableCountSnapshot::new(
            label,
            tables.to_vec(),
            self.config.snapshot_dir.clone(),
            self.catalog.clone(),
            self.clock.clone(),
        )
    }
}
