//! Daemon and CLI configuration: a TOML or JSON file, then environment overrides.

use keepsafe_backup::compression::CompressionConfig;
use keepsafe_backup::{BackupConfig, RetentionPolicy, ScheduleConfig};
use keepsafe_recovery::{OrchestratorConfig, PitrConfig};
use keepsafe_txlog::TxLogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Everything the `keepsafe` binary needs to build its services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepsafeConfig {
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// Artifact and metadata directory.
    pub backup_dir: PathBuf,
    /// Artifacts older than this are removed by retention.
    pub retention_days: u32,
    /// Artifacts kept at most.
    pub max_backups: usize,
    /// Zstd level for artifacts.
    pub compression_level: i32,
    /// Timeout for each pg_dump, psql restore or catalog query.
    pub dump_timeout_secs: u64,
    /// Cron expression of the full backup job.
    pub backup_schedule: String,
    /// Cron expression of the points snapshot job.
    pub points_snapshot_schedule: String,
    /// Cron expression of the activity snapshot job.
    pub activity_snapshot_schedule: String,
    /// Where table-count snapshots are written.
    pub snapshot_dir: PathBuf,
    /// Tables counted by the points snapshot.
    pub points_tables: Vec<String>,
    /// Tables counted by the activity snapshot.
    pub activity_tables: Vec<String>,
    /// Transaction journal directory.
    pub txlog_dir: PathBuf,
    /// File holding the most recent recovery plan.
    pub recovery_plan_path: PathBuf,
    /// Maintenance flag file toggled by stop_writes and resume_operations.
    pub maintenance_flag: PathBuf,
    /// How far before detection point-in-time steps rewind.
    pub pitr_lookback_secs: u64,
    /// Log line format.
    pub log_format: LogFormat,
}

impl Default for KeepsafeConfig {
    fn default() -> Self {
        let schedules = ScheduleConfig::default();
        let orchestrator = OrchestratorConfig::default();
        Self {
            database_url: None,
            backup_dir: PathBuf::from("/var/lib/keepsafe/backups"),
            retention_days: 30,
            max_backups: 30,
            compression_level: CompressionConfig::default().level,
            dump_timeout_secs: 3600,
            backup_schedule: schedules.backup,
            points_snapshot_schedule: schedules.points_snapshot,
            activity_snapshot_schedule: schedules.activity_snapshot,
            snapshot_dir: PathBuf::from("/var/lib/keepsafe/snapshots"),
            points_tables: vec!["points".into(), "point_transactions".into()],
            activity_tables: vec!["activities".into(), "activity_logs".into()],
            txlog_dir: TxLogConfig::default().dir,
            recovery_plan_path: orchestrator.plan_path,
            maintenance_flag: orchestrator.maintenance_flag,
            pitr_lookback_secs: orchestrator.pitr_lookback_secs,
            log_format: LogFormat::Text,
        }
    }
}

impl KeepsafeConfig {
    /// Parses a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: KeepsafeConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: KeepsafeConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Reads `path` if it exists, then applies environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides fields from variables returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        fn number<T: std::str::FromStr>(key: &str, value: String) -> anyhow::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a number, got {:?}", key, value))
        }

        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("BACKUP_DIR") {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_RETENTION_DAYS") {
            self.retention_days = number("BACKUP_RETENTION_DAYS", v)?;
        }
        if let Some(v) = lookup("BACKUP_MAX_COUNT") {
            self.max_backups = number("BACKUP_MAX_COUNT", v)?;
        }
        if let Some(v) = lookup("DUMP_TIMEOUT_SECS") {
            self.dump_timeout_secs = number("DUMP_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("BACKUP_SCHEDULE") {
            self.backup_schedule = v;
        }
        if let Some(v) = lookup("POINTS_SNAPSHOT_SCHEDULE") {
            self.points_snapshot_schedule = v;
        }
        if let Some(v) = lookup("ACTIVITY_SNAPSHOT_SCHEDULE") {
            self.activity_snapshot_schedule = v;
        }
        if let Some(v) = lookup("TXLOG_DIR") {
            self.txlog_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RECOVERY_PLAN_PATH") {
            self.recovery_plan_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.log_format = match v.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "" => LogFormat::Text,
                other => anyhow::bail!("LOG_FORMAT must be text or json, got {:?}", other),
            };
        }
        Ok(())
    }

    /// Per-command timeout for database tools.
    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }

    /// Settings for [`keepsafe_backup::BackupService`].
    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            backup_dir: self.backup_dir.clone(),
            database_url: self.database_url.clone(),
            retention: RetentionPolicy {
                max_age_days: self.retention_days,
                max_backups: self.max_backups,
            },
            compression: CompressionConfig {
                level: self.compression_level,
            },
        }
    }

    /// Cron expressions for the scheduler.
    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            backup: self.backup_schedule.clone(),
            points_snapshot: self.points_snapshot_schedule.clone(),
            activity_snapshot: self.activity_snapshot_schedule.clone(),
        }
    }

    /// Journal location.
    pub fn txlog_config(&self) -> TxLogConfig {
        TxLogConfig {
            dir: self.txlog_dir.clone(),
        }
    }

    /// Recovery cost model.
    pub fn pitr_config(&self) -> PitrConfig {
        PitrConfig::default()
    }

    /// Plan file, maintenance flag and lookback.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            plan_path: self.recovery_plan_path.clone(),
            maintenance_flag: self.maintenance_flag.clone(),
            pitr_lookback_secs: self.pitr_lookback_secs,
        }
    }
}
