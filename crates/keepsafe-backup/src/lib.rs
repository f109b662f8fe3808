#![warn(missing_docs)]

//! Keepsafe backup subsystem: database dumps, zstd artifacts, checksums,
//! retention, state snapshots and cron scheduling.

pub mod checksum;
pub mod clock;
pub mod compression;
pub mod cron;
pub mod db;
pub mod error;
pub mod metadata;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::CronSchedule;
pub use db::{Catalog, DumpTool, PgDumpTool, PsqlCatalog};
pub use error::{BackupError, Result};
pub use metadata::{BackupKind, BackupMetadata, BackupStats, BackupStatus};
pub use retention::{RetentionPolicy, RetentionReport};
pub use scheduler::{BackupScheduler, JobKind, JobStats, ScheduleConfig};
pub use service::{BackupConfig, BackupService, Backups};
pub use snapshot::{SnapshotJob, StateSnapshot, TableCountSnapshot};
pub use store::BackupStore;
