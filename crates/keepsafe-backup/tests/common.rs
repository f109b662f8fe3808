//! Shared fixtures for backup integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use keepsafe_backup::{
    BackupConfig, BackupError, BackupService, Catalog, DumpTool, ManualClock, Result,
    RetentionPolicy,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Dump tool that writes a fixed SQL script and counts restores.
#[derive(Default)]
pub struct FakeDump {
    pub dumps: AtomicUsize,
    pub restores: AtomicUsize,
    pub fail_next: AtomicBool,
}

#[async_trait]
impl DumpTool for FakeDump {
    async fn dump(&self, _connection: &str, dest: &Path) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackupError::Dump {
                stage: "dump",
                msg: "server closed the connection".into(),
            });
        }
        let n = self.dumps.fetch_add(1, Ordering::SeqCst);
        let mut script = String::from("BEGIN;\n");
        for i in 0..200 {
            script.push_str(&format!("INSERT INTO points VALUES ({}, {});\n", i, n));
        }
        script.push_str("COMMIT;\n");
        tokio::fs::write(dest, script).await?;
        Ok(())
    }

    async fn restore(&self, _connection: &str, src: &Path) -> Result<()> {
        let body = tokio::fs::read_to_string(src).await?;
        assert!(body.starts_with("BEGIN;"));
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Catalog with a fixed set of tables.
pub struct FakeCatalog;

#[async_trait]
impl Catalog for FakeCatalog {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn table_row_counts(&self) -> Result<BTreeMap<String, u64>> {
        Ok([
            ("users".to_string(), 12),
            ("points".to_string(), 200),
            ("activity".to_string(), 31),
        ]
        .into())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub service: Arc<BackupService>,
    pub clock: Arc<ManualClock>,
    pub dump: Arc<FakeDump>,
}

pub fn harness(retention: RetentionPolicy) -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()));
    let dump = Arc::new(FakeDump::default());
    let config = BackupConfig {
        backup_dir: dir.path().to_path_buf(),
        database_url: Some("postgres://app@localhost/app".into()),
        retention,
        ..BackupConfig::default()
    };
    let service = Arc::new(BackupService::with_clock(
        config,
        dump.clone(),
        Arc::new(FakeCatalog),
        clock.clone(),
    ));
    Harness {
        dir,
        service,
        clock,
        dump,
    }
}
