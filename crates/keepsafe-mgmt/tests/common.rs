//! Shared fixtures for command tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use keepsafe_backup::{Catalog, DumpTool, ManualClock, Result};
use keepsafe_mgmt::{Keepsafe, KeepsafeConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Default)]
pub struct ScriptDump {
    pub restores: AtomicUsize,
}

#[async_trait]
impl DumpTool for ScriptDump {
    async fn dump(&self, _connection: &str, dest: &Path) -> Result<()> {
        tokio::fs::write(dest, "BEGIN;\nINSERT INTO points VALUES (1, 10);\nCOMMIT;\n").await?;
        Ok(())
    }

    async fn restore(&self, _connection: &str, _src: &Path) -> Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TwoTables;

#[async_trait]
impl Catalog for TwoTables {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn table_row_counts(&self) -> Result<BTreeMap<String, u64>> {
        Ok([("points".to_string(), 40), ("activities".to_string(), 7)].into())
    }
}

pub struct Env {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub dump: Arc<ScriptDump>,
    pub app: Keepsafe,
}

pub fn config_in(dir: &Path) -> KeepsafeConfig {
    KeepsafeConfig {
        database_url: Some("postgres://keepsafe@localhost/app".into()),
        backup_dir: dir.join("backups"),
        snapshot_dir: dir.join("snapshots"),
        txlog_dir: dir.join("txlog"),
        recovery_plan_path: dir.join("plan.json"),
        maintenance_flag: dir.join("maintenance"),
        ..KeepsafeConfig::default()
    }
}

pub async fn env() -> Env {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 2, 0, 0).unwrap()));
    let dump = Arc::new(ScriptDump::default());
    let app = Keepsafe::with_tools(config_in(dir.path()), dump.clone(), Arc::new(TwoTables), clock.clone())
        .await
        .unwrap();
    Env { dir, clock, dump, app }
}
