//! Table-count state snapshots.
//!
//! A snapshot records the live row count of a fixed list of tables. Two
//! snapshots can be compared to spot tables whose size changed. This is a
//! deliberately coarse signal: equal counts do not imply equal contents.

use crate::clock::Clock;
use crate::db::Catalog;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A periodic job the scheduler can run.
#[async_trait]
pub trait SnapshotJob: Send + Sync {
    /// Short label used in logs and file names.
    fn label(&self) -> &str;

    /// Runs the job once.
    async fn run(&self) -> Result<()>;
}

/// One persisted table-count snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Job label, e.g. `points` or `activity`.
    pub label: String,
    /// When the counts were read.
    pub taken_at: DateTime<Utc>,
    /// Row count per table. Tables missing from the database are absent.
    pub table_counts: BTreeMap<String, u64>,
}

/// A table whose count differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDrift {
    /// Table name.
    pub table: String,
    /// Count in the earlier snapshot.
    pub before: Option<u64>,
    /// Count in the later snapshot.
    pub after: Option<u64>,
}

/// Lists tables whose counts differ between `before` and `after`.
pub fn compare_snapshots(before: &StateSnapshot, after: &StateSnapshot) -> Vec<CountDrift> {
    let mut tables: Vec<&String> = before
        .table_counts
        .keys()
        .chain(after.table_counts.keys())
        .collect();
    tables.sort();
    tables.dedup();
    tables
        .into_iter()
        .filter_map(|table| {
            let b = before.table_counts.get(table).copied();
            let a = after.table_counts.get(table).copied();
            (a != b).then(|| CountDrift {
                table: table.clone(),
                before: b,
                after: a,
            })
        })
        .collect()
}

/// Writes table-count snapshots of selected tables to a directory.
pub struct TableCountSnapshot {
    label: String,
    tables: Vec<String>,
    dir: PathBuf,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
}

impl TableCountSnapshot {
    /// Creates a job snapshotting `tables` into `dir`.
    pub fn new(
        label: &str,
        tables: Vec<String>,
        dir: impl Into<PathBuf>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            label: label.to_string(),
            tables,
            dir: dir.into(),
            catalog,
            clock,
        }
    }

    /// Reads the counts without persisting them.
    pub async fn capture(&self) -> Result<StateSnapshot> {
        let all = self.catalog.table_row_counts().await?;
        let table_counts = if self.tables.is_empty() {
            all
        } else {
            all.into_iter()
                .filter(|(name, _)| self.tables.iter().any(|t| t == name))
                .collect()
        };
        Ok(StateSnapshot {
            label: self.label.clone(),
            taken_at: self.clock.now(),
            table_counts,
        })
    }

    /// Reads every snapshot this job has written, oldest first.
    pub async fn history(&self) -> Result<Vec<StateSnapshot>> {
        let mut snapshots = Vec::new();
        let prefix = format!("{}-", self.label);
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                let bytes = tokio::fs::read(entry.path()).await?;
                snapshots.push(serde_json::from_slice::<StateSnapshot>(&bytes)?);
            }
        }
        snapshots.sort_by_key(|s| s.taken_at);
        Ok(snapshots)
    }
}

#[async_trait]
impl SnapshotJob for TableCountSnapshot {
    fn label(&self) -> &str {
        &self.label
    }

    async fn run(&self) -> Result<()> {
        let snapshot = self.capture().await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(
            "{}-{}.json",
            self.label,
            snapshot.taken_at.format("%Y%m%dT%H%M%S%3fZ")
        ));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;
        debug!(path = %path.display(), "snapshot written");
        info!(
            label = %self.label,
            tables = snapshot.table_counts.len(),
            rows = snapshot.table_counts.values().sum::<u64>(),
            "state snapshot taken"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Counts(Mutex<BTreeMap<String, u64>>);

    #[async_trait]
    impl Catalog for Counts {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn table_row_counts(&self) -> Result<BTreeMap<String, u64>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn counts(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_capture_filters_tables() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Counts(Mutex::new(counts(&[("points", 5), ("users", 2), ("activity", 9)]))));
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(0, 0).unwrap()));
        let job = TableCountSnapshot::new("points", vec!["points".into(), "users".into()], dir.path(), catalog, clock);
        let snap = job.capture().await.unwrap();
        assert_eq!(snap.table_counts, counts(&[("points", 5), ("users", 2)]));
    }

    #[tokio::test]
    async fn test_run_persists_history() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Counts(Mutex::new(counts(&[("activity", 1)]))));
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let job = TableCountSnapshot::new("activity", vec![], dir.path(), catalog.clone(), clock.clone());
        job.run().await.unwrap();
        catalog.0.lock().unwrap().insert("activity".into(), 4);
        clock.advance(Duration::hours(24));
        job.run().await.unwrap();

        let history = job.history().await.unwrap();
        assert_eq!(history.len(), 2);
        let drift = compare_snapshots(&history[0], &history[1]);
        assert_eq!(
            drift,
            vec![CountDrift {
                table: "activity".into(),
                before: Some(1),
                after: Some(4),
            }]
        );
    }

    #[test]
    fn test_compare_reports_added_and_dropped_tables() {
        let t = Utc.timestamp_opt(0, 0).unwrap();
        let before = StateSnapshot {
            label: "x".into(),
            taken_at: t,
            table_counts: counts(&[("a", 1), ("b", 2)]),
        };
        let after = StateSnapshot {
            label: "x".into(),
            taken_at: t,
            table_counts: counts(&[("b", 2), ("c", 3)]),
        };
        let drift = compare_snapshots(&before, &after);
        assert_eq!(drift.len(), 2);
        assert_eq!(drift[0].table, "a");
        assert_eq!(drift[0].after, None);
        assert_eq!(drift[1].table, "c");
        assert_eq!(drift[1].before, None);
    }
}
