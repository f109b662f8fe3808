//! Database collaborators: the dump/restore utility and the table catalog.
//!
//! Both are traits so the backup service, the recovery engine and the tests
//! can swap the PostgreSQL client tools for in-process fakes.

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Produces and applies full textual dumps.
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Writes a complete dump of `connection` to `dest`.
    async fn dump(&self, connection: &str, dest: &Path) -> Result<()>;

    /// Applies the dump at `src` against `connection`.
    async fn restore(&self, connection: &str, src: &Path) -> Result<()>;
}

/// Read-only view of the application tables.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fails unless the database answers a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Approximate live row count per application table.
    async fn table_row_counts(&self) -> Result<BTreeMap<String, u64>>;

    /// Sum of [`Catalog::table_row_counts`].
    async fn total_rows(&self) -> Result<u64> {
        Ok(self.table_row_counts().await?.values().sum())
    }
}

async fn run(stage: &'static str, mut cmd: Command, timeout: Duration) -> Result<Output> {
    cmd.kill_on_drop(true);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| BackupError::Dump {
            stage,
            msg: format!("timed out after {}s", timeout.as_secs()),
        })?
        .map_err(|e| BackupError::Dump {
            stage,
            msg: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(BackupError::Dump {
            stage,
            msg: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(output)
}

/// `pg_dump` / `psql` driven through child processes.
#[derive(Debug, Clone)]
pub struct PgDumpTool {
    pg_dump: String,
    psql: String,
    timeout: Duration,
}

impl PgDumpTool {
    /// Uses the binaries found on `PATH`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pg_dump: "pg_dump".to_string(),
            psql: "psql".to_string(),
            timeout,
        }
    }

    /// Overrides the binary locations.
    pub fn with_binaries(mut self, pg_dump: &str, psql: &str) -> Self {
        self.pg_dump = pg_dump.to_string();
        self.psql = psql.to_string();
        self
    }
}

#[async_trait]
impl DumpTool for PgDumpTool {
    async fn dump(&self, connection: &str, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.pg_dump);
        cmd.arg("--dbname")
            .arg(connection)
            .arg("--no-owner")
            .arg("--clean")
            .arg("--if-exists")
            .arg("--file")
            .arg(dest);
        debug!(dest = %dest.display(), "running pg_dump");
        run("dump", cmd, self.timeout).await?;
        Ok(())
    }

    async fn restore(&self, connection: &str, src: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.psql);
        cmd.arg("--dbname")
            .arg(connection)
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--quiet")
            .arg("--file")
            .arg(src);
        debug!(src = %src.display(), "running psql restore");
        run("restore", cmd, self.timeout).await?;
        Ok(())
    }
}

/// Table catalog read through `psql -At`.
#[derive(Debug, Clone)]
pub struct PsqlCatalog {
    psql: String,
    connection: String,
    timeout: Duration,
}

const ROW_COUNT_QUERY: &str =
    "SELECT relname, n_live_tup FROM pg_stat_user_tables ORDER BY relname";

impl PsqlCatalog {
    /// Creates a catalog for `connection`.
    pub fn new(connection: &str, timeout: Duration) -> Self {
        Self {
            psql: "psql".to_string(),
            connection: connection.to_string(),
            timeout,
        }
    }

    async fn query(&self, sql: &str) -> Result<String> {
        let mut cmd = Command::new(&self.psql);
        cmd.arg("--dbname")
            .arg(&self.connection)
            .arg("-At")
            .arg("-F")
            .arg("|")
            .arg("-c")
            .arg(sql);
        let output = run("catalog", cmd, self.timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses `name|count` lines as printed by `psql -At -F '|'`.
pub fn parse_row_counts(text: &str) -> BTreeMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let (name, count) = line.split_once('|')?;
            let count = count.trim().parse().ok()?;
            Some((name.trim().to_string(), count))
        })
        .collect()
}

#[async_trait]
impl Catalog for PsqlCatalog {
    async fn ping(&self) -> Result<()> {
        let out = self.query("SELECT 1").await?;
        if out.trim() == "1" {
            Ok(())
        } else {
            Err(BackupError::Dump {
                stage: "catalog",
                msg: format!("unexpected ping reply: {:?}", out.trim()),
            })
        }
    }

    async fn table_row_counts(&self) -> Result<BTreeMap<String, u64>> {
        Ok(parse_row_counts(&self.query(ROW_COUNT_QUERY).await?))
    }
}
