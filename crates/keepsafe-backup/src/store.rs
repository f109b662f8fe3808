//! On-disk layout of the backup directory.
//!
//! ```text
//! <dir>/
//!   metadata.json            JSON array of BackupMetadata, append-only by convention
//!   backup.log               one human-readable line per attempt
//!   backup-<ts>.sql.zst      one compressed dump per successful attempt
//! ```

use crate::compression::COMPRESSED_EXT;
use crate::error::Result;
use crate::metadata::BackupMetadata;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Name of the metadata index file.
pub const METADATA_FILE: &str = "metadata.json";
/// Name of the operational log file.
pub const LOG_FILE: &str = "backup.log";

/// Backup directory plus its metadata index and log.
#[derive(Debug)]
pub struct BackupStore {
    dir: PathBuf,
    index_lock: Mutex<()>,
}

impl BackupStore {
    /// Creates a store rooted at `dir`. Nothing is touched until `init`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index_lock: Mutex::new(()),
        }
    }

    /// Creates the directory if missing.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `metadata.json`.
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Path of `backup.log`.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Where the uncompressed dump for `id` is staged.
    pub fn staging_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.sql", id))
    }

    /// Where the compressed artifact for `record` lives.
    pub fn artifact_path(&self, record: &BackupMetadata) -> PathBuf {
        self.dir.join(record.artifact_name())
    }

    /// Reads the metadata index in file order. A missing file is an empty index.
    pub async fn read_index(&self) -> Result<Vec<BackupMetadata>> {
        match fs::read(self.metadata_path()).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one record.
    ///
    /// The index is re-read under the store lock before writing, so appends
    /// from other holders of this store are never lost. The new index replaces
    /// the old one through a rename.
    pub async fn append(&self, record: &BackupMetadata) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut records = self.read_index().await?;
        records.push(record.clone());
        let encoded = serde_json::to_vec_pretty(&records)?;
        let tmp = self.dir.join(format!("{}.tmp", METADATA_FILE));
        fs::write(&tmp, &encoded).await?;
        fs::rename(&tmp, self.metadata_path()).await?;
        debug!(backup_id = %record.id, records = records.len(), "metadata index updated");
        Ok(())
    }

    /// Looks up a record by id.
    pub async fn find(&self, id: &str) -> Result<Option<BackupMetadata>> {
        Ok(self.read_index().await?.into_iter().find(|r| r.id == id))
    }

    /// Appends `[timestamp] STATUS - id (durationMs, sizeMB)` to `backup.log`.
    pub async fn append_log_line(&self, record: &BackupMetadata) -> Result<()> {
        let line = format_log_line(record);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// True if the record's artifact is on disk.
    pub async fn artifact_exists(&self, record: &BackupMetadata) -> bool {
        fs::metadata(self.artifact_path(record)).await.is_ok()
    }

    /// Deletes the record's artifact. Returns false if it was already gone.
    pub async fn remove_artifact(&self, record: &BackupMetadata) -> Result<bool> {
        match fs::remove_file(self.artifact_path(record)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// File names of all compressed artifacts currently in the directory.
    pub async fn list_artifacts(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let suffix = format!(".sql.{}", COMPRESSED_EXT);
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&suffix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Renders one `backup.log` line.
pub fn format_log_line(record: &BackupMetadata) -> String {
    format!(
        "[{}] {} - {} ({}ms, {:.2}MB)\n",
        record.timestamp.to_rfc3339(),
        record.status,
        record.id,
        record.duration_ms,
        record.size_mb()
    )
}
