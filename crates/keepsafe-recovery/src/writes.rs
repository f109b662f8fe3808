//! Stopping and resuming application writes during recovery.

use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::info;

/// Switches the application in and out of maintenance mode.
#[async_trait]
pub trait WriteControl: Send + Sync {
    /// Stops application writes. Stopping twice is not an error.
    async fn stop_writes(&self) -> Result<()>;

    /// Resumes application writes. Resuming twice is not an error.
    async fn resume_writes(&self) -> Result<()>;

    /// True while writes are stopped.
    async fn writes_stopped(&self) -> Result<bool>;
}

/// Maintenance mode signalled by the presence of a flag file the
/// application checks before writing.
#[derive(Debug, Clone)]
pub struct FlagFileWriteControl {
    path: PathBuf,
}

impl FlagFileWriteControl {
    /// Flag at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Flag file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WriteControl for FlagFileWriteControl {
    async fn stop_writes(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, format!("maintenance since {}\n", Utc::now().to_rfc3339())).await?;
        info!(flag = %self.path.display(), "writes stopped");
        Ok(())
    }

    async fn resume_writes(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(flag = %self.path.display(), "writes resumed");
        Ok(())
    }

    async fn writes_stopped(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }
}
