//! Error types for the backup subsystem.

use thiserror::Error;

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors raised by the backup service, store, and scheduler.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Filesystem error while handling artifacts or the metadata index.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external dump/restore process failed.
    #[error("{stage} failed: {msg}")]
    Dump {
        /// Which stage failed ("dump", "restore", "catalog").
        stage: &'static str,
        /// Process output or error description.
        msg: String,
    },

    /// Artifact checksum does not match the recorded one.
    #[error("checksum mismatch for backup {backup_id}: expected {expected}, actual {actual}")]
    Integrity {
        /// The backup whose artifact is corrupt.
        backup_id: String,
        /// Checksum stored in the metadata index.
        expected: String,
        /// Checksum recomputed from disk.
        actual: String,
    },

    /// No backup with this id in the metadata index.
    #[error("backup not found: {0}")]
    NotFound(String),

    /// Operation not allowed for the backup in its current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Metadata index could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// zstd stream failed to encode or decode.
    #[error("compression error: {0}")]
    Compression(String),

    /// Cron expression could not be parsed.
    #[error("invalid schedule {expr:?}: {reason}")]
    InvalidSchedule {
        /// The offending expression.
        expr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Task(e.to_string())
    }
}

impl BackupError {
    /// True for corruption findings that must never be retried.
    pub fn is_integrity(&self) -> bool {
        matches!(self, BackupError::Integrity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BackupError = std_err.into();
        assert!(matches!(err, BackupError::Io(_)));
    }

    #[test]
    fn test_integrity_display() {
        let err = BackupError::Integrity {
            backup_id: "backup-1".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(err.is_integrity());
        assert_eq!(
            err.to_string(),
            "checksum mismatch for backup backup-1: expected aa, actual bb"
        );
    }

    #[test]
    fn test_dump_display() {
        let err = BackupError::Dump {
            stage: "dump",
            msg: "exit status 1".to_string(),
        };
        assert_eq!(err.to_string(), "dump failed: exit status 1");
        assert!(!err.is_integrity());
    }
}
