//! Error types for recovery.

use chrono::{DateTime, Utc};
use keepsafe_backup::BackupError;
use keepsafe_txlog::TxLogError;
use thiserror::Error;

/// Result type alias for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Errors raised by point-in-time recovery and plan execution.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A backup service call failed.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// The transaction log could not be read.
    #[error(transparent)]
    TxLog(#[from] TxLogError),

    /// Disaster code not in the catalog.
    #[error("unknown disaster type: {0}")]
    UnknownDisasterType(String),

    /// No successful backup at or before the target time.
    #[error("no recovery point at or before {target}")]
    NoRecoveryPoint {
        /// Requested recovery time.
        target: DateTime<Utc>,
    },

    /// No successful backup passed verification.
    #[error("no valid backup available")]
    NoValidBackup,

    /// A plan or step was used in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A plan names a step with no executor.
    #[error("no executor for step {0:?}")]
    UnknownStep(String),

    /// A plan step failed.
    #[error("step {step} failed: {msg}")]
    StepFailed {
        /// Step id.
        step: String,
        /// Cause.
        msg: String,
    },

    /// Replaying one log entry failed.
    #[error("replay of entry {entry_id} failed: {msg}")]
    Replay {
        /// Entry id.
        entry_id: String,
        /// Cause.
        msg: String,
    },

    /// Plan file or write-control flag could not be accessed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Plan file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecoveryError {
    /// True for the "nothing found" family: unknown code, backup or recovery point.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RecoveryError::UnknownDisasterType(_)
                | RecoveryError::NoRecoveryPoint { .. }
                | RecoveryError::NoValidBackup
                | RecoveryError::Backup(BackupError::NotFound(_))
        )
    }
}
