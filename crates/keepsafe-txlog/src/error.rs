//! Error types for the transaction log.

use thiserror::Error;

/// Result type alias for transaction log operations.
pub type Result<T> = std::result::Result<T, TxLogError>;

/// Errors raised while writing or reading the mutation journal.
#[derive(Debug, Error)]
pub enum TxLogError {
    /// Journal file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An entry could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A complete journal line failed to decode.
    #[error("journal corrupted at line {line}: {msg}")]
    Corrupt {
        /// 1-based line number in the journal file.
        line: usize,
        /// Decoder message.
        msg: String,
    },
}
