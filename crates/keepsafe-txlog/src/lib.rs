#![warn(missing_docs)]

//! Keepsafe transaction log: an append-only journal of row mutations that
//! point-in-time recovery replays on top of a base backup.

pub mod entry;
pub mod error;
pub mod service;
pub mod store;

pub use entry::{Mutation, Operation, OperationCounts, TransactionLogEntry, STANDALONE_TX};
pub use error::{Result, TxLogError};
pub use service::{TransactionLog, TxLogConfig, TxLogStats};
pub use store::{JsonlLogStore, LogStore, MemoryLogStore};
