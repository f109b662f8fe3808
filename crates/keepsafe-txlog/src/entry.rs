//! Mutation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Transaction id used for entries logged with no transaction open.
pub const STANDALONE_TX: &str = "standalone";

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Row created.
    Insert,
    /// Row changed.
    Update,
    /// Row removed.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A mutation as reported by the caller, before the log stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Kind of change.
    pub operation: Operation,
    /// Table the row lives in.
    pub table: String,
    /// Primary key of the row.
    pub record_id: String,
    /// Row before the change; absent for inserts.
    pub before_data: Option<Value>,
    /// Row after the change; absent for deletes.
    pub after_data: Option<Value>,
    /// Acting user, if known.
    pub user_id: Option<String>,
}

impl Mutation {
    /// A row insert.
    pub fn insert(table: &str, record_id: &str, after: Value) -> Self {
        Self::new(Operation::Insert, table, record_id, None, Some(after))
    }

    /// A row update.
    pub fn update(table: &str, record_id: &str, before: Value, after: Value) -> Self {
        Self::new(Operation::Update, table, record_id, Some(before), Some(after))
    }

    /// A row delete.
    pub fn delete(table: &str, record_id: &str, before: Value) -> Self {
        Self::new(Operation::Delete, table, record_id, Some(before), None)
    }

    fn new(
        operation: Operation,
        table: &str,
        record_id: &str,
        before_data: Option<Value>,
        after_data: Option<Value>,
    ) -> Self {
        Self {
            operation,
            table: table.to_string(),
            record_id: record_id.to_string(),
            before_data,
            after_data,
            user_id: None,
        }
    }

    /// Attributes the mutation to a user.
    pub fn by_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
}

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogEntry {
    /// Unique entry id.
    pub id: String,
    /// When the mutation was logged.
    pub timestamp: DateTime<Utc>,
    /// Kind of change.
    pub operation: Operation,
    /// Table the row lives in.
    pub table: String,
    /// Primary key of the row.
    pub record_id: String,
    /// Row before the change.
    pub before_data: Option<Value>,
    /// Row after the change.
    pub after_data: Option<Value>,
    /// Acting user, if known.
    pub user_id: Option<String>,
    /// Logical transaction the entry belongs to.
    pub tx_id: String,
}

impl TransactionLogEntry {
    /// Stamps a mutation with an id, time and transaction.
    pub fn from_mutation(mutation: Mutation, tx_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            operation: mutation.operation,
            table: mutation.table,
            record_id: mutation.record_id,
            before_data: mutation.before_data,
            after_data: mutation.after_data,
            user_id: mutation.user_id,
            tx_id: tx_id.to_string(),
        }
    }
}

/// Entry counts per operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    /// INSERT entries.
    pub inserts: u64,
    /// UPDATE entries.
    pub updates: u64,
    /// DELETE entries.
    pub deletes: u64,
}

impl OperationCounts {
    /// Counts the operations of `entries`.
    pub fn tally<'a>(entries: impl IntoIterator<Item = &'a TransactionLogEntry>) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.operation {
                Operation::Insert => counts.inserts += 1,
                Operation::Update => counts.updates += 1,
                Operation::Delete => counts.deletes += 1,
            }
        }
        counts
    }

    /// Sum over all kinds.
    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}
