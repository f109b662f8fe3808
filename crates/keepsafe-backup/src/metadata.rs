//! Backup metadata records and aggregate statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Kind of backup requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Complete dump of the database.
    #[default]
    Full,
    /// Recorded as incremental; the dump itself is still complete.
    Incremental,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

/// Outcome of one backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Artifact written and checksummed.
    Success,
    /// Attempt aborted; no usable artifact.
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStatus::Success => write!(f, "SUCCESS"),
            BackupStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One entry in the metadata index. Appended once per attempt, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    /// Time-derived identifier, also the artifact's file stem.
    pub id: String,
    /// When the attempt started.
    pub timestamp: DateTime<Utc>,
    /// Requested backup kind.
    #[serde(rename = "type")]
    pub kind: BackupKind,
    /// Size of the compressed artifact in bytes.
    pub size_bytes: u64,
    /// Uncompressed dump size in bytes.
    #[serde(default)]
    pub uncompressed_bytes: u64,
    /// SHA-256 of the compressed artifact, lowercase hex.
    pub checksum: String,
    /// Whether the artifact is compressed.
    pub compressed: bool,
    /// Attempt outcome.
    pub status: BackupStatus,
    /// Wall time spent on the attempt.
    pub duration_ms: u64,
    /// Approximate row total across application tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    /// Failure reason for `failed` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupMetadata {
    /// Provisional record created when an attempt starts.
    pub fn started(id: String, timestamp: DateTime<Utc>, kind: BackupKind) -> Self {
        Self {
            id,
            timestamp,
            kind,
            size_bytes: 0,
            uncompressed_bytes: 0,
            checksum: String::new(),
            compressed: true,
            status: BackupStatus::Failed,
            duration_ms: 0,
            record_count: None,
            error: None,
        }
    }

    /// Turns a provisional record into a failure record.
    pub fn into_failed(mut self, error: String, duration_ms: u64) -> Self {
        self.status = BackupStatus::Failed;
        self.size_bytes = 0;
        self.checksum = String::new();
        self.duration_ms = duration_ms;
        self.error = Some(error);
        self
    }

    /// True if the record describes a usable artifact.
    pub fn is_success(&self) -> bool {
        self.status == BackupStatus::Success
    }

    /// Artifact file name inside the backup directory.
    pub fn artifact_name(&self) -> String {
        format!("{}.sql.{}", self.id, crate::compression::COMPRESSED_EXT)
    }

    /// Size in megabytes, for log lines and CLI output.
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Builds a backup id from its start time.
pub fn backup_id_for(timestamp: DateTime<Utc>) -> String {
    format!("backup-{}", timestamp.format("%Y-%m-%dT%H-%M-%S-%3fZ"))
}

/// Like [`backup_id_for`], suffixed `-1`, `-2`, ... while the id is in `taken`.
pub fn unique_backup_id(timestamp: DateTime<Utc>, taken: &HashSet<String>) -> String {
    let base = backup_id_for(timestamp);
    if !taken.contains(&base) {
        return base;
    }
    (1u32..)
        .map(|n| format!("{}-{}", base, n))
        .find(|id| !taken.contains(id))
        .unwrap_or(base)
}

/// Aggregates over the metadata index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    /// Number of records.
    pub total: usize,
    /// Records with status `success`.
    pub successful: usize,
    /// Records with status `failed`.
    pub failed: usize,
    /// Sum of successful artifact sizes.
    pub total_size: u64,
    /// Mean duration of successful attempts.
    pub avg_duration_ms: u64,
    /// Earliest record timestamp.
    pub oldest: Option<DateTime<Utc>>,
    /// Latest record timestamp.
    pub newest: Option<DateTime<Utc>>,
}

impl BackupStats {
    /// Computes stats from any ordering of records.
    pub fn from_records(records: &[BackupMetadata]) -> Self {
        let successful: Vec<&BackupMetadata> = records.iter().filter(|r| r.is_success()).collect();
        let total_size = successful.iter().map(|r| r.size_bytes).sum();
        let avg_duration_ms = if successful.is_empty() {
            0
        } else {
            successful.iter().map(|r| r.duration_ms).sum::<u64>() / successful.len() as u64
        };
        Self {
            total: records.len(),
            successful: successful.len(),
            failed: records.len() - successful.len(),
            total_size,
            avg_duration_ms,
            oldest: records.iter().map(|r| r.timestamp).min(),
            newest: records.iter().map(|r| r.timestamp).max(),
        }
    }
}
