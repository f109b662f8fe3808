//! Artifact retention.
//!
//! Retention only ever removes artifacts. Metadata records stay in the index
//! forever as the audit trail of every attempt.

use crate::metadata::BackupMetadata;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Limits applied after every successful backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Artifacts older than this many days are removed.
    pub max_age_days: u32,
    /// At most this many artifacts survive, newest first.
    pub max_backups: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_backups: 30,
        }
    }
}

/// Artifacts selected for removal, by backup id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlan {
    /// Past the age limit.
    pub by_age: Vec<String>,
    /// Beyond the count limit once age cleanup is done, oldest first.
    pub by_count: Vec<String>,
}

impl RetentionPlan {
    /// True when nothing needs removing.
    pub fn is_empty(&self) -> bool {
        self.by_age.is_empty() && self.by_count.is_empty()
    }

    /// All ids in removal order.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.by_age.iter().chain(self.by_count.iter())
    }

    /// Drops `keep` from the plan. The count limit may be exceeded until a
    /// later pass runs without them.
    pub fn sparing(mut self, keep: &HashSet<String>) -> Self {
        self.by_age.retain(|id| !keep.contains(id));
        self.by_count.retain(|id| !keep.contains(id));
        self
    }
}

/// What a cleanup pass actually removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Artifacts removed for age.
    pub removed_by_age: usize,
    /// Artifacts removed for count.
    pub removed_by_count: usize,
}

/// Chooses artifacts to remove.
///
/// `present` holds the ids of records whose artifact is on disk; records
/// without one are ignored, and files without a record are never considered.
pub fn plan_retention(
    records: &[BackupMetadata],
    present: &HashSet<String>,
    now: DateTime<Utc>,
    policy: &RetentionPolicy,
) -> RetentionPlan {
    let cutoff = now - Duration::days(i64::from(policy.max_age_days));

    let mut candidates: Vec<(usize, &BackupMetadata)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_success() && present.contains(&r.id))
        .collect();
    // oldest first; index order breaks timestamp ties
    candidates.sort_by_key(|(i, r)| (r.timestamp, *i));

    let mut plan = RetentionPlan::default();
    let mut survivors = Vec::new();
    for (_, record) in candidates {
        if record.timestamp < cutoff {
            plan.by_age.push(record.id.clone());
        } else {
            survivors.push(record);
        }
    }

    let excess = survivors.len().saturating_sub(policy.max_backups);
    plan.by_count = survivors
        .iter()
        .take(excess)
        .map(|r| r.id.clone())
        .collect();
    plan
}
