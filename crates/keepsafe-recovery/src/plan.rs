//! Recovery plans, their status machine, and the plan file.

use crate::error::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStep {
    /// Step id; selects the executor.
    pub id: String,
    /// What the step does.
    pub description: String,
    /// False if an operator must perform it.
    pub automated: bool,
    /// Estimated duration in seconds.
    pub estimated_duration_seconds: u64,
    /// A failure aborts the whole plan.
    pub critical: bool,
    /// Command an operator would run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Plan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created, not started.
    Pending,
    /// Steps are running.
    InProgress,
    /// Every step ran.
    Completed,
    /// A critical step failed.
    Failed,
}

impl PlanStatus {
    fn rank(self) -> u8 {
        match self {
            PlanStatus::Pending => 0,
            PlanStatus::InProgress => 1,
            PlanStatus::Completed | PlanStatus::Failed => 2,
        }
    }

    /// True for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving to `next` goes forward.
    pub fn can_transition_to(self, next: PlanStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::InProgress => write!(f, "in_progress"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Ordered remediation for one detected disaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisasterRecoveryPlan {
    /// Disaster code.
    pub disaster_type: String,
    /// When the disaster was detected.
    pub detected_at: DateTime<Utc>,
    /// Steps in execution order.
    pub steps: Vec<RecoveryStep>,
    /// Sum of step estimates, in seconds.
    pub estimated_total_duration: u64,
    /// Lifecycle state.
    pub status: PlanStatus,
    /// Ids of completed steps, in execution order.
    pub completed_steps: Vec<String>,
    /// Id of the running step, empty when idle.
    pub current_step: String,
    /// Manual steps left for an operator.
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    /// Non-critical steps that failed.
    #[serde(default)]
    pub failed_steps: Vec<String>,
    /// Error that failed the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DisasterRecoveryPlan {
    /// A pending plan.
    pub fn new(disaster_type: &str, detected_at: DateTime<Utc>, steps: Vec<RecoveryStep>) -> Self {
        let estimated_total_duration = steps.iter().map(|s| s.estimated_duration_seconds).sum();
        Self {
            disaster_type: disaster_type.to_string(),
            detected_at,
            steps,
            estimated_total_duration,
            status: PlanStatus::Pending,
            completed_steps: Vec::new(),
            current_step: String::new(),
            skipped_steps: Vec::new(),
            failed_steps: Vec::new(),
            error: None,
        }
    }

    /// Moves the status forward; going back is an error.
    pub fn advance(&mut self, next: PlanStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RecoveryError::InvalidState(format!(
                "plan for {} cannot move from {} to {}",
                self.disaster_type, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Step lookup by id.
    pub fn step(&self, id: &str) -> Option<&RecoveryStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Single-file store for the most recent plan.
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    /// Store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Plan file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the plan file through a temporary file and rename.
    pub async fn save(&self, plan: &DisasterRecoveryPlan) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(plan)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            path = %self.path.display(),
            status = %plan.status,
            current_step = %plan.current_step,
            "plan saved"
        );
        Ok(())
    }

    /// The last saved plan, if any.
    pub async fn load(&self) -> Result<Option<DisasterRecoveryPlan>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn step(id: &str, secs: u64) -> RecoveryStep {
        RecoveryStep {
            id: id.into(),
            description: format!("do {}", id),
            automated: true,
            estimated_duration_seconds: secs,
            critical: true,
            command: None,
        }
    }

    fn plan() -> DisasterRecoveryPlan {
        DisasterRecoveryPlan::new(
            "DATA_LOSS",
            Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap(),
            vec![step("a", 10), step("b", 20)],
        )
    }

    #[test]
    fn test_total_duration_is_sum() {
        assert_eq!(plan().estimated_total_duration, 30);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut p = plan();
        p.advance(PlanStatus::InProgress).unwrap();
        assert!(p.advance(PlanStatus::Pending).is_err());
        assert!(p.advance(PlanStatus::InProgress).is_err());
        p.advance(PlanStatus::Completed).unwrap();
        assert!(p.advance(PlanStatus::Failed).is_err());
        assert!(p.advance(PlanStatus::InProgress).is_err());
        assert_eq!(p.status, PlanStatus::Completed);
    }

    #[test]
    fn test_terminal_states_and_step_lookup() {
        assert!(!PlanStatus::Pending.is_terminal());
        assert!(!PlanStatus::InProgress.is_terminal());
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());

        let p = plan();
        assert_eq!(p.step("b").map(|s| s.estimated_duration_seconds), Some(20));
        assert!(p.step("").is_none());
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(plan()).unwrap();
        assert_eq!(value["disasterType"], "DATA_LOSS");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["currentStep"], "");
        assert_eq!(value["steps"][0]["estimatedDurationSeconds"], 10);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_store_overwrites_and_loads() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path().join("plans").join("current.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut p = plan();
        store.save(&p).await.unwrap();
        p.advance(PlanStatus::InProgress).unwrap();
        p.current_step = "a".into();
        store.save(&p).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, p);
        assert!(!dir.path().join("plans").join("current.json.tmp").exists());
    }
}
