//! Step executors, dispatched by step id.

use crate::error::{RecoveryError, Result};
use crate::pitr::PitrEngine;
use crate::plan::RecoveryStep;
use crate::writes::WriteControl;
use chrono::{DateTime, Duration, Utc};
use keepsafe_backup::{BackupKind, Backups, Catalog};
use tracing::{info, warn};

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Ping the database.
    VerifyConnection,
    /// Enter maintenance mode.
    StopWrites,
    /// Back up the current state.
    EmergencyBackup,
    /// Pick the newest backup that verifies.
    FindLastValidBackup,
    /// Restore the chosen backup.
    RestoreBackup,
    /// Check the restored database answers and has tables.
    VerifyRestore,
    /// Recover to shortly before detection.
    PointInTimeRecovery,
    /// Leave maintenance mode.
    ResumeOperations,
    /// Operator work; logged for follow-up.
    Acknowledge,
}

const ACTIONS: &[(&str, StepAction)] = &[
    ("verify_db_connection", StepAction::VerifyConnection),
    ("stop_writes", StepAction::StopWrites),
    ("emergency_backup", StepAction::EmergencyBackup),
    ("find_last_valid_backup", StepAction::FindLastValidBackup),
    ("restore_backup", StepAction::RestoreBackup),
    ("verify_restore", StepAction::VerifyRestore),
    ("point_in_time_recovery", StepAction::PointInTimeRecovery),
    ("resume_operations", StepAction::ResumeOperations),
    ("assess_data_loss", StepAction::Acknowledge),
    ("isolate_system", StepAction::Acknowledge),
    ("rotate_credentials", StepAction::Acknowledge),
    ("security_audit", StepAction::Acknowledge),
    ("diagnose_network", StepAction::Acknowledge),
    ("identify_error_scope", StepAction::Acknowledge),
    ("provision_hardware", StepAction::Acknowledge),
];

impl StepAction {
    /// Executor for a step id.
    pub fn for_step(id: &str) -> Option<StepAction> {
        ACTIONS.iter().find(|(step, _)| *step == id).map(|(_, a)| *a)
    }
}

/// Collaborators and per-run state shared by the steps of one plan.
pub(crate) struct StepRunner<'a> {
    pub backups: &'a dyn Backups,
    pub catalog: &'a dyn Catalog,
    pub writes: &'a dyn WriteControl,
    pub pitr: &'a PitrEngine,
    pub detected_at: DateTime<Utc>,
    pub lookback: Duration,
    pub emergency_backup: Option<String>,
    pub valid_backup: Option<String>,
}

impl StepRunner<'_> {
    pub async fn run(&mut self, step: &RecoveryStep) -> Result<()> {
        let action = StepAction::for_step(&step.id).ok_or_else(|| RecoveryError::UnknownStep(step.id.clone()))?;
        match action {
            StepAction::VerifyConnection => {
                self.catalog.ping().await?;
            }
            StepAction::StopWrites => self.writes.stop_writes().await?,
            StepAction::ResumeOperations => self.writes.resume_writes().await?,
            StepAction::EmergencyBackup => {
                // restore candidates must survive the retention pass
                let keep: Vec<String> = self
                    .backups
                    .list_backups()
                    .await?
                    .into_iter()
                    .filter(|r| r.is_success())
                    .map(|r| r.id)
                    .collect();
                let record = self.backups.backup_retaining(BackupKind::Full, &keep).await?;
                info!(step = %step.id, backup_id = %record.id, protected = keep.len(), "emergency backup taken");
                self.emergency_backup = Some(record.id);
            }
            StepAction::FindLastValidBackup => {
                let id = self.find_valid_backup().await?;
                info!(step = %step.id, backup_id = %id, "last valid backup located");
                self.valid_backup = Some(id);
            }
            StepAction::RestoreBackup => {
                let id = match self.valid_backup.clone() {
                    Some(id) => id,
                    None => self.find_valid_backup().await?,
                };
                self.backups.restore(&id, None).await?;
            }
            StepAction::VerifyRestore => {
                self.catalog.ping().await?;
                let tables = self.catalog.table_row_counts().await?;
                if tables.is_empty() {
                    return Err(RecoveryError::StepFailed {
                        step: step.id.clone(),
                        msg: "restored database has no tables".into(),
                    });
                }
                info!(step = %step.id, tables = tables.len(), "restore verified");
            }
            StepAction::PointInTimeRecovery => {
                let target = self.detected_at - self.lookback;
                let outcome = self.pitr.recover_to_point(target, false).await?;
                info!(
                    step = %step.id,
                    target = %target,
                    backup_id = %outcome.recovery_point.backup_id,
                    replayed = outcome.replayed,
                    skipped = outcome.skipped,
                    "point-in-time recovery applied"
                );
            }
            StepAction::Acknowledge => {
                warn!(
                    step = %step.id,
                    description = %step.description,
                    command = step.command.as_deref().unwrap_or(""),
                    "manual step acknowledged; operator follow-up required"
                );
            }
        }
        Ok(())
    }

    async fn find_valid_backup(&self) -> Result<String> {
        for record in self.backups.list_backups().await?.into_iter().filter(|r| r.is_success()) {
            // the emergency backup holds the damaged state
            if self.emergency_backup.as_deref() == Some(record.id.as_str()) {
                continue;
            }
            if self.backups.verify_backup(&record.id).await? {
                return Ok(record.id);
            }
            warn!(backup_id = %record.id, "backup failed verification, trying older one");
        }
        Err(RecoveryError::NoValidBackup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(StepAction::for_step("restore_backup"), Some(StepAction::RestoreBackup));
        assert_eq!(StepAction::for_step("provision_hardware"), Some(StepAction::Acknowledge));
        assert_eq!(StepAction::for_step("reboot_universe"), None);
    }
}
