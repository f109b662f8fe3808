//! Disaster-recovery orchestration: plan creation, execution and self-test.
//!
//! Execution walks the steps in order and saves the plan after every
//! transition. A failing critical step fails the plan and the error goes
//! back to the caller; a failing non-critical step is logged and skipped.
//! A failed plan is not resumed, a new one has to be created.

use crate::actions::StepRunner;
use crate::catalog;
use crate::error::{RecoveryError, Result};
use crate::pitr::PitrEngine;
use crate::plan::{DisasterRecoveryPlan, PlanStatus, PlanStore};
use crate::writes::WriteControl;
use chrono::Duration;
use keepsafe_backup::{BackupKind, Backups, Catalog, Clock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// File holding the most recent plan.
    pub plan_path: PathBuf,
    /// Maintenance flag checked by the application.
    pub maintenance_flag: PathBuf,
    /// How far before detection point-in-time steps rewind, in seconds.
    pub pitr_lookback_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            plan_path: PathBuf::from("/var/lib/keepsafe/recovery-plan.json"),
            maintenance_flag: PathBuf::from("/var/lib/keepsafe/maintenance"),
            pitr_lookback_secs: 300,
        }
    }
}

/// One self-test check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Whether the check passed.
    pub passed: bool,
    /// What was observed.
    pub detail: String,
}

impl CheckResult {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Result of [`DisasterRecoveryOrchestrator::test_disaster_recovery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrTestReport {
    /// Backup followed by verification.
    pub backup_round_trip: CheckResult,
    /// Database ping.
    pub connectivity: CheckResult,
    /// `DATA_LOSS` plan construction.
    pub plan_creation: CheckResult,
    /// True if every check passed.
    pub passed: bool,
}

/// Builds and runs disaster-recovery plans.
pub struct DisasterRecoveryOrchestrator {
    backups: Arc<dyn Backups>,
    catalog: Arc<dyn Catalog>,
    writes: Arc<dyn WriteControl>,
    pitr: Arc<PitrEngine>,
    plans: PlanStore,
    clock: Arc<dyn Clock>,
    lookback: Duration,
}

impl DisasterRecoveryOrchestrator {
    /// Creates an orchestrator saving plans to `config.plan_path`.
    pub fn new(
        config: &OrchestratorConfig,
        backups: Arc<dyn Backups>,
        catalog: Arc<dyn Catalog>,
        writes: Arc<dyn WriteControl>,
        pitr: Arc<PitrEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backups,
            catalog,
            writes,
            pitr,
            plans: PlanStore::new(config.plan_path.clone()),
            clock,
            lookback: Duration::seconds(config.pitr_lookback_secs as i64),
        }
    }

    /// Plan file access.
    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    /// Builds a pending plan without saving it.
    pub fn build_plan(&self, code: &str) -> Result<DisasterRecoveryPlan> {
        let steps = catalog::steps_for(code).ok_or_else(|| RecoveryError::UnknownDisasterType(code.to_string()))?;
        Ok(DisasterRecoveryPlan::new(code, self.clock.now(), steps))
    }

    /// Builds and saves a plan for `code`.
    pub async fn create_recovery_plan(&self, code: &str) -> Result<DisasterRecoveryPlan> {
        let plan = self.build_plan(code)?;
        self.plans.save(&plan).await?;
        info!(
            disaster_type = %code,
            steps = plan.steps.len(),
            estimated_secs = plan.estimated_total_duration,
            "recovery plan created"
        );
        Ok(plan)
    }

    /// Runs `plan` to completion or to its first critical failure.
    ///
    /// With `automated == false`, manual steps are left for an operator and
    /// recorded in `skipped_steps`. With `automated == true` they are
    /// acknowledged and counted complete.
    pub async fn execute_recovery_plan(&self, plan: &mut DisasterRecoveryPlan, automated: bool) -> Result<()> {
        if plan.status.is_terminal() {
            return Err(RecoveryError::InvalidState(format!(
                "plan for {} is {}; create a new plan to retry",
                plan.disaster_type, plan.status
            )));
        }
        if plan.status != PlanStatus::Pending {
            return Err(RecoveryError::InvalidState(format!(
                "plan for {} is already {}",
                plan.disaster_type, plan.status
            )));
        }
        plan.advance(PlanStatus::InProgress)?;
        self.plans.save(plan).await?;
        info!(disaster_type = %plan.disaster_type, automated, "executing recovery plan");

        let mut runner = StepRunner {
            backups: self.backups.as_ref(),
            catalog: self.catalog.as_ref(),
            writes: self.writes.as_ref(),
            pitr: self.pitr.as_ref(),
            detected_at: plan.detected_at,
            lookback: self.lookback,
            emergency_backup: None,
            valid_backup: None,
        };

        for step in plan.steps.clone() {
            if !automated && !step.automated {
                info!(step = %step.id, "manual step left for operator");
                plan.skipped_steps.push(step.id.clone());
                continue;
            }

            plan.current_step = step.id.clone();
            self.plans.save(plan).await?;
            info!(step = %step.id, critical = step.critical, "running step");

            match runner.run(&step).await {
                Ok(()) => {
                    plan.completed_steps.push(step.id.clone());
                    self.plans.save(plan).await?;
                }
                Err(e @ RecoveryError::UnknownStep(_)) => {
                    return self.fail(plan, e).await;
                }
                Err(e) if step.critical => {
                    let e = RecoveryError::StepFailed {
                        step: step.id.clone(),
                        msg: e.to_string(),
                    };
                    return self.fail(plan, e).await;
                }
                Err(e) => {
                    warn!(step = %step.id, error = %e, "non-critical step failed, continuing");
                    plan.failed_steps.push(step.id.clone());
                    self.plans.save(plan).await?;
                }
            }
        }

        plan.advance(PlanStatus::Completed)?;
        plan.current_step.clear();
        self.plans.save(plan).await?;
        info!(
            disaster_type = %plan.disaster_type,
            completed = plan.completed_steps.len(),
            skipped = plan.skipped_steps.len(),
            failed = plan.failed_steps.len(),
            "recovery plan completed"
        );
        Ok(())
    }

    async fn fail(&self, plan: &mut DisasterRecoveryPlan, e: RecoveryError) -> Result<()> {
        error!(disaster_type = %plan.disaster_type, step = %plan.current_step, error = %e, "recovery plan failed");
        plan.advance(PlanStatus::Failed)?;
        plan.error = Some(e.to_string());
        if let Err(save_err) = self.plans.save(plan).await {
            error!(error = %save_err, "could not save failed plan");
        }
        Err(e)
    }

    /// Backup round trip, connectivity and plan construction checks.
    ///
    /// The `DATA_LOSS` plan is built but not saved, so a plan file left by
    /// a real incident is not overwritten.
    pub async fn test_disaster_recovery(&self) -> DrTestReport {
        let backup_round_trip = match self.backups.backup(BackupKind::Full).await {
            Ok(record) => match self.backups.verify_backup(&record.id).await {
                Ok(true) => CheckResult::pass(format!("{} created and verified", record.id)),
                Ok(false) => CheckResult::fail(format!("{} failed verification", record.id)),
                Err(e) => CheckResult::fail(e.to_string()),
            },
            Err(e) => CheckResult::fail(e.to_string()),
        };

        let connectivity = match self.catalog.ping().await {
            Ok(()) => CheckResult::pass("database reachable"),
            Err(e) => CheckResult::fail(e.to_string()),
        };

        let plan_creation = match self.build_plan("DATA_LOSS") {
            Ok(plan) if !plan.steps.is_empty() => {
                CheckResult::pass(format!("{} steps, {}s estimated", plan.steps.len(), plan.estimated_total_duration))
            }
            Ok(_) => CheckResult::fail("plan has no steps"),
            Err(e) => CheckResult::fail(e.to_string()),
        };

        let passed = backup_round_trip.passed && connectivity.passed && plan_creation.passed;
        info!(
            passed,
            backup = backup_round_trip.passed,
            connectivity = connectivity.passed,
            plan = plan_creation.passed,
            "disaster recovery self-test finished"
        );
        DrTestReport {
            backup_round_trip,
            connectivity,
            plan_creation,
            passed,
        }
    }
}
