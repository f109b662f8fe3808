#![warn(missing_docs)]

//! Keepsafe recovery: point-in-time recovery from a base backup plus the
//! transaction log, and disaster-recovery plans built from a static catalog.

pub mod actions;
pub mod catalog;
pub mod error;
pub mod orchestrator;
pub mod pitr;
pub mod plan;
pub mod writes;

pub use catalog::{disaster_type, disaster_types, DisasterType, Severity};
pub use error::{RecoveryError, Result};
pub use orchestrator::{CheckResult, DisasterRecoveryOrchestrator, DrTestReport, OrchestratorConfig};
pub use pitr::{
    LoggingReplayTarget, PitrConfig, PitrEngine, RecoveryOutcome, RecoveryPoint, RecoveryPointLag,
    RecoveryTestReport, ReplayTarget,
};
pub use plan::{DisasterRecoveryPlan, PlanStatus, PlanStore, RecoveryStep};
pub use writes::{FlagFileWriteControl, WriteControl};
