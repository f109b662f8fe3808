//! The disaster catalog: six disaster types and their hand-authored steps.

use crate::plan::RecoveryStep;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How bad a disaster is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Service down or data at risk.
    Critical,
    /// Degraded service.
    High,
    /// Limited impact.
    Medium,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
        }
    }
}

/// A catalogued disaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisasterType {
    /// Stable code, e.g. `DB_CORRUPTION`.
    pub code: String,
    /// Human name.
    pub name: String,
    /// Impact class.
    pub severity: Severity,
    /// True if every step can run without an operator.
    pub auto_recoverable: bool,
}

struct StepDef {
    id: &'static str,
    description: &'static str,
    automated: bool,
    secs: u64,
    critical: bool,
    command: Option<&'static str>,
}

const fn auto(id: &'static str, description: &'static str, secs: u64, critical: bool) -> StepDef {
    StepDef {
        id,
        description,
        automated: true,
        secs,
        critical,
        command: None,
    }
}

const fn manual(
    id: &'static str,
    description: &'static str,
    secs: u64,
    critical: bool,
    command: Option<&'static str>,
) -> StepDef {
    StepDef {
        id,
        description,
        automated: false,
        secs,
        critical,
        command,
    }
}

struct Entry {
    code: &'static str,
    name: &'static str,
    severity: Severity,
    auto_recoverable: bool,
    steps: &'static [StepDef],
}

const VERIFY_CONNECTION: StepDef = auto("verify_db_connection", "Verify database connectivity", 30, true);
const STOP_WRITES: StepDef = auto("stop_writes", "Put the application in maintenance mode to stop writes", 10, true);
const EMERGENCY_BACKUP: StepDef = auto("emergency_backup", "Take an emergency backup of the current state", 300, false);
const FIND_BACKUP: StepDef = auto("find_last_valid_backup", "Locate the newest backup that passes verification", 60, true);
const RESTORE: StepDef = auto("restore_backup", "Restore the last valid backup", 1800, true);
const VERIFY_RESTORE: StepDef = auto("verify_restore", "Verify the restored database answers and has tables", 120, true);
const RESUME: StepDef = auto("resume_operations", "Leave maintenance mode and resume writes", 10, true);

const CATALOG: &[Entry] = &[
    Entry {
        code: "DB_CORRUPTION",
        name: "Database corruption",
        severity: Severity::Critical,
        auto_recoverable: true,
        steps: &[VERIFY_CONNECTION, STOP_WRITES, EMERGENCY_BACKUP, FIND_BACKUP, RESTORE, VERIFY_RESTORE, RESUME],
    },
    Entry {
        code: "DATA_LOSS",
        name: "Data loss",
        severity: Severity::Critical,
        auto_recoverable: false,
        steps: &[
            VERIFY_CONNECTION,
            STOP_WRITES,
            EMERGENCY_BACKUP,
            manual(
                "assess_data_loss",
                "Determine which tables and time range lost data",
                600,
                false,
                None,
            ),
            FIND_BACKUP,
            RESTORE,
            VERIFY_RESTORE,
            RESUME,
        ],
    },
    Entry {
        code: "SYSTEM_COMPROMISE",
        name: "System compromise",
        severity: Severity::Critical,
        auto_recoverable: false,
        steps: &[
            manual(
                "isolate_system",
                "Isolate affected hosts from the network",
                600,
                true,
                None,
            ),
            STOP_WRITES,
            auto("emergency_backup", "Preserve current state for forensics", 300, false),
            manual(
                "rotate_credentials",
                "Rotate database and service credentials",
                900,
                true,
                Some("psql \"$DATABASE_URL\" -c \"ALTER ROLE app WITH PASSWORD '<new>'\""),
            ),
            FIND_BACKUP,
            RESTORE,
            VERIFY_RESTORE,
            manual("security_audit", "Audit access logs for the intrusion window", 3600, false, None),
            RESUME,
        ],
    },
    Entry {
        code: "NETWORK_FAILURE",
        name: "Network failure",
        severity: Severity::High,
        auto_recoverable: false,
        steps: &[
            manual(
                "diagnose_network",
                "Check routes and DNS between application and database",
                300,
                false,
                Some("pg_isready -d \"$DATABASE_URL\""),
            ),
            auto("verify_db_connection", "Verify database connectivity is restored", 30, true),
            RESUME,
        ],
    },
    Entry {
        code: "MANUAL_ERROR",
        name: "Operator error",
        severity: Severity::Medium,
        auto_recoverable: false,
        steps: &[
            STOP_WRITES,
            manual(
                "identify_error_scope",
                "Identify the erroneous change and when it happened",
                600,
                false,
                None,
            ),
            auto("emergency_backup", "Back up the current state before rewinding", 300, true),
            auto(
                "point_in_time_recovery",
                "Recover to just before the error was detected",
                900,
                true,
            ),
            VERIFY_RESTORE,
            RESUME,
        ],
    },
    Entry {
        code: "HARDWARE_FAILURE",
        name: "Hardware failure",
        severity: Severity::Critical,
        auto_recoverable: false,
        steps: &[
            manual(
                "provision_hardware",
                "Provision a replacement database host",
                3600,
                true,
                None,
            ),
            VERIFY_CONNECTION,
            FIND_BACKUP,
            RESTORE,
            VERIFY_RESTORE,
            RESUME,
        ],
    },
];

fn entry(code: &str) -> Option<&'static Entry> {
    CATALOG.iter().find(|e| e.code == code)
}

/// Every catalogued disaster type.
pub fn disaster_types() -> Vec<DisasterType> {
    CATALOG
        .iter()
        .map(|e| DisasterType {
            code: e.code.to_string(),
            name: e.name.to_string(),
            severity: e.severity,
            auto_recoverable: e.auto_recoverable,
        })
        .collect()
}

/// Disaster type for `code`.
pub fn disaster_type(code: &str) -> Option<DisasterType> {
    disaster_types().into_iter().find(|t| t.code == code)
}

/// Steps for `code`, in execution order.
pub fn steps_for(code: &str) -> Option<Vec<RecoveryStep>> {
    let entry = entry(code)?;
    Some(
        entry
            .steps
            .iter()
            .map(|s| RecoveryStep {
                id: s.id.to_string(),
                description: s.description.to_string(),
                automated: s.automated,
                estimated_duration_seconds: s.secs,
                critical: s.critical,
                command: s.command.map(str::to_string),
            })
            .collect(),
    )
}
