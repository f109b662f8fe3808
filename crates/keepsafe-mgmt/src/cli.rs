//! The `keepsafe` operator CLI.

use crate::app::Keepsafe;
use crate::config::KeepsafeConfig;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use keepsafe_backup::{BackupKind, Backups, JobKind};
use keepsafe_recovery::{disaster_types, DisasterRecoveryPlan, PlanStatus};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "keepsafe")]
#[command(about = "Backups, point-in-time recovery and disaster recovery", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json); defaults apply if it is missing.
    #[arg(short, long, env = "KEEPSAFE_CONFIG", default_value = "/etc/keepsafe/keepsafe.toml")]
    pub config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Command {
    /// Take a backup now.
    Backup {
        /// `full` or `incremental`.
        #[arg(short = 't', long = "type", default_value = "full")]
        kind: BackupKind,
    },
    /// Restore a backup into the configured or given database.
    Restore {
        /// Backup id.
        id: String,
        /// Connection string to restore into instead of the configured one.
        #[arg(long)]
        target: Option<String>,
    },
    /// List backups, newest first.
    List,
    /// Recompute a backup's checksum; exits non-zero on mismatch.
    Verify {
        /// Backup id.
        id: String,
    },
    /// Aggregate backup statistics.
    Stats,
    /// Apply the retention policy now.
    Cleanup,
    /// Point-in-time recovery.
    Pitr {
        #[command(subcommand)]
        cmd: PitrCmd,
    },
    /// Disaster recovery.
    Dr {
        #[command(subcommand)]
        cmd: DrCmd,
    },
    /// Transaction journal.
    Txlog {
        #[command(subcommand)]
        cmd: TxlogCmd,
    },
    /// Run one scheduled job immediately.
    Run {
        /// `full_backup`, `points_snapshot` or `activity_snapshot`.
        #[arg(value_parser = parse_job)]
        job: JobKind,
    },
    /// Run the scheduler until interrupted.
    Serve,
}

/// `keepsafe pitr ...`
#[derive(Subcommand, Clone)]
pub enum PitrCmd {
    /// Show the base backup and log window for a target time.
    Find {
        /// RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
        #[arg(value_parser = parse_time)]
        target: DateTime<Utc>,
    },
    /// Recover the database to a target time.
    Recover {
        /// RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
        #[arg(value_parser = parse_time)]
        target: DateTime<Utc>,
        /// Report what would happen without changing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check a target time is recoverable without changing anything.
    Test {
        /// RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
        #[arg(value_parser = parse_time)]
        target: DateTime<Utc>,
    },
    /// Recent backups and how much log has accumulated since each.
    Points {
        /// Rows to show.
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

/// `keepsafe dr ...`
#[derive(Subcommand, Clone)]
pub enum DrCmd {
    /// List catalogued disaster types.
    Types,
    /// Create and save a plan without running it.
    Plan {
        /// Disaster code, e.g. `DB_CORRUPTION`.
        code: String,
    },
    /// Create a plan and run it.
    Execute {
        /// Disaster code, e.g. `DB_CORRUPTION`.
        code: String,
        /// Acknowledge manual steps instead of leaving them for an operator.
        #[arg(long)]
        automated: bool,
    },
    /// Show the last saved plan.
    Status,
    /// Backup, connectivity and plan self-test.
    Test,
}

/// `keepsafe txlog ...`
#[derive(Subcommand, Clone)]
pub enum TxlogCmd {
    /// Journal statistics.
    Stats,
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DD HH:MM:SS` read as UTC.
pub fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc())
        .map_err(|_| format!("invalid time {:?}: expected RFC 3339 or YYYY-MM-DD HH:MM:SS", s))
}

fn parse_job(s: &str) -> std::result::Result<JobKind, String> {
    JobKind::ALL
        .into_iter()
        .find(|k| k.to_string() == s)
        .ok_or_else(|| format!("unknown job {:?}", s))
}

impl Cli {
    /// Wires the services from `config` and runs the command.
    pub async fn run(self, config: KeepsafeConfig) -> Result<()> {
        let app = Keepsafe::open(config).await?;
        self.command.execute(&app, self.json).await
    }
}

impl Command {
    /// Runs the command against wired services.
    pub async fn execute(self, app: &Keepsafe, json: bool) -> Result<()> {
        match self {
            Command::Backup { kind } => {
                let record = app.backups.backup(kind).await?;
                emit(json, &record, || {
                    println!("Backup: {}", record.id);
                    println!("Type: {}", record.kind);
                    println!("Size: {}", format_bytes(record.size_bytes));
                    println!("Checksum: {}", record.checksum);
                    println!("Duration: {} ms", record.duration_ms);
                })
            }
            Command::Restore { id, target } => {
                app.backups.restore(&id, target.as_deref()).await?;
                println!("Restored {}", id);
                Ok(())
            }
            Command::List => {
                let records = app.backups.list_backups().await?;
                emit(json, &records, || {
                    println!("{:<28} {:<12} {:<8} {:>12} {:>10}", "ID", "TYPE", "STATUS", "SIZE", "ROWS");
                    println!("{}", "-".repeat(74));
                    for r in &records {
                        println!(
                            "{:<28} {:<12} {:<8} {:>12} {:>10}",
                            r.id,
                            r.kind.to_string(),
                            r.status.to_string(),
                            format_bytes(r.size_bytes),
                            r.record_count.map(|n| n.to_string()).unwrap_or_else(|| "-".into())
                        );
                    }
                })
            }
            Command::Verify { id } => {
                if app.backups.verify_backup(&id).await? {
                    println!("{}: OK", id);
                    Ok(())
                } else {
                    anyhow::bail!("{}: verification failed", id)
                }
            }
            Command::Stats => {
                let stats = app.backups.get_backup_stats().await?;
                emit(json, &stats, || {
                    println!("Total: {}", stats.total);
                    println!("Successful: {}", stats.successful);
                    println!("Failed: {}", stats.failed);
                    println!("Total Size: {}", format_bytes(stats.total_size));
                    println!("Average Duration: {} ms", stats.avg_duration_ms);
                    println!("Oldest: {}", show_time(stats.oldest));
                    println!("Newest: {}", show_time(stats.newest));
                })
            }
            Command::Cleanup => {
                let report = app.backups.cleanup_old_backups().await?;
                emit(json, &report, || {
                    println!("Removed (age): {}", report.removed_by_age);
                    println!("Removed (count): {}", report.removed_by_count);
                })
            }
            Command::Pitr { cmd } => pitr(app, cmd, json).await,
            Command::Dr { cmd } => dr(app, cmd, json).await,
            Command::Txlog { cmd: TxlogCmd::Stats } => {
                let stats = app.txlog.get_stats().await?;
                emit(json, &stats, || {
                    println!("Entries: {}", stats.total);
                    println!("Transactions: {}", stats.transactions);
                    println!("Oldest: {}", show_time(stats.oldest));
                    println!("Newest: {}", show_time(stats.newest));
                    println!(
                        "Operations: {} inserts, {} updates, {} deletes",
                        stats.operations.inserts, stats.operations.updates, stats.operations.deletes
                    );
                })
            }
            Command::Run { job } => {
                let scheduler = app.scheduler();
                if scheduler.trigger(job).await {
                    println!("{}: done", job);
                    Ok(())
                } else {
                    let stats = scheduler.stats(job);
                    anyhow::bail!("{} failed: {}", job, stats.last_error.unwrap_or_default())
                }
            }
            Command::Serve => serve(app).await,
        }
    }
}

async fn pitr(app: &Keepsafe, cmd: PitrCmd, json: bool) -> Result<()> {
    match cmd {
        PitrCmd::Find { target } => {
            let point = app.pitr.find_recovery_point(target).await?;
            emit(json, &point, || {
                println!("Target: {}", point.timestamp.to_rfc3339());
                println!("Base Backup: {} ({})", point.backup_id, point.backup_timestamp.to_rfc3339());
                println!("Log Entries: {}", point.log_entries);
            })
        }
        PitrCmd::Recover { target, dry_run } => {
            let outcome = app.pitr.recover_to_point(target, dry_run).await?;
            emit(json, &outcome, || {
                if outcome.dry_run {
                    println!("Dry run, nothing changed");
                }
                println!("Base Backup: {}", outcome.recovery_point.backup_id);
                if let Some(id) = &outcome.pre_recovery_backup {
                    println!("Pre-recovery Backup: {}", id);
                }
                println!("Replayed: {}", outcome.replayed);
                println!("Skipped: {}", outcome.skipped);
                for f in &outcome.failures {
                    println!("  {}: {}", f.entry_id, f.error);
                }
            })
        }
        PitrCmd::Test { target } => {
            let report = app.pitr.test_recovery(target).await?;
            emit(json, &report, || {
                println!("Target: {}", report.target.to_rfc3339());
                println!("Base Backup: {}", report.backup_id);
                println!("Can Recover: {}", report.can_recover);
                println!("Log Entries: {}", report.transaction_logs.count);
                println!("Estimated Duration: {} ms", report.estimated_duration_ms);
            })
        }
        PitrCmd::Points { limit } => {
            let limit = limit.unwrap_or(app.pitr.config().points_limit);
            let points = app.pitr.get_recovery_points(limit).await?;
            emit(json, &points, || {
                println!("{:<28} {:<26} {:>12}", "BACKUP", "TIME", "LOG SINCE");
                println!("{}", "-".repeat(68));
                for p in &points {
                    println!("{:<28} {:<26} {:>12}", p.backup_id, p.timestamp.to_rfc3339(), p.entries_since);
                }
            })
        }
    }
}

async fn dr(app: &Keepsafe, cmd: DrCmd, json: bool) -> Result<()> {
    match cmd {
        DrCmd::Types => {
            let types = disaster_types();
            emit(json, &types, || {
                println!("{:<20} {:<22} {:<10} {}", "CODE", "NAME", "SEVERITY", "AUTO");
                println!("{}", "-".repeat(60));
                for t in &types {
                    println!("{:<20} {:<22} {:<10} {}", t.code, t.name, t.severity.to_string(), t.auto_recoverable);
                }
            })
        }
        DrCmd::Plan { code } => {
            let plan = app.orchestrator.create_recovery_plan(&code).await?;
            emit(json, &plan, || print_plan(&plan))
        }
        DrCmd::Execute { code, automated } => {
            let mut plan = app.orchestrator.create_recovery_plan(&code).await?;
            let result = app.orchestrator.execute_recovery_plan(&mut plan, automated).await;
            emit(json, &plan, || print_plan(&plan))?;
            if plan.status == PlanStatus::Completed && !plan.skipped_steps.is_empty() {
                warn!(steps = ?plan.skipped_steps, "manual steps still need an operator");
            }
            result?;
            Ok(())
        }
        DrCmd::Status => match app.orchestrator.plans().load().await? {
            Some(plan) => emit(json, &plan, || print_plan(&plan)),
            None => {
                println!("No recovery plan at {}", app.orchestrator.plans().path().display());
                Ok(())
            }
        },
        DrCmd::Test => {
            let report = app.orchestrator.test_disaster_recovery().await;
            emit(json, &report, || {
                for (name, check) in [
                    ("backup", &report.backup_round_trip),
                    ("connectivity", &report.connectivity),
                    ("plan", &report.plan_creation),
                ] {
                    let mark = if check.passed { "PASS" } else { "FAIL" };
                    println!("{:<14} {} {}", name, mark, check.detail);
                }
            })?;
            if !report.passed {
                anyhow::bail!("disaster recovery self-test failed");
            }
            Ok(())
        }
    }
}

async fn serve(app: &Keepsafe) -> Result<()> {
    let scheduler = app.scheduler();
    scheduler.initialize()?;
    for job in scheduler.registered_jobs() {
        info!(job = %job, next_run = ?scheduler.next_run(job), "job scheduled");
    }
    tokio::signal::ctrl_c().await?;
    info!("shutting down scheduler");
    scheduler.stop();
    Ok(())
}

fn print_plan(plan: &DisasterRecoveryPlan) {
    println!("Disaster: {}", plan.disaster_type);
    println!("Detected: {}", plan.detected_at.to_rfc3339());
    println!("Status: {}", plan.status);
    println!("Estimated Duration: {} s", plan.estimated_total_duration);
    for step in &plan.steps {
        let state = if plan.completed_steps.contains(&step.id) {
            "done"
        } else if plan.failed_steps.contains(&step.id) {
            "failed"
        } else if plan.skipped_steps.contains(&step.id) {
            "operator"
        } else if plan.current_step == step.id {
            "running"
        } else {
            ""
        };
        let mode = if step.automated { "auto" } else { "manual" };
        println!("  {:<24} {:<7} {:<9} {}", step.id, mode, state, step.description);
    }
    if plan.status == PlanStatus::Failed {
        if let Some(step) = plan.step(&plan.current_step) {
            println!("Failed Step: {} ({})", step.id, step.description);
        }
    }
    if let Some(e) = &plan.error {
        println!("Error: {}", e);
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

fn show_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
