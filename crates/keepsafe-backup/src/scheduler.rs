//! Cron-driven background jobs: the full backup and two state snapshots.
//!
//! Each job is a tokio task owned by the [`BackupScheduler`]. Runs are
//! spawned fire-and-forget, so a slow or failing run never delays the next
//! firing, and every failure is logged and counted rather than propagated.

use crate::clock::{Clock, SystemClock};
use crate::cron::CronSchedule;
use crate::error::Result;
use crate::metadata::BackupKind;
use crate::service::Backups;
use crate::snapshot::SnapshotJob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The scheduled jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Full database backup.
    FullBackup,
    /// Table-count snapshot of the points tables.
    PointsSnapshot,
    /// Table-count snapshot of the activity tables.
    ActivitySnapshot,
}

impl JobKind {
    /// Every job, in registration order.
    pub const ALL: [JobKind; 3] = [
        JobKind::FullBackup,
        JobKind::PointsSnapshot,
        JobKind::ActivitySnapshot,
    ];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::FullBackup => write!(f, "full_backup"),
            JobKind::PointsSnapshot => write!(f, "points_snapshot"),
            JobKind::ActivitySnapshot => write!(f, "activity_snapshot"),
        }
    }
}

/// Cron expressions for each job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Full backup, daily at 02:00 by default.
    pub backup: String,
    /// Points snapshot, daily at 03:00 by default.
    pub points_snapshot: String,
    /// Activity snapshot, daily at 04:00 by default.
    pub activity_snapshot: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backup: "0 2 * * *".to_string(),
            points_snapshot: "0 3 * * *".to_string(),
            activity_snapshot: "0 4 * * *".to_string(),
        }
    }
}

impl ScheduleConfig {
    fn expr(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::FullBackup => &self.backup,
            JobKind::PointsSnapshot => &self.points_snapshot,
            JobKind::ActivitySnapshot => &self.activity_snapshot,
        }
    }
}

/// Run counters for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Completed runs, successful or not.
    pub runs: u64,
    /// Runs that ended in an error.
    pub failures: u64,
    /// Start time of the latest run.
    pub last_run: Option<DateTime<Utc>>,
    /// Error of the latest failed run.
    pub last_error: Option<String>,
}

struct JobRunner {
    backups: Arc<dyn Backups>,
    points: Arc<dyn SnapshotJob>,
    activity: Arc<dyn SnapshotJob>,
    clock: Arc<dyn Clock>,
    stats: Mutex<HashMap<JobKind, JobStats>>,
}

impl JobRunner {
    async fn run(&self, kind: JobKind) -> bool {
        let started = self.clock.now();
        info!(job = %kind, "scheduled job starting");
        let result: Result<()> = match kind {
            JobKind::FullBackup => self.backups.backup(BackupKind::Full).await.map(|record| {
                info!(job = %kind, backup_id = %record.id, "scheduled backup stored");
            }),
            JobKind::PointsSnapshot => self.points.run().await,
            JobKind::ActivitySnapshot => self.activity.run().await,
        };

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(kind).or_default();
        entry.runs += 1;
        entry.last_run = Some(started);
        match result {
            Ok(()) => {
                info!(job = %kind, "scheduled job finished");
                true
            }
            Err(e) => {
                entry.failures += 1;
                entry.last_error = Some(e.to_string());
                error!(job = %kind, error = %e, "scheduled job failed");
                false
            }
        }
    }
}

/// Owns the three cron jobs.
pub struct BackupScheduler {
    config: ScheduleConfig,
    runner: Arc<JobRunner>,
    jobs: Mutex<Vec<(JobKind, JoinHandle<()>)>>,
}

impl BackupScheduler {
    /// Creates a scheduler; nothing runs until [`BackupScheduler::initialize`].
    pub fn new(
        config: ScheduleConfig,
        backups: Arc<dyn Backups>,
        points: Arc<dyn SnapshotJob>,
        activity: Arc<dyn SnapshotJob>,
    ) -> Self {
        Self::with_clock(config, backups, points, activity, Arc::new(SystemClock))
    }

    /// Creates a scheduler that reads time from `clock`.
    pub fn with_clock(
        config: ScheduleConfig,
        backups: Arc<dyn Backups>,
        points: Arc<dyn SnapshotJob>,
        activity: Arc<dyn SnapshotJob>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            runner: Arc::new(JobRunner {
                backups,
                points,
                activity,
                clock,
                stats: Mutex::new(HashMap::new()),
            }),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Registers all jobs, replacing any registered earlier.
    ///
    /// Every expression is parsed before anything is replaced, so an invalid
    /// schedule leaves the current registration untouched.
    pub fn initialize(&self) -> Result<()> {
        let mut parsed = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            parsed.push((kind, CronSchedule::parse(self.config.expr(kind))?));
        }

        self.stop();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for (kind, cron) in parsed {
            info!(job = %kind, schedule = %cron, "registering scheduled job");
            let runner = self.runner.clone();
            jobs.push((kind, tokio::spawn(job_loop(kind, cron, runner))));
        }
        Ok(())
    }

    /// Cancels every registered job. Runs already in flight finish on their own.
    pub fn stop(&self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for (kind, handle) in jobs.drain(..) {
            handle.abort();
            info!(job = %kind, "scheduled job stopped");
        }
    }

    /// Jobs whose loop is still alive.
    pub fn registered_jobs(&self) -> Vec<JobKind> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Runs one job now, outside its schedule. Returns whether it succeeded.
    pub async fn trigger(&self, kind: JobKind) -> bool {
        self.runner.run(kind).await
    }

    /// Counters for one job.
    pub fn stats(&self, kind: JobKind) -> JobStats {
        self.runner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Next firing time of a job, if its expression is valid.
    pub fn next_run(&self, kind: JobKind) -> Option<DateTime<Utc>> {
        CronSchedule::parse(self.config.expr(kind))
            .ok()?
            .next_after(self.runner.clock.now())
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn job_loop(kind: JobKind, cron: CronSchedule, runner: Arc<JobRunner>) {
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = runner.clock.now();
        let from = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = cron.next_after(from) else {
            warn!(job = %kind, schedule = %cron, "schedule never fires again");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        last_fire = Some(next);

        let runner = runner.clone();
        tokio::spawn(async move {
            runner.run(kind).await;
        });
    }
}
