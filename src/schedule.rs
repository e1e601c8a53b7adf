//! Cron scheduling for backups.
use std::{
    collections::VecDeque,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{debug, error, info, warn};

use crate::{
    archive,
    config::BackupSchedule,
    constants::SCHEDULER_TICK,
    error::ServerError,
    server::{BackupMode, Server},
};

/// Maximum number of execution history entries kept by a scheduler.
const MAX_EXECUTION_HISTORY: usize = 10;

/// Result of one scheduled backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Success(PathBuf),
    Failed(String),
}

/// Record of a single scheduled backup.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: BackupOutcome,
}

#[derive(Debug)]
struct BackupJob {
    schedule: Schedule,
    timezone: Tz,
    retain: Option<usize>,
    next_run: Option<DateTime<Utc>>,
    history: VecDeque<BackupRecord>,
}

impl BackupJob {
    fn new(config: &BackupSchedule, now: DateTime<Utc>) -> Result<Self, ServerError> {
        let schedule = Schedule::from_str(&config.schedule).map_err(|e| {
            ServerError::Config(format!(
                "Invalid cron expression '{}': {e}",
                config.schedule
            ))
        })?;
        let timezone = match &config.timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| ServerError::Config(format!("Unknown timezone '{name}': {e}")))?,
            None => Tz::UTC,
        };

        let mut job = Self {
            schedule,
            timezone,
            retain: config.retain,
            next_run: None,
            history: VecDeque::with_capacity(MAX_EXECUTION_HISTORY),
        };
        job.next_run = job.upcoming_after(now);
        Ok(job)
    }

    fn upcoming_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Returns whether a run is due at `now` and, if so, moves on to the following slot.
    /// Slots missed while a backup was running collapse into one run.
    fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.next_run {
            Some(next) if now >= next => {
                self.next_run = self.upcoming_after(now);
                true
            }
            _ => false,
        }
    }

    fn add_execution_record(&mut self, record: BackupRecord) {
        if self.history.len() >= MAX_EXECUTION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

/// Background thread running scheduled backups of one server.
///
/// Backups run inline on the scheduler thread, so runs never overlap. Dropping the scheduler
/// stops it.
pub struct BackupScheduler {
    job: Arc<Mutex<BackupJob>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackupScheduler {
    pub fn spawn(server: Server, config: &BackupSchedule) -> Result<Self, ServerError> {
        let job = Arc::new(Mutex::new(BackupJob::new(config, Utc::now())?));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let job = Arc::clone(&job);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("{}-scheduler", server.name()))
                .spawn(move || run_scheduler(server, job, stop))?
        };

        info!("Scheduled backups with '{}'", config.schedule);
        Ok(Self {
            job,
            stop,
            handle: Some(handle),
        })
    }

    /// Time of the next scheduled backup.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_run
    }

    /// Most recent runs, oldest first.
    pub fn history(&self) -> Vec<BackupRecord> {
        self.job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Stops the scheduler, waiting for an in-flight backup to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Backup scheduler thread panicked");
            }
        }
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(server: Server, job: Arc<Mutex<BackupJob>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        thread::park_timeout(SCHEDULER_TICK);
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let (due, retain) = {
            let mut job = job.lock().unwrap_or_else(PoisonError::into_inner);
            (job.take_due(Utc::now()), job.retain)
        };
        if !due {
            continue;
        }

        let started_at = Utc::now();
        info!("Running scheduled backup of server '{}'", server.name());
        let outcome = match run_backup(&server, retain) {
            Ok(path) => BackupOutcome::Success(path),
            Err(err) => {
                error!("Scheduled backup of server '{}' failed: {err}", server.name());
                BackupOutcome::Failed(err.to_string())
            }
        };

        job.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_execution_record(BackupRecord {
                started_at,
                completed_at: Utc::now(),
                outcome,
            });
    }
    debug!("Backup scheduler for server '{}' stopped", server.name());
}

fn run_backup(server: &Server, retain: Option<usize>) -> Result<PathBuf, ServerError> {
    let path = server
        .backup(BackupMode::Blocking)?
        .ok_or_else(|| ServerError::Config("Blocking backup returned no archive".into()))?;

    if let Some(keep) = retain {
        let removed = archive::prune_backups(&server.backup_dir(), keep)?;
        if !removed.is_empty() {
            debug!("Pruned {} old backup(s)", removed.len());
        }
    }
    Ok(path)
}
