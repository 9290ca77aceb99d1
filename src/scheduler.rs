// Background Job Scheduler
//
// Runs the clustering and verification batches on their configured
// intervals, bounds each run by its max duration, and keeps an in-memory
// history of job runs.

use crate::batch::BatchReport;
use crate::clustering::ClusterPipeline;
use crate::config::{ClusteringConfig, VerificationSettings};
use crate::error::{EngineError, Result as EngineResult};
use crate::period::PeriodSpec;
use crate::verification::VerificationRunner;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, timeout};

/// Maximum job runs kept in memory
const HISTORY_LIMIT: usize = 200;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job execution failed: {0}")]
    ExecutionError(#[from] crate::error::EngineError),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Job error: {0}")]
    JobError(#[from] JobError),
}

/// Timing of one scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobConfig {
    pub interval: Duration,
    pub max_duration: Duration,
}

impl From<&ClusteringConfig> for JobConfig {
    fn from(config: &ClusteringConfig) -> Self {
        Self {
            interval: config.interval,
            max_duration: config.max_duration,
        }
    }
}

impl From<&VerificationSettings> for JobConfig {
    fn from(config: &VerificationSettings) -> Self {
        Self {
            interval: config.interval,
            max_duration: config.max_duration,
        }
    }
}

/// Report generated after job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,

    /// Duration of job execution
    #[serde(with = "serde_duration_millis")]
    pub duration: Duration,

    /// Set when the batch itself could not run
    pub error_message: Option<String>,
}

impl JobReport {
    fn from_batch(batch: &BatchReport, duration: Duration) -> Self {
        Self {
            succeeded: batch.success,
            skipped: batch.skipped,
            failed: batch.failed,
            duration,
            error_message: None,
        }
    }

    fn failure(message: String, duration: Duration) -> Self {
        Self {
            succeeded: 0,
            skipped: 0,
            failed: 0,
            duration,
            error_message: Some(message),
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as milliseconds)
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A periodic batch job
#[async_trait]
pub trait BatchJob: Send + Sync {
    /// Job name (for logging and tracking)
    fn name(&self) -> &str;

    async fn run(&self) -> Result<BatchReport, JobError>;
}

/// Months a clustering run at `now` must cover.
///
/// The previous month is included while the last run (`interval` ago) may
/// have fallen before the month rolled over, so its tail still gets grouped.
pub fn months_to_cluster(
    now: DateTime<Utc>,
    interval: Duration,
) -> EngineResult<Vec<PeriodSpec>> {
    let lookback = chrono::Duration::from_std(interval)
        .map_err(|e| EngineError::Config(format!("Invalid clustering interval: {}", e)))?;
    let current = PeriodSpec::Month {
        year: now.year(),
        month: now.month(),
    };
    let month_start = current.resolve(now)?.window.start;

    let mut months = Vec::with_capacity(2);
    if now - lookback < month_start {
        let (year, month) = if now.month() == 1 {
            (now.year() - 1, 12)
        } else {
            (now.year(), now.month() - 1)
        };
        months.push(PeriodSpec::Month { year, month });
    }
    months.push(current);
    Ok(months)
}

/// Clusters the current month (and the previous one right after rollover)
/// for every app and scope
pub struct ClusteringJob {
    pipeline: Arc<ClusterPipeline>,
    interval: Duration,
}

impl ClusteringJob {
    pub fn new(pipeline: Arc<ClusterPipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }
}

#[async_trait]
impl BatchJob for ClusteringJob {
    fn name(&self) -> &str {
        "clustering"
    }

    async fn run(&self) -> Result<BatchReport, JobError> {
        let now = Utc::now();
        let mut report = BatchReport::new();
        for period in months_to_cluster(now, self.interval)? {
            report.merge(self.pipeline.run_all(&period, now).await?);
        }
        Ok(report)
    }
}

/// Re-runs every verification config
pub struct VerificationJob {
    runner: Arc<VerificationRunner>,
}

impl VerificationJob {
    pub fn new(runner: Arc<VerificationRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl BatchJob for VerificationJob {
    fn name(&self) -> &str {
        "verification"
    }

    async fn run(&self) -> Result<BatchReport, JobError> {
        Ok(self.runner.run_all(None, Utc::now()).await?)
    }
}

/// Job execution record for tracking history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub report: Option<JobReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

struct ScheduledJob {
    job: Arc<dyn BatchJob>,
    config: JobConfig,
    last_started: Mutex<Option<Instant>>,
}

/// Background job scheduler
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    running: Arc<AtomicBool>,
    stop_signal: Notify,
    history: Mutex<Vec<JobRun>>,
    /// Pause between due-checks
    tick: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Notify::new(),
            history: Mutex::new(Vec::new()),
            tick: Duration::from_secs(60),
        }
    }

    /// Override the pause between due-checks
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Register a job with the scheduler
    pub fn register_job(&mut self, job: Arc<dyn BatchJob>, config: JobConfig) {
        self.jobs.push(ScheduledJob {
            job,
            config,
            last_started: Mutex::new(None),
        });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Start the scheduler (runs until stopped)
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        tracing::info!("Starting background scheduler with {} jobs", self.jobs.len());

        while self.running.load(Ordering::SeqCst) {
            for scheduled in &self.jobs {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                if self.is_due(scheduled).await {
                    tracing::info!("Running job: {}", scheduled.job.name());
                    self.run_job(scheduled).await;
                } else {
                    tracing::debug!("Job {} not due yet", scheduled.job.name());
                }
            }

            tokio::select! {
                _ = sleep(self.tick) => {}
                _ = self.stop_signal.notified() => {}
            }
        }

        tracing::info!("Stopped background scheduler");
        Ok(())
    }

    /// Stop the scheduler; a loop waiting for its next tick wakes at once
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_signal.notify_one();
    }

    async fn is_due(&self, scheduled: &ScheduledJob) -> bool {
        match *scheduled.last_started.lock().await {
            None => true,
            Some(last) => last.elapsed() >= scheduled.config.interval,
        }
    }

    /// Run a job now, bounded by its max duration
    async fn run_job(&self, scheduled: &ScheduledJob) -> JobReport {
        let job_name = scheduled.job.name();
        let max_duration = scheduled.config.max_duration;
        *scheduled.last_started.lock().await = Some(Instant::now());

        let started_at = Utc::now();
        let clock = Instant::now();
        let job_id = uuid::Uuid::new_v4().to_string();

        tracing::info!("Starting job {} (id: {})", job_name, job_id);

        let (status, report) = match timeout(max_duration, scheduled.job.run()).await {
            Ok(Ok(batch)) => {
                let report = JobReport::from_batch(&batch, clock.elapsed());
                tracing::info!(
                    "Job {} completed: {} succeeded, {} skipped, {} failed in {:?}",
                    job_name,
                    report.succeeded,
                    report.skipped,
                    report.failed,
                    report.duration
                );
                (JobStatus::Success, report)
            }
            Ok(Err(e)) => {
                tracing::error!("Job {} failed: {}", job_name, e);
                (
                    JobStatus::Failed,
                    JobReport::failure(e.to_string(), clock.elapsed()),
                )
            }
            Err(_) => {
                let e = JobError::Timeout(max_duration);
                tracing::error!("Job {}: {}", job_name, e);
                (
                    JobStatus::Timeout,
                    JobReport::failure(e.to_string(), max_duration),
                )
            }
        };

        let job_run = JobRun {
            id: job_id,
            job_name: job_name.to_string(),
            started_at,
            completed_at: Some(Utc::now()),
            status,
            report: Some(report.clone()),
        };
        self.record_job_run(job_run).await;

        report
    }

    async fn record_job_run(&self, job_run: JobRun) {
        tracing::debug!("Job run recorded: {} - {:?}", job_run.job_name, job_run.status);
        let mut history = self.history.lock().await;
        history.push(job_run);
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }
    }

    /// History of job runs, newest first
    pub async fn get_job_history(&self, job_name: Option<&str>, limit: usize) -> Vec<JobRun> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .filter(|run| job_name.map_or(true, |name| run.job_name == name))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
