#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-scheduler** – Trigger-based job scheduling.
//!
//! One dedicated worker task ticks every ≤100 ms and executes due jobs
//! sequentially. Three trigger families:
//!
//! - **interval** – next run is `last actual run + interval`. After a pause
//!   the scheduler produces exactly one catch-up run per interval boundary
//!   rather than a burst.
//! - **at** – one-shot; the job completes after its single run.
//! - **cron** – next matching time strictly after the last run. Five-field
//!   expressions are accepted (a seconds field of `0` is implied);
//!   six/seven-field expressions pass through to the parser unchanged.
//!
//! Scheduling is idempotent on `job_id`: re-registering replaces the trigger
//! and callable and recomputes the next run. Job failures are recorded on
//! the job and never kill the worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised while registering jobs.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Interval must be strictly positive.
    #[error("interval must be positive, got {0:?}")]
    NonPositiveInterval(Duration),
    /// The cron expression did not parse.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron {
        /// Offending expression.
        expr: String,
        /// Parser failure.
        reason: String,
    },
}

//─────────────────────────────
//  Triggers
//─────────────────────────────

/// When a job runs.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Run every `every`, measured from the last actual run.
    Interval {
        /// Interval between runs.
        every: Duration,
    },
    /// Run once at a specific instant.
    At {
        /// Target instant.
        at: DateTime<Utc>,
    },
    /// Run on a cron schedule (UTC).
    Cron {
        /// Parsed schedule.
        schedule: Schedule,
        /// Original expression, for display.
        expr: String,
    },
}

impl Trigger {
    /// Interval trigger.
    pub fn interval(every: Duration) -> Result<Self, SchedulerError> {
        if every.is_zero() {
            return Err(SchedulerError::NonPositiveInterval(every));
        }
        Ok(Trigger::Interval { every })
    }

    /// One-shot trigger at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Trigger::At { at }
    }

    /// Cron trigger. A classic five-field expression gets an implied
    /// seconds field of `0` prepended.
    pub fn cron(expr: &str) -> Result<Self, SchedulerError> {
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        let schedule = normalized
            .parse::<Schedule>()
            .map_err(|e| SchedulerError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Trigger::Cron { schedule, expr: expr.to_string() })
    }

    /// Next run strictly derived from the trigger and the last actual run.
    /// `None` means no further runs.
    fn next_run(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { every } => match last_run_at {
                None => Some(now),
                Some(last) => {
                    Some(last + chrono::Duration::from_std(*every).unwrap_or_default())
                }
            },
            Trigger::At { at } => {
                if last_run_at.is_some() {
                    None
                } else {
                    Some(*at)
                }
            }
            Trigger::Cron { schedule, .. } => {
                let base = last_run_at.unwrap_or(now);
                schedule.after(&base).next()
            }
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval { every } => format!("interval({every:?})"),
            Trigger::At { at } => format!("at({at})"),
            Trigger::Cron { expr, .. } => format!("cron({expr})"),
        }
    }
}

//─────────────────────────────
//  Jobs
//─────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its next run.
    Pending,
    /// Currently executing on the worker.
    Running,
    /// No further runs (one-shot done, or cron exhausted).
    Completed,
    /// Last run errored and the trigger yields no further runs.
    Failed,
    /// Cancelled; terminal.
    Cancelled,
}

/// Async job body.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct JobEntry {
    snapshot: Job,
    trigger: Trigger,
    callable: JobFn,
}

/// Observable job state (the callable itself is not exposed).
#[derive(Debug, Clone)]
pub struct Job {
    /// Stable identifier; scheduling is idempotent on it.
    pub job_id: String,
    /// Human-readable name.
    pub name: String,
    /// Trigger description, for display.
    pub trigger: String,
    /// Current status.
    pub status: JobStatus,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
    /// Start instant of the last run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due instant, if any.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Successful runs.
    pub run_count: u64,
    /// Failed runs.
    pub error_count: u64,
    /// Message of the last failure, cleared on success.
    pub last_error: Option<String>,
    /// Caller-supplied metadata.
    pub metadata: Value,
}

//─────────────────────────────
//  Scheduler
//─────────────────────────────

const TICK: Duration = Duration::from_millis(100);

/// Job scheduler with a single dedicated worker task.
pub struct Scheduler {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Scheduler with no jobs, not yet started.
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Register a job running every `every`.
    pub fn schedule_interval(
        &self,
        name: &str,
        every: Duration,
        callable: JobFn,
        job_id: Option<String>,
        metadata: Option<Value>,
    ) -> Result<String, SchedulerError> {
        let trigger = Trigger::interval(every)?;
        Ok(self.add_job(job_id, name, trigger, callable, metadata))
    }

    /// Register a one-shot job at `at`.
    pub fn schedule_at(
        &self,
        name: &str,
        at: DateTime<Utc>,
        callable: JobFn,
        job_id: Option<String>,
        metadata: Option<Value>,
    ) -> String {
        self.add_job(job_id, name, Trigger::at(at), callable, metadata)
    }

    /// Register a cron job.
    pub fn schedule_cron(
        &self,
        name: &str,
        expr: &str,
        callable: JobFn,
        job_id: Option<String>,
        metadata: Option<Value>,
    ) -> Result<String, SchedulerError> {
        let trigger = Trigger::cron(expr)?;
        Ok(self.add_job(job_id, name, trigger, callable, metadata))
    }

    fn add_job(
        &self,
        job_id: Option<String>,
        name: &str,
        trigger: Trigger,
        callable: JobFn,
        metadata: Option<Value>,
    ) -> String {
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        let snapshot = Job {
            job_id: job_id.clone(),
            name: name.to_string(),
            trigger: trigger.describe(),
            status: JobStatus::Pending,
            created_at: now,
            last_run_at: None,
            next_run_at: trigger.next_run(None, now),
            run_count: 0,
            error_count: 0,
            last_error: None,
            metadata: metadata.unwrap_or(Value::Null),
        };

        info!(
            job_id = %job_id,
            name,
            trigger = %snapshot.trigger,
            next_run_at = ?snapshot.next_run_at,
            "job scheduled"
        );

        // Idempotent on job_id: an existing entry is replaced wholesale.
        self.jobs
            .lock()
            .expect("scheduler registry poisoned")
            .insert(job_id.clone(), JobEntry { snapshot, trigger, callable });

        job_id
    }

    /// Cancel a job. A currently executing run completes without
    /// rescheduling. Returns whether the job existed.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("scheduler registry poisoned");
        match jobs.get_mut(job_id) {
            Some(entry) => {
                entry.snapshot.status = JobStatus::Cancelled;
                entry.snapshot.next_run_at = None;
                info!(job_id, name = %entry.snapshot.name, "job cancelled");
                true
            }
            None => false,
        }
    }

    /// Observable state of one job.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .expect("scheduler registry poisoned")
            .get(job_id)
            .map(|e| e.snapshot.clone())
    }

    /// All jobs, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let jobs = self.jobs.lock().expect("scheduler registry poisoned");
        let mut list: Vec<Job> = jobs
            .values()
            .map(|e| e.snapshot.clone())
            .filter(|j| status.map_or(true, |s| j.status == s))
            .collect();
        list.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        list
    }

    /// Whether the worker task is running.
    pub fn is_running(&self) -> bool {
        self.stop_tx.lock().expect("scheduler stop poisoned").is_some()
    }

    /// Start the worker task. Idempotent.
    pub fn start(&self) {
        let mut stop_guard = self.stop_tx.lock().expect("scheduler stop poisoned");
        if stop_guard.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *stop_guard = Some(tx);

        let jobs = Arc::clone(&self.jobs);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(TICK) => {
                        Self::tick(&jobs).await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *self.worker.lock().expect("scheduler worker poisoned") = Some(handle);
        info!("scheduler started");
    }

    /// Stop the worker, waiting up to `timeout` for it to finish its
    /// current tick. Idempotent; a job exceeding the timeout is abandoned.
    pub async fn stop(&self, timeout: Duration) {
        let tx = self.stop_tx.lock().expect("scheduler stop poisoned").take();
        let Some(tx) = tx else { return };
        let _ = tx.send(true);

        let handle = self.worker.lock().expect("scheduler worker poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("scheduler worker did not stop within {timeout:?}; abandoning");
            }
        }
        info!("scheduler stopped");
    }

    /// One pass over due jobs; exposed for deterministic tests.
    pub async fn tick_once(&self) {
        Self::tick(&self.jobs).await;
    }

    async fn tick(jobs: &Arc<Mutex<HashMap<String, JobEntry>>>) {
        let now = Utc::now();

        let due: Vec<(String, JobFn)> = {
            let mut registry = jobs.lock().expect("scheduler registry poisoned");
            let mut due = Vec::new();
            for entry in registry.values_mut() {
                let job = &mut entry.snapshot;
                let is_due = job.status == JobStatus::Pending
                    && job.next_run_at.is_some_and(|next| next <= now);
                if is_due {
                    job.status = JobStatus::Running;
                    due.push((job.job_id.clone(), Arc::clone(&entry.callable)));
                }
            }
            due.sort_by(|a, b| a.0.cmp(&b.0));
            due
        };

        // Jobs execute sequentially on the worker.
        for (job_id, callable) in due {
            let started_at = Utc::now();
            // A spawned task converts panics into JoinErrors instead of
            // taking down the worker.
            let outcome = match tokio::spawn(callable()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(join_err) => Err(format!("job panicked: {join_err}")),
            };

            let mut registry = jobs.lock().expect("scheduler registry poisoned");
            let Some(entry) = registry.get_mut(&job_id) else { continue };
            let job = &mut entry.snapshot;

            // Cancelled while running: the run completed, nothing reschedules.
            if job.status == JobStatus::Cancelled {
                continue;
            }

            job.last_run_at = Some(started_at);
            match outcome {
                Ok(()) => {
                    job.run_count += 1;
                    job.last_error = None;
                    job.next_run_at = entry.trigger.next_run(Some(started_at), Utc::now());
                    job.status = if job.next_run_at.is_some() {
                        JobStatus::Pending
                    } else {
                        JobStatus::Completed
                    };
                    debug!(
                        job_id = %job.job_id,
                        name = %job.name,
                        run_count = job.run_count,
                        next_run_at = ?job.next_run_at,
                        "job executed"
                    );
                }
                Err(message) => {
                    job.error_count += 1;
                    job.last_error = Some(message.clone());
                    // Interval and cron triggers keep going; a failed
                    // one-shot is terminal.
                    job.next_run_at = entry.trigger.next_run(Some(started_at), Utc::now());
                    job.status = if job.next_run_at.is_some() {
                        JobStatus::Pending
                    } else {
                        JobStatus::Failed
                    };
                    error!(
                        job_id = %job.job_id,
                        name = %job.name,
                        error = %message,
                        error_count = job.error_count,
                        "job failed"
                    );
                }
            }
        }
    }
}

/// Wrap an async closure as a [`JobFn`].
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>) -> JobFn {
        job_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn interval_job_runs_and_reschedules() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let job_id = scheduler
            .schedule_interval(
                "tick",
                Duration::from_millis(20),
                counting_job(counter.clone()),
                Some("job-tick".into()),
                None,
            )
            .unwrap();

        scheduler.tick_once().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let job = scheduler.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_count, 1);
        let last = job.last_run_at.unwrap();
        assert_eq!(job.next_run_at.unwrap(), last + chrono::Duration::milliseconds(20));
    }

    #[tokio::test]
    async fn missed_runs_collapse_to_one_catch_up() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule_interval(
                "paused",
                Duration::from_millis(10),
                counting_job(counter.clone()),
                Some("job-paused".into()),
                None,
            )
            .unwrap();

        scheduler.tick_once().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Simulate a pause several intervals long, then a single tick.
        tokio::time::sleep(Duration::from_millis(55)).await;
        scheduler.tick_once().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2, "exactly one catch-up run");

        // next_run_at realigns to last actual run + interval.
        let job = scheduler.get_job("job-paused").unwrap();
        let last = job.last_run_at.unwrap();
        assert_eq!(job.next_run_at.unwrap(), last + chrono::Duration::milliseconds(10));
    }

    #[tokio::test]
    async fn at_job_completes_after_one_run() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at(
            "once",
            Utc::now() - chrono::Duration::seconds(1),
            counting_job(counter.clone()),
            Some("job-once".into()),
            None,
        );

        scheduler.tick_once().await;
        scheduler.tick_once().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let job = scheduler.get_job("job-once").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.next_run_at.is_none());
    }

    #[tokio::test]
    async fn future_at_job_does_not_run_early() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at(
            "later",
            Utc::now() + chrono::Duration::hours(1),
            counting_job(counter.clone()),
            Some("job-later".into()),
            None,
        );
        scheduler.tick_once().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.get_job("job-later").unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cron_five_field_expression_parses() {
        let trigger = Trigger::cron("*/5 * * * *").unwrap();
        let base = Utc::now();
        let next = trigger.next_run(None, base).unwrap();
        assert!(next > base);
        assert_eq!(next.timestamp() % 300, 0);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(Trigger::cron("not a cron").is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Trigger::interval(Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn rescheduling_same_job_id_replaces_job() {
        let scheduler = Scheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule_interval("v1", Duration::from_millis(10), counting_job(first.clone()), Some("job-x".into()), None)
            .unwrap();
        scheduler
            .schedule_interval("v2", Duration::from_millis(10), counting_job(second.clone()), Some("job-x".into()), None)
            .unwrap();

        scheduler.tick_once().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.list_jobs(None).len(), 1);
        assert_eq!(scheduler.get_job("job-x").unwrap().name, "v2");
    }

    #[tokio::test]
    async fn cancelled_job_never_runs_again() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule_interval("c", Duration::from_millis(1), counting_job(counter.clone()), Some("job-c".into()), None)
            .unwrap();

        scheduler.tick_once().await;
        assert!(scheduler.cancel("job-c"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.tick_once().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.get_job("job-c").unwrap().status, JobStatus::Cancelled);
        assert!(!scheduler.cancel("job-missing"));
    }

    #[tokio::test]
    async fn failing_job_is_recorded_and_rescheduled() {
        let scheduler = Scheduler::new();
        scheduler
            .schedule_interval(
                "flaky",
                Duration::from_millis(10),
                job_fn(|| async { anyhow::bail!("boom") }),
                Some("job-flaky".into()),
                None,
            )
            .unwrap();

        scheduler.tick_once().await;
        let job = scheduler.get_job("job-flaky").unwrap();
        assert_eq!(job.error_count, 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.as_deref().unwrap().contains("boom"));
        assert!(job.next_run_at.is_some());
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_worker() {
        let scheduler = Scheduler::new();
        scheduler
            .schedule_interval(
                "panics",
                Duration::from_millis(10),
                job_fn(|| async { panic!("worker must survive") }),
                Some("job-panic".into()),
                None,
            )
            .unwrap();

        scheduler.tick_once().await;
        let job = scheduler.get_job("job-panic").unwrap();
        assert_eq!(job.error_count, 1);
        assert!(job.last_error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule_interval("bg", Duration::from_millis(10), counting_job(counter.clone()), Some("job-bg".into()), None)
            .unwrap();

        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.stop(Duration::from_secs(1)).await;
        scheduler.stop(Duration::from_secs(1)).await;
        assert!(!scheduler.is_running());

        assert!(counter.load(Ordering::SeqCst) >= 1, "worker executed due jobs");
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule_interval("a", Duration::from_secs(60), counting_job(counter.clone()), Some("job-a".into()), None)
            .unwrap();
        scheduler
            .schedule_interval("b", Duration::from_secs(60), counting_job(counter), Some("job-b".into()), None)
            .unwrap();
        scheduler.cancel("job-b");

        assert_eq!(scheduler.list_jobs(None).len(), 2);
        assert_eq!(scheduler.list_jobs(Some(JobStatus::Pending)).len(), 1);
        assert_eq!(scheduler.list_jobs(Some(JobStatus::Cancelled)).len(), 1);
    }
}
