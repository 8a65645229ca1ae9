//! CronJob: schedule-driven job creation with concurrency policies

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use provisr_core::constants::{
    DEFAULT_FAILED_HISTORY_LIMIT, DEFAULT_STOP_WAIT, DEFAULT_SUCCESS_HISTORY_LIMIT,
};
use provisr_core::{validate_name, Error, LifecycleHooks, Result};
use provisr_events::{CronMetric, SinkSet};
use provisr_manager::Manager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::job::{Job, JobPhase, JobSpec};
use crate::schedule::Schedule;

/// How a tick behaves while a prior job is still active
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Overlapping jobs are fine
    #[default]
    Allow,
    /// Skip the tick entirely
    Forbid,
    /// Stop the active jobs, then start the new one
    Replace,
}

impl FromStr for ConcurrencyPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(ConcurrencyPolicy::Allow),
            "forbid" => Ok(ConcurrencyPolicy::Forbid),
            "replace" => Ok(ConcurrencyPolicy::Replace),
            other => Err(Error::InvalidConcurrencyPolicy(other.to_string())),
        }
    }
}

fn default_success_limit() -> usize {
    DEFAULT_SUCCESS_HISTORY_LIMIT
}

fn default_failed_limit() -> usize {
    DEFAULT_FAILED_HISTORY_LIMIT
}

/// CronJob specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub name: String,
    pub schedule: String,
    pub job_template: JobSpec,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default = "default_success_limit")]
    pub successful_jobs_history_limit: usize,
    #[serde(default = "default_failed_limit")]
    pub failed_jobs_history_limit: usize,
    #[serde(default)]
    pub starting_deadline_seconds: Option<u64>,
    /// Carried for the API layer; tick computation is UTC
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub lifecycle: LifecycleHooks,
}

impl CronJobSpec {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, template: JobSpec) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            job_template: template,
            concurrency_policy: ConcurrencyPolicy::default(),
            suspend: false,
            successful_jobs_history_limit: DEFAULT_SUCCESS_HISTORY_LIMIT,
            failed_jobs_history_limit: DEFAULT_FAILED_HISTORY_LIMIT,
            starting_deadline_seconds: None,
            time_zone: None,
            lifecycle: LifecycleHooks::default(),
        }
    }

    /// Job spec for one tick: the template with the tick's name and the
    /// cronjob's hooks merged around the template's.
    pub fn create_job_from_template(&self, name: &str) -> JobSpec {
        let mut job = self.job_template.clone();
        job.name = name.to_string();
        if !self.lifecycle.is_empty() {
            job.lifecycle = LifecycleHooks::merge_for_job(&self.lifecycle, &self.job_template.lifecycle);
        }
        job
    }
}

/// Reference to an in-flight job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReference {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Observable cronjob state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronJobStatus {
    pub active: Vec<JobReference>,
    pub last_schedule_time: Option<DateTime<Utc>>,
    pub last_successful_time: Option<DateTime<Utc>>,
}

/// Bounded execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_name: String,
    pub phase: JobPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct CronInner {
    spec: CronJobSpec,
    schedule: Schedule,
    manager: Manager,
    sinks: SinkSet,
    active: RwLock<HashMap<String, Job>>,
    history: RwLock<Vec<HistoryEntry>>,
    last_schedule_time: RwLock<Option<DateTime<Utc>>>,
    last_successful_time: RwLock<Option<DateTime<Utc>>>,
    scheduled: AtomicBool,
    suspended: AtomicBool,
    /// Cancels the current ticker; replaced on every Start
    ticker_cancel: Mutex<Option<broadcast::Sender<()>>>,
    /// Cancels every monitor of this cronjob; fired by Stop only
    cancel_tx: broadcast::Sender<()>,
}

/// A scheduled cronjob
#[derive(Clone)]
pub struct CronJob {
    inner: Arc<CronInner>,
}

impl CronJob {
    /// Build a cronjob: the schedule must parse and the job template
    /// (with defaults applied) must validate.
    pub fn new(spec: CronJobSpec, manager: Manager, sinks: SinkSet) -> Result<Self> {
        if !validate_name(&spec.name) {
            return Err(Error::invalid_spec(
                spec.name.clone(),
                "name must be non-empty and contain only alphanumeric characters, underscores, and hyphens",
            ));
        }
        let schedule = Schedule::parse(&spec.schedule)?;
        spec.lifecycle.validate()?;

        // The template's name is synthesized per tick; validate the rest
        // with a stand-in.
        let mut template = spec.job_template.clone();
        template.name = spec.name.clone();
        template.set_defaults();
        template.validate()?;

        let (cancel_tx, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(CronInner {
                suspended: AtomicBool::new(spec.suspend),
                spec,
                schedule,
                manager,
                sinks,
                active: RwLock::new(HashMap::new()),
                history: RwLock::new(Vec::new()),
                last_schedule_time: RwLock::new(None),
                last_successful_time: RwLock::new(None),
                scheduled: AtomicBool::new(false),
                ticker_cancel: Mutex::new(None),
                cancel_tx,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &CronJobSpec {
        &self.inner.spec
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    /// Register the schedule. A no-op while suspended; starting an
    /// already-scheduled cronjob is an error.
    pub fn start(&self) -> Result<()> {
        if self.is_suspended() {
            info!("CronJob '{}' is suspended, not scheduling", self.name());
            return Ok(());
        }
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyScheduled(self.name().to_string()));
        }

        let (ticker_tx, ticker_rx) = broadcast::channel(1);
        *self.inner.ticker_cancel.lock() = Some(ticker_tx);

        info!("CronJob '{}' scheduled ({})", self.name(), self.inner.spec.schedule);
        tokio::spawn(run_ticker(Arc::clone(&self.inner), ticker_rx));
        Ok(())
    }

    /// Deregister the schedule and remember the suspension. Idempotent.
    pub fn suspend(&self) {
        if !self.inner.suspended.swap(true, Ordering::SeqCst) {
            info!("CronJob '{}' suspended", self.name());
        }
        self.deregister();
    }

    /// Clear the suspension and re-register unless already scheduled.
    /// Idempotent; a no-op on an already-scheduled cronjob.
    pub fn resume(&self) -> Result<()> {
        self.inner.suspended.store(false, Ordering::SeqCst);
        if self.is_scheduled() {
            return Ok(());
        }
        info!("CronJob '{}' resumed", self.name());
        self.start()
    }

    /// Deregister, cancel every monitor, and best-effort stop the
    /// active jobs.
    pub async fn stop(&self, wait: Duration) {
        info!("CronJob '{}' stopping", self.name());
        self.deregister();
        let _ = self.inner.cancel_tx.send(());

        let jobs: Vec<Job> = self.inner.active.write().drain().map(|(_, j)| j).collect();
        for job in jobs {
            if let Err(e) = job.stop(wait).await {
                warn!("CronJob '{}': failed to stop job '{}': {}", self.name(), job.name(), e);
            }
        }
    }

    /// Next fire time; None while unscheduled
    pub fn next_schedule(&self) -> Option<DateTime<Utc>> {
        if !self.is_scheduled() {
            return None;
        }
        self.inner.schedule.next_after(Utc::now())
    }

    /// Status snapshot: active job references and schedule timestamps
    pub fn status(&self) -> CronJobStatus {
        let active = self
            .inner
            .active
            .read()
            .values()
            .map(|job| JobReference {
                name: job.name().to_string(),
                started_at: job.status().start_time,
            })
            .collect();
        CronJobStatus {
            active,
            last_schedule_time: *self.inner.last_schedule_time.read(),
            last_successful_time: *self.inner.last_successful_time.read(),
        }
    }

    /// Bounded execution history, most recent last within each outcome
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.read().clone()
    }

    /// Number of jobs this cronjob has created and not yet forgotten
    pub fn jobs_seen(&self) -> usize {
        self.inner.active.read().len() + self.inner.history.read().len()
    }

    fn deregister(&self) {
        self.inner.scheduled.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.inner.ticker_cancel.lock().take() {
            let _ = cancel.send(());
        }
    }
}

/// Tick loop: sleep until the next fire time, then execute the tick
async fn run_ticker(inner: Arc<CronInner>, mut cancel_rx: broadcast::Receiver<()>) {
    loop {
        let now = Utc::now();
        let Some(next) = inner.schedule.next_after(now) else {
            warn!("CronJob '{}' has no upcoming fire time", inner.spec.name);
            inner.scheduled.store(false, Ordering::SeqCst);
            return;
        };

        inner.sinks.observe(CronMetric::ScheduleTimes {
            cronjob: inner.spec.name.clone(),
            next: Some(next),
            last: *inner.last_schedule_time.read(),
        });

        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("CronJob '{}' ticker cancelled", inner.spec.name);
                return;
            }
            _ = tokio::time::sleep(delay) => {
                execute_tick(&inner, next).await;
            }
        }
    }
}

/// One schedule tick: record, resolve the concurrency policy, check the
/// starting deadline, then build and start the job.
async fn execute_tick(inner: &Arc<CronInner>, tick: DateTime<Utc>) {
    *inner.last_schedule_time.write() = Some(tick);

    if !inner.active.read().is_empty() {
        match inner.spec.concurrency_policy {
            ConcurrencyPolicy::Forbid => {
                info!("CronJob '{}': prior job still active, skipping tick", inner.spec.name);
                return;
            }
            ConcurrencyPolicy::Replace => {
                let jobs: Vec<Job> = inner.active.write().drain().map(|(_, j)| j).collect();
                info!(
                    "CronJob '{}': replacing {} active job(s)",
                    inner.spec.name,
                    jobs.len()
                );
                for job in jobs {
                    if let Err(e) = job.stop(DEFAULT_STOP_WAIT).await {
                        warn!(
                            "CronJob '{}': failed to replace job '{}': {}",
                            inner.spec.name,
                            job.name(),
                            e
                        );
                    }
                }
            }
            ConcurrencyPolicy::Allow => {}
        }
    }

    if let Some(deadline_secs) = inner.spec.starting_deadline_seconds {
        let late = Utc::now() - tick;
        if late > chrono::Duration::seconds(deadline_secs as i64) {
            // Missed ticks are dropped, never caught up
            warn!(
                "CronJob '{}': tick missed its starting deadline by {}s, dropping",
                inner.spec.name,
                late.num_seconds()
            );
            return;
        }
    }

    let job_name = format!("{}-{}", inner.spec.name, tick.timestamp());
    {
        // Names have second resolution; a tick whose name is still in
        // use (sub-second schedule, prior job still around) is dropped
        // like a missed tick.
        let active = inner.active.read();
        if active.contains_key(&job_name) || inner.manager.count(&job_name) > 0 {
            debug!(
                "CronJob '{}': job name '{}' still in use, dropping tick",
                inner.spec.name, job_name
            );
            return;
        }
    }
    let job_spec = inner.spec.create_job_from_template(&job_name);
    let started_at = Utc::now();

    let job = match Job::new(job_spec, inner.manager.clone()) {
        Ok(job) => job,
        Err(e) => {
            warn!("CronJob '{}': job '{}' is invalid: {}", inner.spec.name, job_name, e);
            record_outcome(inner, job_name, JobPhase::Failed, started_at, Some(Utc::now()));
            return;
        }
    };

    match job.start().await {
        Ok(()) => {
            inner.active.write().insert(job_name.clone(), job.clone());
            inner.sinks.observe(CronMetric::ActiveJobs {
                cronjob: inner.spec.name.clone(),
                count: inner.active.read().len(),
            });
            spawn_monitor(Arc::clone(inner), job, started_at);
        }
        Err(e) => {
            // Start failures are not retried here; retry already
            // happened in the process layer.
            warn!("CronJob '{}': job '{}' failed to start: {}", inner.spec.name, job_name, e);
            record_outcome(inner, job_name, JobPhase::Failed, started_at, Some(Utc::now()));
        }
    }
}

/// Await one job's completion signal (or the cronjob's cancellation),
/// then classify the outcome and append a history entry.
fn spawn_monitor(inner: Arc<CronInner>, job: Job, started_at: DateTime<Utc>) {
    let mut cancel_rx = inner.cancel_tx.subscribe();
    tokio::spawn(async move {
        let phase = tokio::select! {
            phase = job.wait_terminal() => Some(phase),
            _ = cancel_rx.recv() => None,
        };

        {
            // The name may have been reused by a later tick; only remove
            // our own entry.
            let mut active = inner.active.write();
            if active.get(job.name()).is_some_and(|j| j.same_instance(&job)) {
                active.remove(job.name());
            }
        }

        let Some(_) = phase else {
            debug!("CronJob '{}': monitor for '{}' cancelled", inner.spec.name, job.name());
            return;
        };

        // Succeeded when the process reported at least one success
        let status = job.status();
        let outcome = if status.succeeded >= 1 {
            JobPhase::Succeeded
        } else {
            JobPhase::Failed
        };
        let finished_at = status.completion_time.or_else(|| Some(Utc::now()));

        if outcome == JobPhase::Succeeded {
            *inner.last_successful_time.write() = finished_at;
        }
        record_outcome(&inner, job.name().to_string(), outcome, started_at, finished_at);

        if let (Some(start), Some(end)) = (status.start_time, finished_at) {
            let secs = (end - start).num_milliseconds() as f64 / 1000.0;
            inner.sinks.observe(CronMetric::JobDuration {
                cronjob: inner.spec.name.clone(),
                secs,
            });
        }
        inner.sinks.observe(CronMetric::ActiveJobs {
            cronjob: inner.spec.name.clone(),
            count: inner.active.read().len(),
        });
    });
}

/// Append a history entry, then truncate each outcome partition to its
/// limit, keeping the most recent entries. Ordering across the two
/// partitions is unspecified.
fn record_outcome(
    inner: &Arc<CronInner>,
    job_name: String,
    phase: JobPhase,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
) {
    inner.sinks.observe(CronMetric::JobOutcome {
        cronjob: inner.spec.name.clone(),
        phase: phase.as_str().to_string(),
    });

    let mut history = inner.history.write();
    history.push(HistoryEntry {
        job_name,
        phase,
        started_at,
        finished_at,
    });

    let entries: Vec<HistoryEntry> = history.drain(..).collect();
    let (mut succeeded, mut failed): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|e| e.phase == JobPhase::Succeeded);

    let trim = |list: &mut Vec<HistoryEntry>, limit: usize| {
        if list.len() > limit {
            let excess = list.len() - limit;
            list.drain(..excess);
        }
    };
    trim(&mut succeeded, inner.spec.successful_jobs_history_limit);
    trim(&mut failed, inner.spec.failed_jobs_history_limit);

    history.extend(succeeded);
    history.extend(failed);
}
