//! Job: a one-shot job description driven through the process manager

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use provisr_core::constants::DEFAULT_BACKOFF_LIMIT;
use provisr_core::{Error, LifecycleHooks, ProcessSpec, ProcessStatus, Result};
use provisr_manager::Manager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Poll interval of the completion watcher
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Restart behavior of a job's process
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
}

/// How completions are counted
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompletionMode {
    #[default]
    NonIndexed,
    Indexed,
}

/// One-shot job specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "humantime_serde")]
    pub start_duration: Duration,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<u64>,
    #[serde(default)]
    pub active_deadline_seconds: Option<u64>,
    #[serde(default)]
    pub backoff_limit: Option<u32>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub completions: Option<u32>,
    #[serde(default)]
    pub completion_mode: Option<CompletionMode>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub lifecycle: LifecycleHooks,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            work_dir: None,
            env: HashMap::new(),
            start_duration: Duration::ZERO,
            log: None,
            ttl_seconds_after_finished: None,
            active_deadline_seconds: None,
            backoff_limit: None,
            parallelism: None,
            completions: None,
            completion_mode: None,
            restart_policy: None,
            lifecycle: LifecycleHooks::default(),
        }
    }

    /// Seed unset fields with their defaults. Runs before validate in
    /// the normal flow.
    pub fn set_defaults(&mut self) {
        self.backoff_limit.get_or_insert(DEFAULT_BACKOFF_LIMIT);
        self.parallelism.get_or_insert(1);
        self.completions.get_or_insert(1);
        self.completion_mode.get_or_insert(CompletionMode::NonIndexed);
        self.restart_policy.get_or_insert(RestartPolicy::Never);
    }

    /// Check field invariants; each violation names its field
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_field("name", "is required"));
        }
        if self.command.trim().is_empty() {
            return Err(Error::invalid_field("command", "is required"));
        }
        if self.parallelism == Some(0) {
            return Err(Error::invalid_field("parallelism", "must be > 0"));
        }
        if self.completions == Some(0) {
            return Err(Error::invalid_field("completions", "must be > 0"));
        }
        if self.active_deadline_seconds == Some(0) {
            return Err(Error::invalid_field("active_deadline_seconds", "must be > 0"));
        }
        self.lifecycle.validate()?;
        Ok(())
    }

    /// Pure translation into a manager spec.
    ///
    /// OnFailure maps to the manager's auto-restart watchdog with the
    /// retry budget seeded from the backoff limit; a zero backoff limit
    /// means no restarts at all.
    pub fn to_process_spec(&self) -> ProcessSpec {
        let backoff = self.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT);
        let on_failure = self.restart_policy == Some(RestartPolicy::OnFailure) && backoff > 0;

        let mut spec = ProcessSpec::new(&self.name, &self.command);
        spec.work_dir = self.work_dir.clone();
        spec.env = self.env.clone();
        spec.start_duration = self.start_duration;
        spec.log = self.log.clone();
        spec.auto_restart = on_failure;
        spec.retry_count = if on_failure { backoff } else { 0 };
        spec.instances = self.parallelism.unwrap_or(1);
        spec.lifecycle = self.lifecycle.clone();
        spec
    }
}

/// Job phase; transitions are monotonic and terminal phases are final
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Condition appended on each phase transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCondition {
    pub phase: JobPhase,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Mutable job state, owned by the Job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub conditions: Vec<JobCondition>,
}

struct JobInner {
    spec: JobSpec,
    manager: Manager,
    status: RwLock<JobStatus>,
    phase_tx: watch::Sender<JobPhase>,
}

/// A running one-shot job
///
/// Holds a non-owning handle to the manager; completion is exposed as a
/// single-use event safe for multiple observers. Cheap to clone; all
/// clones share the same state.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Build a job: defaults are applied, then the spec is validated
    pub fn new(mut spec: JobSpec, manager: Manager) -> Result<Self> {
        spec.set_defaults();
        spec.validate()?;
        let (phase_tx, _) = watch::channel(JobPhase::Pending);
        Ok(Self {
            inner: Arc::new(JobInner {
                spec,
                manager,
                status: RwLock::new(JobStatus::default()),
                phase_tx,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &JobSpec {
        &self.inner.spec
    }

    pub fn phase(&self) -> JobPhase {
        self.inner.status.read().phase
    }

    pub fn status(&self) -> JobStatus {
        self.inner.status.read().clone()
    }

    /// Whether two handles refer to the same job instance
    pub fn same_instance(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start the job's process and begin watching for completion
    pub async fn start(&self) -> Result<()> {
        self.inner.status.write().start_time = Some(Utc::now());

        match self.inner.manager.start(self.inner.spec.to_process_spec()).await {
            Ok(()) => {
                self.transition(JobPhase::Running, "Started", "manager confirmed liveness");
                self.inner.status.write().active = self.inner.spec.parallelism.unwrap_or(1);
                self.spawn_completion_watcher();
                Ok(())
            }
            Err(e) => {
                self.transition(JobPhase::Failed, "StartFailed", &e.to_string());
                Err(e)
            }
        }
    }

    /// Stop the job's instances; a non-terminal job becomes Failed
    pub async fn stop(&self, wait: Duration) -> Result<()> {
        self.inner.manager.stop(&self.inner.spec.name, wait).await?;
        self.transition(JobPhase::Failed, "Stopped", "job was stopped");
        Ok(())
    }

    /// Await the terminal phase without polling.
    ///
    /// Safe for any number of observers; returns immediately once the
    /// job is already terminal.
    pub async fn wait_terminal(&self) -> JobPhase {
        let mut rx = self.inner.phase_tx.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            if phase.is_terminal() {
                return phase;
            }
            if rx.changed().await.is_err() {
                return self.phase();
            }
        }
    }

    /// Phase transitions are monotonic: once terminal, stay terminal
    fn transition(&self, phase: JobPhase, reason: &str, message: &str) {
        {
            let mut status = self.inner.status.write();
            if status.phase.is_terminal() {
                return;
            }
            status.phase = phase;
            if phase.is_terminal() {
                status.completion_time = Some(Utc::now());
                status.active = 0;
            }
            status.conditions.push(JobCondition {
                phase,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition: Utc::now(),
            });
        }
        info!("Job '{}' -> {} ({})", self.inner.spec.name, phase, reason);
        self.inner.phase_tx.send_replace(phase);
    }

    /// Whether an instance is done for good, and with which outcome.
    ///
    /// Under OnFailure an unsuccessful exit with relaunch budget left is
    /// not settled: the watchdog will bring the instance back.
    fn instance_settled(status: &ProcessStatus, auto_restart: bool, budget: u32) -> Option<bool> {
        if status.running {
            return None;
        }
        match status.last_exit_code {
            Some(0) => Some(true),
            _ if auto_restart && status.restarts < budget => None,
            _ => Some(false),
        }
    }

    fn spawn_completion_watcher(&self) {
        let job = self.clone();
        tokio::spawn(async move {
            let process_spec = job.inner.spec.to_process_spec();
            let deadline = job
                .inner
                .spec
                .active_deadline_seconds
                .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

            loop {
                tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
                if job.phase().is_terminal() {
                    return;
                }

                if let Some(deadline) = deadline {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("Job '{}' exceeded its active deadline", job.inner.spec.name);
                        let _ = job
                            .inner
                            .manager
                            .stop(&job.inner.spec.name, Duration::from_secs(1))
                            .await;
                        job.transition(JobPhase::Failed, "DeadlineExceeded", "active deadline exceeded");
                        job.schedule_ttl_cleanup();
                        return;
                    }
                }

                let statuses = job.inner.manager.status_all(&job.inner.spec.name);
                if statuses.is_empty() {
                    job.transition(JobPhase::Failed, "InstancesLost", "no instances found");
                    job.schedule_ttl_cleanup();
                    return;
                }

                let settled: Vec<Option<bool>> = statuses
                    .iter()
                    .map(|s| {
                        Self::instance_settled(s, process_spec.auto_restart, process_spec.retry_count)
                    })
                    .collect();

                let succeeded = settled.iter().filter(|s| **s == Some(true)).count() as u32;
                let failed = settled.iter().filter(|s| **s == Some(false)).count() as u32;
                let active = settled.iter().filter(|s| s.is_none()).count() as u32;
                {
                    let mut status = job.inner.status.write();
                    if !status.phase.is_terminal() {
                        status.active = active;
                        status.succeeded = succeeded;
                        status.failed = failed;
                    }
                }

                if active == 0 {
                    let phase = if succeeded >= 1 {
                        JobPhase::Succeeded
                    } else {
                        JobPhase::Failed
                    };
                    let reason = match phase {
                        JobPhase::Succeeded => "Completed",
                        _ => "InstancesFailed",
                    };
                    job.transition(
                        phase,
                        reason,
                        &format!("{} succeeded, {} failed", succeeded, failed),
                    );
                    job.schedule_ttl_cleanup();
                    return;
                }
            }
        });
    }

    /// Forget the job's spec and instances after the configured TTL
    fn schedule_ttl_cleanup(&self) {
        let Some(ttl) = self.inner.spec.ttl_seconds_after_finished else {
            return;
        };
        let job = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ttl)).await;
            if let Err(e) = job
                .inner
                .manager
                .unregister(&job.inner.spec.name, Duration::from_secs(1))
                .await
            {
                warn!("TTL cleanup of job '{}' failed: {}", job.inner.spec.name, e);
            }
        });
    }
}
