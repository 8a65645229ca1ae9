//! Event and metric payloads handed to the optional collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supervision events keyed by (name, pid, timestamp) for the persistence sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// Instance confirmed started
    Started {
        name: String,
        pid: u32,
        started_at: DateTime<Utc>,
    },

    /// Instance exited or was stopped
    Stopped {
        name: String,
        pid: Option<u32>,
        stopped_at: DateTime<Utc>,
        last_error: Option<String>,
    },
}

impl ProcessEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ProcessEvent::Started { .. } => "start",
            ProcessEvent::Stopped { .. } => "stop",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProcessEvent::Started { name, .. } | ProcessEvent::Stopped { name, .. } => name,
        }
    }
}

/// Scheduler observations for the metrics sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronMetric {
    /// One job finished in the given phase
    JobOutcome { cronjob: String, phase: String },

    /// Current size of the active-job set
    ActiveJobs { cronjob: String, count: usize },

    /// Next and last schedule timestamps
    ScheduleTimes {
        cronjob: String,
        next: Option<DateTime<Utc>>,
        last: Option<DateTime<Utc>>,
    },

    /// Wall-clock duration of a finished job
    JobDuration { cronjob: String, secs: f64 },
}

impl CronMetric {
    pub fn cronjob(&self) -> &str {
        match self {
            CronMetric::JobOutcome { cronjob, .. }
            | CronMetric::ActiveJobs { cronjob, .. }
            | CronMetric::ScheduleTimes { cronjob, .. }
            | CronMetric::JobDuration { cronjob, .. } => cronjob,
        }
    }
}
