//! Provisr Job and CronJob scheduling
//!
//! A Job turns a one-shot job description into a supervised process and
//! tracks a Pending -> Running -> {Succeeded, Failed} state machine. A
//! CronJob owns a schedule and a concurrency policy and creates Jobs per
//! tick; the CronRegistry is the management surface over named cronjobs.

mod cronjob;
mod job;
mod registry;
mod schedule;

pub use cronjob::{ConcurrencyPolicy, CronJob, CronJobSpec, CronJobStatus, HistoryEntry, JobReference};
pub use job::{CompletionMode, Job, JobCondition, JobPhase, JobSpec, JobStatus, RestartPolicy};
pub use registry::CronRegistry;
pub use schedule::Schedule;
