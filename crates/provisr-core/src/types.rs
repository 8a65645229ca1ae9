//! Core types for Provisr

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::hooks::LifecycleHooks;
use once_cell::sync::Lazy;
use regex::Regex;

// Default value functions for serde
fn default_instances() -> u32 {
    1
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

fn default_restart_interval() -> Duration {
    DEFAULT_RESTART_INTERVAL
}

/// Regex pattern for valid process names: only alphanumeric, underscore, and hyphen
static PROCESS_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid process name regex"));

/// Validate a process name to prevent path traversal through pidfile/log paths.
/// Only allows alphanumeric characters, underscores, and hyphens.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty() && PROCESS_NAME_REGEX.is_match(name)
}

/// Name of instance `index` under a base name.
///
/// Single-instance specs keep the bare base name; multi-instance specs
/// get a numeric suffix.
pub fn instance_name(base: &str, index: u32, total: u32) -> String {
    if total <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, index + 1)
    }
}

/// Check whether `name` belongs to `pattern`: either an exact match or an
/// instance of the base (`web` matches `web`, `web-1`, `web-2`, ...).
pub fn matches_base(name: &str, pattern: &str) -> bool {
    if name == pattern {
        return true;
    }
    match name.strip_prefix(pattern) {
        Some(rest) => {
            let rest = match rest.strip_prefix('-') {
                Some(r) => r,
                None => return false,
            };
            !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Liveness detector - decides whether a process instance is alive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detector {
    /// Read a pidfile and probe the pid it contains
    PidFile { path: PathBuf },
    /// Probe a fixed pid
    Pid { pid: u32 },
    /// Run a probe command; exit 0 means alive
    Command { command: String },
}

/// Process specification - defines how to run and supervise a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Extra start attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Confirmation window: how long a fresh instance must stay alive
    /// before Start counts it as started
    #[serde(default, with = "humantime_serde")]
    pub start_duration: Duration,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_restart_interval", with = "humantime_serde")]
    pub restart_interval: Duration,
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Start ordering for batch starts; lower starts first, ties keep
    /// caller order
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub detectors: Vec<Detector>,
    #[serde(default)]
    pub lifecycle: LifecycleHooks,
    /// Append stdout/stderr of the child to this file
    #[serde(default)]
    pub log: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            work_dir: None,
            env: HashMap::new(),
            pid_file: None,
            retry_count: 0,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            start_duration: Duration::ZERO,
            auto_restart: false,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            instances: 1,
            priority: 0,
            detectors: Vec::new(),
            lifecycle: LifecycleHooks::default(),
            log: None,
        }
    }

    /// Check the semantic invariants (syntax validation happens upstream)
    pub fn validate(&self) -> Result<()> {
        if !validate_name(&self.name) {
            return Err(Error::invalid_spec(
                self.name.clone(),
                "name must be non-empty and contain only alphanumeric characters, underscores, and hyphens",
            ));
        }
        if self.command.trim().is_empty() {
            return Err(Error::invalid_spec(&self.name, "command must not be empty"));
        }
        if self.instances < 1 {
            return Err(Error::invalid_spec(&self.name, "instances must be >= 1"));
        }
        self.lifecycle.validate()?;
        Ok(())
    }

    /// Name of instance `index` of this spec
    pub fn instance_name(&self, index: u32) -> String {
        instance_name(&self.name, index, self.instances)
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn with_retries(mut self, count: u32, interval: Duration) -> Self {
        self.retry_count = count;
        self.retry_interval = interval;
        self
    }

    pub fn with_start_duration(mut self, window: Duration) -> Self {
        self.start_duration = window;
        self
    }

    pub fn with_auto_restart(mut self, restart: bool) -> Self {
        self.auto_restart = restart;
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_detectors(mut self, detectors: Vec<Detector>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleHooks) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }
}

/// Runtime snapshot of one process instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ProcessStatus {
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            running: false,
            started_at: None,
            stopped_at: None,
            restarts: 0,
            last_exit_code: None,
            last_error: None,
        }
    }

    pub fn running(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid: Some(pid),
            running: true,
            started_at: Some(Utc::now()),
            stopped_at: None,
            restarts: 0,
            last_exit_code: None,
            last_error: None,
        }
    }
}

/// A named set of specs started and stopped as one unit.
///
/// Stateless: the member list is caller-authoritative and the group is
/// reconstructed per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub members: Vec<ProcessSpec>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, members: Vec<ProcessSpec>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web"));
        assert!(validate_name("web-1"));
        assert!(validate_name("my_app2"));
        assert!(!validate_name(""));
        assert!(!validate_name("../etc/passwd"));
        assert!(!validate_name("my app"));
    }

    #[test]
    fn test_instance_name_single() {
        assert_eq!(instance_name("web", 0, 1), "web");
    }

    #[test]
    fn test_instance_name_multi() {
        assert_eq!(instance_name("web", 0, 3), "web-1");
        assert_eq!(instance_name("web", 2, 3), "web-3");
    }

    #[test]
    fn test_matches_base() {
        assert!(matches_base("web", "web"));
        assert!(matches_base("web-1", "web"));
        assert!(matches_base("web-12", "web"));
        assert!(!matches_base("web-", "web"));
        assert!(!matches_base("webapp", "web"));
        assert!(!matches_base("web-x", "web"));
        assert!(!matches_base("other", "web"));
    }

    #[test]
    fn test_spec_validate_ok() {
        let spec = ProcessSpec::new("web", "sleep 1");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_validate_empty_command() {
        let spec = ProcessSpec::new("web", "  ");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_validate_bad_name() {
        let spec = ProcessSpec::new("../evil", "sleep 1");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_validate_zero_instances() {
        let mut spec = ProcessSpec::new("web", "sleep 1");
        spec.instances = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_builder() {
        let spec = ProcessSpec::new("web", "sleep 1")
            .with_instances(3)
            .with_priority(-5)
            .with_auto_restart(true);
        assert_eq!(spec.instances, 3);
        assert_eq!(spec.priority, -5);
        assert!(spec.auto_restart);
        assert_eq!(spec.instance_name(1), "web-2");
    }

    #[test]
    fn test_detector_unknown_type_is_error() {
        let parsed: std::result::Result<Detector, _> =
            serde_json::from_str(r#"{"type":"socket","path":"/tmp/x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_detector_roundtrip_tags() {
        let d: Detector = serde_json::from_str(r#"{"type":"pid","pid":42}"#).unwrap();
        assert_eq!(d, Detector::Pid { pid: 42 });
        let d: Detector =
            serde_json::from_str(r#"{"type":"command","command":"pgrep nginx"}"#).unwrap();
        assert!(matches!(d, Detector::Command { .. }));
    }
}
