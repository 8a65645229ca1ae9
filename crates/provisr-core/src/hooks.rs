//! Lifecycle hook types and validation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

use crate::error::{Error, Result};

/// What to do when a hook command fails
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Abort the surrounding operation
    #[default]
    Fail,
    /// Re-attempt the hook itself, bounded
    Retry,
    /// Log and proceed
    Ignore,
}

/// How a hook is dispatched relative to the caller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// The caller waits for the hook to finish
    #[default]
    Blocking,
    /// Dispatched on a detached task
    Async,
}

/// A small command run at a named lifecycle point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Hook {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            failure_mode: FailureMode::default(),
            run_mode: RunMode::default(),
            env: HashMap::new(),
        }
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.run_mode = mode;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// The lifecycle point a hook list is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::PreStart => "pre_start",
            HookStage::PostStart => "post_start",
            HookStage::PreStop => "pre_stop",
            HookStage::PostStop => "post_stop",
        }
    }
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered hook lists around start and stop, validated as a unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleHooks {
    #[serde(default)]
    pub pre_start: Vec<Hook>,
    #[serde(default)]
    pub post_start: Vec<Hook>,
    #[serde(default)]
    pub pre_stop: Vec<Hook>,
    #[serde(default)]
    pub post_stop: Vec<Hook>,
}

impl LifecycleHooks {
    pub fn is_empty(&self) -> bool {
        self.pre_start.is_empty()
            && self.post_start.is_empty()
            && self.pre_stop.is_empty()
            && self.post_stop.is_empty()
    }

    /// Get the hook list for a stage, in execution order
    pub fn stage(&self, stage: HookStage) -> &[Hook] {
        match stage {
            HookStage::PreStart => &self.pre_start,
            HookStage::PostStart => &self.post_start,
            HookStage::PreStop => &self.pre_stop,
            HookStage::PostStop => &self.post_stop,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Hook> {
        self.pre_start
            .iter()
            .chain(self.post_start.iter())
            .chain(self.pre_stop.iter())
            .chain(self.post_stop.iter())
    }

    /// Every hook needs a non-empty name, unique across all four lists
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for hook in self.all() {
            if hook.name.trim().is_empty() {
                return Err(Error::invalid_field("hook.name", "must not be empty"));
            }
            if hook.command.trim().is_empty() {
                return Err(Error::invalid_field(
                    format!("{}.command", hook.name),
                    "must not be empty",
                ));
            }
            if !seen.insert(hook.name.as_str()) {
                return Err(Error::DuplicateHook(hook.name.clone()));
            }
        }
        Ok(())
    }

    /// Effective hooks for a job created from a cronjob template.
    ///
    /// Pre-lists put the cronjob's hooks first, post-lists put them last,
    /// so cronjob-level hooks wrap the template's. Both inputs are cloned;
    /// the merged set is not re-validated across sources.
    pub fn merge_for_job(cronjob: &LifecycleHooks, template: &LifecycleHooks) -> LifecycleHooks {
        let concat = |a: &[Hook], b: &[Hook]| -> Vec<Hook> {
            a.iter().chain(b.iter()).cloned().collect()
        };
        LifecycleHooks {
            pre_start: concat(&cronjob.pre_start, &template.pre_start),
            post_start: concat(&template.post_start, &cronjob.post_start),
            pre_stop: concat(&cronjob.pre_stop, &template.pre_stop),
            post_stop: concat(&template.post_stop, &cronjob.post_stop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_ok() {
        assert!(LifecycleHooks::default().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        let hooks = LifecycleHooks {
            pre_start: vec![Hook::new("", "echo hi")],
            ..Default::default()
        };
        assert!(hooks.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_within_list() {
        let hooks = LifecycleHooks {
            pre_start: vec![Hook::new("a", "echo 1"), Hook::new("a", "echo 2")],
            ..Default::default()
        };
        assert!(matches!(hooks.validate(), Err(Error::DuplicateHook(n)) if n == "a"));
    }

    #[test]
    fn test_validate_duplicate_across_lists() {
        let hooks = LifecycleHooks {
            pre_start: vec![Hook::new("a", "echo 1")],
            post_start: vec![Hook::new("a", "echo 2")],
            ..Default::default()
        };
        assert!(matches!(hooks.validate(), Err(Error::DuplicateHook(n)) if n == "a"));
    }

    #[test]
    fn test_validate_distinct_names_ok() {
        let hooks = LifecycleHooks {
            pre_start: vec![Hook::new("a", "echo 1")],
            post_start: vec![Hook::new("b", "echo 2")],
            pre_stop: vec![Hook::new("c", "echo 3")],
            post_stop: vec![Hook::new("d", "echo 4")],
        };
        assert!(hooks.validate().is_ok());
    }

    #[test]
    fn test_merge_order() {
        let cronjob = LifecycleHooks {
            pre_start: vec![Hook::new("cj-pre", "true")],
            post_start: vec![Hook::new("cj-post", "true")],
            pre_stop: vec![Hook::new("cj-prestop", "true")],
            post_stop: vec![Hook::new("cj-poststop", "true")],
        };
        let template = LifecycleHooks {
            pre_start: vec![Hook::new("t-pre", "true")],
            post_start: vec![Hook::new("t-post", "true")],
            pre_stop: vec![Hook::new("t-prestop", "true")],
            post_stop: vec![Hook::new("t-poststop", "true")],
        };

        let merged = LifecycleHooks::merge_for_job(&cronjob, &template);

        let names = |hooks: &[Hook]| hooks.iter().map(|h| h.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&merged.pre_start), vec!["cj-pre", "t-pre"]);
        assert_eq!(names(&merged.post_start), vec!["t-post", "cj-post"]);
        assert_eq!(names(&merged.pre_stop), vec!["cj-prestop", "t-prestop"]);
        assert_eq!(names(&merged.post_stop), vec!["t-poststop", "cj-poststop"]);
    }

    #[test]
    fn test_merge_does_not_mutate_template() {
        let cronjob = LifecycleHooks::default();
        let template = LifecycleHooks {
            pre_start: vec![Hook::new("t-pre", "true")],
            ..Default::default()
        };
        let merged = LifecycleHooks::merge_for_job(&cronjob, &template);
        assert_eq!(merged.pre_start.len(), 1);
        assert_eq!(template.pre_start.len(), 1);
        assert_eq!(template.pre_start[0].name, "t-pre");
    }
}
