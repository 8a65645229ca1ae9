//! Lifecycle hook execution engine
//!
//! Hooks run through the shell with `PROVISR_PROCESS`, `PROVISR_STAGE`,
//! and `PROVISR_PID` in their environment. Blocking hooks gate the
//! caller; async hooks are dispatched on detached tasks and only logged.

use provisr_core::{Error, FailureMode, Hook, HookStage, LifecycleHooks, Result, RunMode};
use provisr_core::constants::{HOOK_RETRY_ATTEMPTS, HOOK_TIMEOUT};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Delay between attempts of a FailureMode::Retry hook
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run every hook of a stage in list order.
///
/// Blocking hooks complete (or abort) before the next hook is considered;
/// async hooks are spawned and immediately left behind. The returned
/// error is the first blocking Fail-mode failure.
pub async fn run_stage(
    hooks: &LifecycleHooks,
    stage: HookStage,
    process: &str,
    pid: Option<u32>,
) -> Result<()> {
    for hook in hooks.stage(stage) {
        match hook.run_mode {
            RunMode::Async => {
                let hook = hook.clone();
                let process = process.to_string();
                tokio::spawn(async move {
                    if let Err(e) = run_hook(&hook, stage, &process, pid).await {
                        error!("Async hook '{}' ({}) failed: {}", hook.name, stage, e);
                    }
                });
            }
            RunMode::Blocking => run_hook(hook, stage, process, pid).await?,
        }
    }
    Ok(())
}

/// Run one hook, applying its failure mode
async fn run_hook(hook: &Hook, stage: HookStage, process: &str, pid: Option<u32>) -> Result<()> {
    let attempts = match hook.failure_mode {
        FailureMode::Retry => HOOK_RETRY_ATTEMPTS,
        _ => 1,
    };

    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        match exec_hook_command(hook, stage, process, pid).await {
            Ok(output) => {
                if !output.is_empty() {
                    debug!("Hook '{}' ({}) output: {}", hook.name, stage, output);
                }
                info!("Hook '{}' ({}) completed for {}", hook.name, stage, process);
                return Ok(());
            }
            Err(reason) => {
                last_reason = reason;
                match hook.failure_mode {
                    FailureMode::Fail => {
                        return Err(Error::HookFailed {
                            hook: hook.name.clone(),
                            reason: last_reason,
                        });
                    }
                    FailureMode::Ignore => {
                        warn!(
                            "Hook '{}' ({}) failed, ignoring: {}",
                            hook.name, stage, last_reason
                        );
                        return Ok(());
                    }
                    FailureMode::Retry => {
                        warn!(
                            "Hook '{}' ({}) failed (attempt {}/{}): {}",
                            hook.name, stage, attempt, attempts, last_reason
                        );
                        if attempt < attempts {
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    Err(Error::HookFailed {
        hook: hook.name.clone(),
        reason: format!("retries exhausted: {}", last_reason),
    })
}

/// Execute the hook command once, capturing its output
async fn exec_hook_command(
    hook: &Hook,
    stage: HookStage,
    process: &str,
    pid: Option<u32>,
) -> std::result::Result<String, String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&hook.command);
    cmd.envs(&hook.env);
    cmd.env("PROVISR_PROCESS", process);
    cmd.env("PROVISR_STAGE", stage.as_str());
    if let Some(pid) = pid {
        cmd.env("PROVISR_PID", pid.to_string());
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let result = tokio::time::timeout(HOOK_TIMEOUT, cmd.output()).await;

    match result {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                Err(format!(
                    "exited with code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
        }
        Ok(Err(e)) => Err(format!("failed to execute: {}", e)),
        Err(_) => Err(format!("timed out after {:?}", HOOK_TIMEOUT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hook_stage(hook: Hook) -> LifecycleHooks {
        LifecycleHooks {
            pre_start: vec![hook],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_blocking_hook_success() {
        let hooks = one_hook_stage(Hook::new("ok", "echo hello"));
        assert!(run_stage(&hooks, HookStage::PreStart, "web", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_env_vars_reach_hook() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let hooks = one_hook_stage(Hook::new(
            "env",
            format!("echo $PROVISR_PROCESS:$PROVISR_STAGE:$PROVISR_PID > {}", out.display()),
        ));

        run_stage(&hooks, HookStage::PreStart, "web-1", Some(42)).await.unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content.trim(), "web-1:pre_start:42");
    }

    #[tokio::test]
    async fn test_fail_mode_aborts() {
        let hooks = one_hook_stage(Hook::new("bad", "exit 1"));
        let result = run_stage(&hooks, HookStage::PreStart, "web", None).await;
        assert!(matches!(result, Err(Error::HookFailed { hook, .. }) if hook == "bad"));
    }

    #[tokio::test]
    async fn test_ignore_mode_proceeds() {
        let hooks = one_hook_stage(
            Hook::new("bad", "exit 1").with_failure_mode(FailureMode::Ignore),
        );
        assert!(run_stage(&hooks, HookStage::PreStart, "web", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_mode_eventually_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("tried");
        // Fails the first time, succeeds once the marker exists
        let script = format!(
            "if [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let hooks = one_hook_stage(Hook::new("flaky", script).with_failure_mode(FailureMode::Retry));

        assert!(run_stage(&hooks, HookStage::PreStart, "web", None).await.is_ok());
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_retry_mode_exhausts() {
        let hooks = one_hook_stage(
            Hook::new("bad", "exit 1").with_failure_mode(FailureMode::Retry),
        );
        let result = run_stage(&hooks, HookStage::PreStart, "web", None).await;
        assert!(matches!(result, Err(Error::HookFailed { .. })));
    }

    #[tokio::test]
    async fn test_async_hook_does_not_block() {
        let hooks = one_hook_stage(
            Hook::new("slow", "sleep 5").with_run_mode(RunMode::Async),
        );
        let start = std::time::Instant::now();
        run_stage(&hooks, HookStage::PreStart, "web", None).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_async_hook_failure_does_not_abort() {
        let hooks = one_hook_stage(
            Hook::new("bad", "exit 1").with_run_mode(RunMode::Async),
        );
        assert!(run_stage(&hooks, HookStage::PreStart, "web", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_hooks_run_in_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("order.txt");
        let hooks = LifecycleHooks {
            pre_start: vec![
                Hook::new("first", format!("echo a >> {}", out.display())),
                Hook::new("second", format!("echo b >> {}", out.display())),
            ],
            ..Default::default()
        };

        run_stage(&hooks, HookStage::PreStart, "web", None).await.unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content, "a\nb\n");
    }
}
