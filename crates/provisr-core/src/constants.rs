//! Constants and default values for Provisr

use std::path::PathBuf;
use std::time::Duration;

/// Default Provisr home directory name
pub const PROVISR_DIR: &str = ".provisr";

/// Default pidfile directory name
pub const PIDFILES_DIR: &str = "pids";

/// Default log directory name
pub const LOGS_DIR: &str = "logs";

/// Default interval between failed start attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default delay before an auto-restart relaunch
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_millis(500);

/// Default graceful-stop wait before SIGKILL
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(3);

/// Poll interval while confirming liveness inside the start window
pub const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Total attempts for a hook under FailureMode::Retry
pub const HOOK_RETRY_ATTEMPTS: u32 = 3;

/// Hard timeout for a single hook execution
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default BackoffLimit for jobs
pub const DEFAULT_BACKOFF_LIMIT: u32 = 6;

/// Default number of successful job records kept per cronjob
pub const DEFAULT_SUCCESS_HISTORY_LIMIT: usize = 3;

/// Default number of failed job records kept per cronjob
pub const DEFAULT_FAILED_HISTORY_LIMIT: usize = 1;

/// Get the Provisr home directory
pub fn provisr_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(PROVISR_DIR))
        .unwrap_or_else(|| PathBuf::from(PROVISR_DIR))
}

/// Get the pidfile directory
pub fn pidfiles_dir() -> PathBuf {
    provisr_home().join(PIDFILES_DIR)
}

/// Get the logs directory
pub fn logs_dir() -> PathBuf {
    provisr_home().join(LOGS_DIR)
}
