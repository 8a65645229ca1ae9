//! Liveness detectors
//!
//! A detector decides whether a process instance is alive. Evaluation
//! over a list goes pidfile detectors first, then fixed pids, then probe
//! commands, and short-circuits on the first detector that reports alive.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use provisr_core::Detector;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Hard timeout for a probe command
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Check whether a pid refers to a live process (signal 0 probe)
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn pidfile_alive(path: &Path) -> bool {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    match content.trim().parse::<u32>() {
        Ok(pid) => pid_alive(pid),
        Err(_) => {
            warn!("Pidfile {} does not contain a pid", path.display());
            false
        }
    }
}

async fn probe_alive(command: &str) -> bool {
    let result = timeout(
        PROBE_TIMEOUT,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;

    match result {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            warn!("Probe command failed to run: {}", e);
            false
        }
        Err(_) => {
            warn!("Probe command timed out: {}", command);
            false
        }
    }
}

/// Evaluate a single detector
pub async fn detector_alive(detector: &Detector) -> bool {
    match detector {
        Detector::PidFile { path } => pidfile_alive(path),
        Detector::Pid { pid } => pid_alive(*pid),
        Detector::Command { command } => probe_alive(command).await,
    }
}

/// Evaluate a detector list: alive if any detector reports alive.
///
/// Pidfile detectors are consulted before pid detectors, which are
/// consulted before probe commands; the first hit short-circuits.
pub async fn any_alive(detectors: &[Detector]) -> bool {
    let by_kind = |want: fn(&Detector) -> bool| detectors.iter().filter(move |d| want(d));

    for detector in by_kind(|d| matches!(d, Detector::PidFile { .. }))
        .chain(by_kind(|d| matches!(d, Detector::Pid { .. })))
        .chain(by_kind(|d| matches!(d, Detector::Command { .. })))
    {
        if detector_alive(detector).await {
            debug!("Detector reported alive: {:?}", detector);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pid_alive_self() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_pid_alive_bogus() {
        // Max pid space on Linux is well below this
        assert!(!pid_alive(4_000_000));
    }

    #[tokio::test]
    async fn test_pidfile_detector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", std::process::id()).unwrap();

        let detector = Detector::PidFile {
            path: file.path().to_path_buf(),
        };
        assert!(detector_alive(&detector).await);
    }

    #[tokio::test]
    async fn test_pidfile_detector_missing_file() {
        let detector = Detector::PidFile {
            path: "/nonexistent/provisr-test.pid".into(),
        };
        assert!(!detector_alive(&detector).await);
    }

    #[tokio::test]
    async fn test_pidfile_detector_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not-a-pid").unwrap();

        let detector = Detector::PidFile {
            path: file.path().to_path_buf(),
        };
        assert!(!detector_alive(&detector).await);
    }

    #[tokio::test]
    async fn test_command_detector() {
        assert!(detector_alive(&Detector::Command { command: "true".to_string() }).await);
        assert!(!detector_alive(&Detector::Command { command: "false".to_string() }).await);
    }

    #[tokio::test]
    async fn test_any_alive_empty() {
        assert!(!any_alive(&[]).await);
    }

    #[tokio::test]
    async fn test_any_alive_short_circuits_on_first_hit() {
        let detectors = vec![
            Detector::Pid { pid: std::process::id() },
            Detector::Command { command: "sleep 30".to_string() },
        ];
        // The pid detector hits first; the slow probe must not run
        let start = std::time::Instant::now();
        assert!(any_alive(&detectors).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_any_alive_all_dead() {
        let detectors = vec![
            Detector::Pid { pid: 4_000_000 },
            Detector::Command { command: "false".to_string() },
        ];
        assert!(!any_alive(&detectors).await);
    }
}
