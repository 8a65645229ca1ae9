//! Process manager - registers specs, spawns and supervises instances

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use provisr_core::constants::{CONFIRM_POLL_INTERVAL, DEFAULT_STOP_WAIT};
use provisr_core::{matches_base, Error, HookStage, ProcessSpec, ProcessStatus, Result};
use provisr_events::{ProcessEvent, SinkSet};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::detect;
use crate::hookexec;

/// Poll interval of the per-instance supervision task
const SUPERVISION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One supervised process instance
struct ManagedProcess {
    spec: ProcessSpec,
    index: u32,
    status: ProcessStatus,
    child: Option<Child>,
    /// Set when a stop was requested, so the exit is expected
    stopping: bool,
}

struct Inner {
    specs: RwLock<HashMap<String, ProcessSpec>>,
    procs: RwLock<HashMap<String, ManagedProcess>>,
    /// Base names with a Start call in flight
    starting: Mutex<HashSet<String>>,
    sinks: SinkSet,
    shutdown_tx: broadcast::Sender<()>,
}

/// Process manager
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(sinks: SinkSet) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                specs: RwLock::new(HashMap::new()),
                procs: RwLock::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
                sinks,
                shutdown_tx,
            }),
        }
    }

    /// Register (or re-register) a spec without starting it
    pub fn register(&self, spec: ProcessSpec) -> Result<()> {
        spec.validate()?;
        self.inner.specs.write().insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Stop and forget a spec and all of its instances
    pub async fn unregister(&self, name: &str, wait: Duration) -> Result<()> {
        self.stop(name, wait).await?;
        self.inner.specs.write().remove(name);
        self.inner
            .procs
            .write()
            .retain(|key, _| !matches_base(key, name));
        Ok(())
    }

    /// Start a spec: register it, spawn its instances, confirm liveness.
    ///
    /// Blocks the caller up to StartDuration per instance. On an instance
    /// failure, instances already started by this call are stopped again
    /// in reverse order before the error is returned.
    pub async fn start(&self, spec: ProcessSpec) -> Result<()> {
        spec.validate()?;
        let base = spec.name.clone();

        // Serialize concurrent Start calls for the same base name
        {
            let mut starting = self.inner.starting.lock();
            if !starting.insert(base.clone()) {
                return Err(Error::SpecAlreadyExists(base));
            }
        }
        let result = self.start_locked(spec).await;
        self.inner.starting.lock().remove(&base);
        result
    }

    async fn start_locked(&self, spec: ProcessSpec) -> Result<()> {
        let base = spec.name.clone();
        {
            let procs = self.inner.procs.read();
            let running = procs
                .values()
                .any(|p| matches_base(&p.status.name, &base) && p.status.running);
            if running {
                return Err(Error::SpecAlreadyExists(base));
            }
        }
        self.inner.specs.write().insert(base.clone(), spec.clone());

        info!("Starting '{}' ({} instance(s))", base, spec.instances);

        let mut started: Vec<String> = Vec::new();
        for index in 0..spec.instances {
            match start_instance(&self.inner, &spec, index).await {
                Ok(()) => started.push(spec.instance_name(index)),
                Err(e) => {
                    error!("Failed to start instance {} of '{}': {}", index + 1, base, e);
                    for name in started.iter().rev() {
                        if let Err(stop_err) =
                            stop_instance(&self.inner, name, DEFAULT_STOP_WAIT).await
                        {
                            warn!("Rollback stop of '{}' failed: {}", name, stop_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Start a batch, lower priority first, caller order on ties.
    ///
    /// Failures do not abort the batch; the first error is returned after
    /// every spec was attempted.
    pub async fn start_many(&self, mut specs: Vec<ProcessSpec>) -> Result<()> {
        specs.sort_by_key(|s| s.priority);
        let mut first_err = None;
        for spec in specs {
            let name = spec.name.clone();
            if let Err(e) = self.start(spec).await {
                warn!("Failed to start '{}': {}", name, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every instance of `name` (exact or base pattern).
    ///
    /// Sends SIGTERM, waits up to `wait`, then SIGKILLs. Per-instance
    /// errors are aggregated into one error; unknown names are a no-op.
    pub async fn stop(&self, name: &str, wait: Duration) -> Result<()> {
        let names = self.matching_instances(name);
        let mut failures = Vec::new();
        for instance in names {
            if let Err(e) = stop_instance(&self.inner, &instance, wait).await {
                warn!("Failed to stop '{}': {}", instance, e);
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::stop(name, failures.join("; ")))
        }
    }

    /// Stop every running instance of every registered spec
    pub async fn stop_all(&self, wait: Duration) -> Result<()> {
        let names: Vec<String> = self.inner.procs.read().keys().cloned().collect();
        let mut failures = Vec::new();
        for instance in names {
            if let Err(e) = stop_instance(&self.inner, &instance, wait).await {
                warn!("Failed to stop '{}': {}", instance, e);
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::stop("all", failures.join("; ")))
        }
    }

    /// Status snapshot of one instance by its exact name
    pub fn status(&self, name: &str) -> Option<ProcessStatus> {
        self.inner.procs.read().get(name).map(|p| p.status.clone())
    }

    /// Status snapshots of every instance matching `pattern` (exact name
    /// or base). Unknown patterns yield an empty list, never an error.
    pub fn status_all(&self, pattern: &str) -> Vec<ProcessStatus> {
        let procs = self.inner.procs.read();
        let mut statuses: Vec<ProcessStatus> = procs
            .values()
            .filter(|p| matches_base(&p.status.name, pattern))
            .map(|p| p.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Number of running instances matching `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.inner
            .procs
            .read()
            .values()
            .filter(|p| matches_base(&p.status.name, pattern) && p.status.running)
            .count()
    }

    /// Stop everything and end all supervision tasks
    pub async fn shutdown(&self, wait: Duration) {
        info!("Manager shutting down");
        let _ = self.inner.shutdown_tx.send(());
        if let Err(e) = self.stop_all(wait).await {
            warn!("Shutdown stop failed: {}", e);
        }
    }

    fn matching_instances(&self, pattern: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .procs
            .read()
            .keys()
            .filter(|key| matches_base(key, pattern))
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Outcome of one supervision poll
enum Poll {
    Running,
    /// The entry is gone or another task took the child
    Detached,
    Exited {
        pid: Option<u32>,
        code: Option<i32>,
        expected: bool,
    },
}

fn poll_instance(inner: &Inner, name: &str) -> Poll {
    let mut procs = inner.procs.write();
    let Some(p) = procs.get_mut(name) else {
        return Poll::Detached;
    };
    let Some(child) = p.child.as_mut() else {
        return Poll::Detached;
    };
    match child.try_wait() {
        Ok(Some(status)) => {
            let pid = p.status.pid;
            p.child = None;
            p.status.running = false;
            p.status.pid = None;
            p.status.stopped_at = Some(Utc::now());
            p.status.last_exit_code = status.code();
            p.status.last_error = match status.code() {
                Some(0) => None,
                Some(code) => Some(format!("exit code {}", code)),
                None => Some("killed by signal".to_string()),
            };
            Poll::Exited {
                pid,
                code: status.code(),
                expected: p.stopping,
            }
        }
        Ok(None) => Poll::Running,
        Err(e) => {
            warn!("Error checking '{}': {}", name, e);
            Poll::Running
        }
    }
}

/// Per-instance supervision task: reaps exits, runs post-stop hooks,
/// and relaunches when auto-restart applies.
fn spawn_supervision(inner: Arc<Inner>, name: String) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(SUPERVISION_POLL_INTERVAL) => {
                    let outcome = poll_instance(&inner, &name);
                    match outcome {
                        Poll::Running => {}
                        Poll::Detached => break,
                        Poll::Exited { pid, code, expected } => {
                            let snapshot = {
                                let procs = inner.procs.read();
                                procs.get(&name).map(|p| (p.spec.clone(), p.index, p.status.restarts))
                            };
                            let Some((spec, index, restarts)) = snapshot else { break };

                            finish_instance(&inner, &spec, index, &name, pid, code).await;

                            if expected {
                                break;
                            }
                            warn!("Process '{}' exited unexpectedly (code {:?})", name, code);

                            let failed = code != Some(0);
                            let budget_left = spec.retry_count == 0 || restarts < spec.retry_count;
                            if !(spec.auto_restart && failed && budget_left) {
                                break;
                            }

                            tokio::time::sleep(spec.restart_interval).await;
                            // A stop or unregister during the restart
                            // window cancels the relaunch.
                            let cancelled = {
                                let procs = inner.procs.read();
                                procs.get(&name).map(|p| p.stopping).unwrap_or(true)
                            };
                            if cancelled {
                                break;
                            }
                            info!("Auto-restarting '{}' (restart {})", name, restarts + 1);
                            match spawn_with_retries(&spec, index, &name).await {
                                Ok((mut child, new_pid)) => {
                                    {
                                        let mut procs = inner.procs.write();
                                        let Some(p) = procs.get_mut(&name) else {
                                            let _ = child.start_kill();
                                            break;
                                        };
                                        p.child = Some(child);
                                        p.status.running = true;
                                        p.status.pid = Some(new_pid);
                                        p.status.started_at = Some(Utc::now());
                                        p.status.stopped_at = None;
                                        p.status.restarts = restarts + 1;
                                    }
                                    inner.sinks.record(ProcessEvent::Started {
                                        name: name.clone(),
                                        pid: new_pid,
                                        started_at: Utc::now(),
                                    });
                                    dispatch_post_start(&spec, &name, new_pid);
                                }
                                Err(e) => {
                                    error!("Auto-restart of '{}' failed: {}", name, e);
                                    let mut procs = inner.procs.write();
                                    if let Some(p) = procs.get_mut(&name) {
                                        p.status.last_error = Some(e.to_string());
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    });
}

/// Start one instance: pre-start hooks, spawn with retries, record,
/// post-start hooks, supervision task.
async fn start_instance(inner: &Arc<Inner>, spec: &ProcessSpec, index: u32) -> Result<()> {
    let name = spec.instance_name(index);

    hookexec::run_stage(&spec.lifecycle, HookStage::PreStart, &name, None).await?;

    let (child, pid) = spawn_with_retries(spec, index, &name).await?;

    {
        let mut procs = inner.procs.write();
        procs.insert(
            name.clone(),
            ManagedProcess {
                spec: spec.clone(),
                index,
                status: ProcessStatus::running(&name, pid),
                child: Some(child),
                stopping: false,
            },
        );
    }

    inner.sinks.record(ProcessEvent::Started {
        name: name.clone(),
        pid,
        started_at: Utc::now(),
    });

    dispatch_post_start(spec, &name, pid);
    spawn_supervision(Arc::clone(inner), name);
    Ok(())
}

/// Post-start hooks fire once the command is confirmed started,
/// independent of its later fate.
fn dispatch_post_start(spec: &ProcessSpec, name: &str, pid: u32) {
    if spec.lifecycle.post_start.is_empty() {
        return;
    }
    let lifecycle = spec.lifecycle.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = hookexec::run_stage(&lifecycle, HookStage::PostStart, &name, Some(pid)).await
        {
            error!("Post-start hooks for '{}' failed: {}", name, e);
        }
    });
}

/// Spawn-and-confirm with the spec's retry budget.
///
/// Start returns an error only after retry_count + 1 total failures.
async fn spawn_with_retries(spec: &ProcessSpec, index: u32, name: &str) -> Result<(Child, u32)> {
    let total = spec.retry_count + 1;
    let mut last = String::new();
    for attempt in 1..=total {
        match spawn_and_confirm(spec, index, name).await {
            Ok(ok) => return Ok(ok),
            Err(e) => {
                last = e.to_string();
                warn!("Start attempt {}/{} for '{}' failed: {}", attempt, total, name, last);
                if attempt < total {
                    tokio::time::sleep(spec.retry_interval).await;
                }
            }
        }
    }
    Err(Error::StartFailed {
        name: name.to_string(),
        attempts: total,
        reason: last,
    })
}

/// Spawn the command and hold it through the confirmation window,
/// polling detectors and the child handle.
async fn spawn_and_confirm(spec: &ProcessSpec, index: u32, name: &str) -> Result<(Child, u32)> {
    let mut cmd = build_command(spec)?;
    let mut child = cmd.spawn().map_err(|e| Error::spawn(name, e.to_string()))?;
    let pid = match child.id() {
        Some(pid) => pid,
        None => return Err(Error::spawn(name, "exited before a pid was available")),
    };

    let pid_file = instance_pid_file(spec, index);
    if let Some(path) = &pid_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, pid.to_string()) {
            warn!("Failed to write pidfile {}: {}", path.display(), e);
        }
    }

    let deadline = tokio::time::Instant::now() + spec.start_duration;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                remove_pid_file(&pid_file);
                return Err(Error::spawn(
                    name,
                    format!(
                        "exited during confirmation window (code {:?})",
                        status.code()
                    ),
                ));
            }
            Ok(None) => {}
            Err(e) => warn!("Error checking '{}' during confirmation: {}", name, e),
        }

        if !spec.detectors.is_empty() && !detect::any_alive(&spec.detectors).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            remove_pid_file(&pid_file);
            return Err(Error::spawn(name, "detectors report dead during confirmation window"));
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(CONFIRM_POLL_INTERVAL.min(deadline - now)).await;
    }

    debug!("Confirmed '{}' alive (pid {})", name, pid);
    Ok((child, pid))
}

fn build_command(spec: &ProcessSpec) -> Result<Command> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&spec.command);
    if let Some(dir) = &spec.work_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(&spec.env);
    match &spec.log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let stdout = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let stderr = stdout.try_clone()?;
            cmd.stdout(Stdio::from(stdout));
            cmd.stderr(Stdio::from(stderr));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }
    Ok(cmd)
}

/// Pidfile path for instance `index`; multi-instance specs get the
/// instance number folded into the file name.
fn instance_pid_file(spec: &ProcessSpec, index: u32) -> Option<PathBuf> {
    let base = spec.pid_file.as_ref()?;
    if spec.instances <= 1 {
        return Some(base.clone());
    }
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("pid");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, index + 1, ext),
        None => format!("{}-{}", stem, index + 1),
    };
    Some(base.with_file_name(name))
}

fn remove_pid_file(path: &Option<PathBuf>) {
    if let Some(path) = path {
        let _ = std::fs::remove_file(path);
    }
}

/// Cleanup after an instance fully exited: pidfile removal, stop event,
/// post-stop hooks (always, regardless of exit reason).
async fn finish_instance(
    inner: &Inner,
    spec: &ProcessSpec,
    index: u32,
    name: &str,
    pid: Option<u32>,
    code: Option<i32>,
) {
    remove_pid_file(&instance_pid_file(spec, index));

    let last_error = match code {
        Some(0) => None,
        Some(c) => Some(format!("exit code {}", c)),
        None => Some("killed by signal".to_string()),
    };
    inner.sinks.record(ProcessEvent::Stopped {
        name: name.to_string(),
        pid,
        stopped_at: Utc::now(),
        last_error,
    });

    if let Err(e) = hookexec::run_stage(&spec.lifecycle, HookStage::PostStop, name, pid).await {
        error!("Post-stop hooks for '{}' failed: {}", name, e);
    }
}

/// Stop one instance: pre-stop hooks, SIGTERM, bounded wait, SIGKILL.
async fn stop_instance(inner: &Arc<Inner>, name: &str, wait: Duration) -> Result<()> {
    let (spec, pid) = {
        let mut procs = inner.procs.write();
        match procs.get_mut(name) {
            Some(p) if p.status.running => {
                p.stopping = true;
                (p.spec.clone(), p.status.pid)
            }
            Some(p) => {
                // Not running, but mark it so a pending auto-restart
                // relaunch is cancelled.
                p.stopping = true;
                return Ok(());
            }
            None => return Ok(()),
        }
    };

    // Pre-stop hooks run before any signal is sent; a Fail-mode hook
    // failure aborts the stop.
    if let Err(e) = hookexec::run_stage(&spec.lifecycle, HookStage::PreStop, name, pid).await {
        let mut procs = inner.procs.write();
        if let Some(p) = procs.get_mut(name) {
            p.stopping = false;
        }
        return Err(e);
    }

    let (child, index) = {
        let mut procs = inner.procs.write();
        match procs.get_mut(name) {
            Some(p) => (p.child.take(), p.index),
            None => return Ok(()),
        }
    };
    // The supervision task may have reaped the exit in the meantime
    let Some(mut child) = child else {
        return Ok(());
    };

    info!("Stopping '{}'", name);
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }

    let code = match tokio::time::timeout(wait, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!("Error waiting for '{}': {}", name, e);
            None
        }
        Err(_) => {
            warn!("'{}' did not stop gracefully, sending SIGKILL", name);
            let _ = child.kill().await;
            None
        }
    };

    {
        let mut procs = inner.procs.write();
        if let Some(p) = procs.get_mut(name) {
            p.status.running = false;
            p.status.pid = None;
            p.status.stopped_at = Some(Utc::now());
            p.status.last_exit_code = code;
        }
    }

    finish_instance(inner, &spec, index, name, pid, code).await;
    Ok(())
}
