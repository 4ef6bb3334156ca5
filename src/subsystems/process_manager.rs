// src/subsystems/process_manager.rs
//! Bounded pool of OS subprocesses
//!
//! Each started process takes one admission slot and gets a waiter task that
//! owns the [`Child`]. The waiter is the only writer of the terminal state
//! and the only task that signals the child: it records `Completed`/`Failed`
//! on natural exit and `Killed` when a stop or kill was requested, the type's
//! timeout expired or the manager shut down.
//!
//! Finishing and releasing are separate steps. A finished process keeps its
//! slot until [`ProcessManager::cleanup_process`] so callers can inspect it.
//! Shutdowns are counted once per process, when its slot is released.
//!
//! Shutdown is driven by a cancellation token owned by the manager (a child
//! of the one passed to [`ProcessManager::with_shutdown`]); no process-wide
//! signal handlers are installed.

use crate::admission::{AdmissionGate, GatePermit};
use crate::subsystems::resource_limiter::{ResourceLimiter, ResourceLimits};
use crate::utils::config::ProcessConfig;
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

const RESOURCE: &str = "process";

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Completed,
    Failed,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Killed
        )
    }
}

/// Snapshot of a managed process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInstance {
    pub id: String,
    pub process_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub limits: ResourceLimits,
    pub elapsed_secs: f64,
}

/// Point-in-time process pool metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessMetrics {
    /// Registered processes, i.e. slots held
    pub process_instances: u64,
    pub active_processes: u64,
    pub successful_starts: u64,
    pub failed_starts: u64,
    pub start_success_rate: f64,
    pub successful_shutdowns: u64,
    pub failed_shutdowns: u64,
    pub processes_killed: u64,
    pub timeout_occurrences: u64,
    pub total_process_time_secs: f64,
    pub avg_process_time_secs: f64,
    pub peak_concurrent_processes: u64,
    pub max_processes: usize,
}

#[derive(Default)]
struct Counters {
    running: AtomicU64,
    successful_starts: AtomicU64,
    failed_starts: AtomicU64,
    successful_shutdowns: AtomicU64,
    failed_shutdowns: AtomicU64,
    killed: AtomicU64,
    timeouts: AtomicU64,
    finished: AtomicU64,
    process_time_ms: AtomicU64,
    peak: AtomicU64,
}

struct ProcessEntry {
    info: RwLock<ProcessInstance>,

    /// Set before any termination so the waiter records `Killed`
    kill_requested: AtomicBool,

    /// Tells the waiter to SIGTERM the child and wait `stop_grace`
    stop: CancellationToken,
    stop_grace: Mutex<Duration>,

    /// Tells the waiter to SIGKILL the child
    kill: CancellationToken,

    /// The child exited on SIGTERM within its grace period
    stopped_gracefully: AtomicBool,

    done: watch::Receiver<bool>,
    waiter: Mutex<Option<JoinHandle<()>>>,
    permit: Mutex<Option<GatePermit>>,
}

impl ProcessEntry {
    fn snapshot(&self) -> ProcessInstance {
        let mut info = self.info.read().clone();
        if let Some(started) = info.started_at {
            let end = info.terminated_at.unwrap_or_else(Utc::now);
            info.elapsed_secs = (end - started).num_milliseconds() as f64 / 1000.0;
        }
        info
    }

    fn state(&self) -> ProcessState {
        self.info.read().state
    }

    async fn wait_done(&self) -> bool {
        let mut done = self.done.clone();
        let finished = done.wait_for(|finished| *finished).await.is_ok();
        finished
    }
}

/// Process manager
pub struct ProcessManager {
    gate: AdmissionGate,
    max_processes: usize,
    limiter: ResourceLimiter,
    processes: RwLock<HashMap<String, Arc<ProcessEntry>>>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    graceful_timeout: Duration,
    closed: AtomicBool,
}

impl ProcessManager {
    /// Manager with its own shutdown token
    pub fn new(max_processes: usize) -> Self {
        Self::with_shutdown(max_processes, CancellationToken::new())
    }

    /// Manager whose processes are stopped when `shutdown` fires
    pub fn with_shutdown(max_processes: usize, shutdown: CancellationToken) -> Self {
        Self {
            gate: AdmissionGate::new(RESOURCE, max_processes),
            max_processes,
            limiter: ResourceLimiter::default(),
            processes: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            shutdown: shutdown.child_token(),
            graceful_timeout: Duration::from_secs(5),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ProcessConfig, shutdown: CancellationToken) -> Self {
        let mut manager = Self::with_shutdown(config.max_processes, shutdown);
        manager.graceful_timeout = Duration::from_millis(config.graceful_timeout_ms);

        for (process_type, limits) in &config.limits {
            manager.set_resource_limit(process_type.clone(), limits.clone());
        }

        info!(
            "Process manager ready: {} slots, {} type overrides",
            config.max_processes,
            config.limits.len()
        );
        manager
    }

    pub fn set_resource_limit(&self, process_type: impl Into<String>, limits: ResourceLimits) {
        self.limiter.set_limit(process_type, limits);
    }

    pub fn resource_limit(&self, process_type: &str) -> ResourceLimits {
        self.limiter.limit_for(process_type)
    }

    /// Start `command` as a process of `process_type`.
    ///
    /// Waits for a free slot (bounded only by `cancel` and shutdown). The
    /// slot is returned immediately if the OS refuses to start the process.
    pub async fn start_process(
        &self,
        cancel: &CancellationToken,
        process_type: &str,
        command: &str,
        args: &[&str],
    ) -> Result<ProcessInstance> {
        if self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
            self.counters.failed_starts.fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::ManagerClosed("process manager"));
        }

        let permit = tokio::select! {
            permit = self.gate.acquire(cancel, None) => permit,
            _ = self.shutdown.cancelled() => Err(OrchestratorError::ManagerClosed("process manager")),
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                self.counters.failed_starts.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let (instance, entry) = self.launch(permit, process_type, command, args)?;
        self.register(entry).await?;

        info!("Started process {} (pid {:?})", instance.id, instance.pid);
        Ok(instance)
    }

    /// Spawn the child and its waiter. The entry is not registered yet.
    fn launch(
        &self,
        permit: GatePermit,
        process_type: &str,
        command: &str,
        args: &[&str],
    ) -> Result<(ProcessInstance, Arc<ProcessEntry>)> {
        let limits = self.limiter.limit_for(process_type);
        let id = format!("proc-{}", Ulid::new().to_string().to_lowercase());
        let created_at = Utc::now();

        debug!("Starting {} process {}: {} {:?}", process_type, id, command, args);

        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                self.counters.failed_starts.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to start process {}: {}", command, e);
                return Err(OrchestratorError::LaunchFailure {
                    what: command.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let instance = ProcessInstance {
            id: id.clone(),
            process_type: process_type.to_string(),
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            pid: child.id(),
            state: ProcessState::Running,
            created_at,
            started_at: Some(Utc::now()),
            terminated_at: None,
            exit_code: None,
            limits: limits.clone(),
            elapsed_secs: 0.0,
        };

        let (done_tx, done_rx) = watch::channel(false);
        let entry = Arc::new(ProcessEntry {
            info: RwLock::new(instance.clone()),
            kill_requested: AtomicBool::new(false),
            stop: CancellationToken::new(),
            stop_grace: Mutex::new(self.graceful_timeout),
            kill: CancellationToken::new(),
            stopped_gracefully: AtomicBool::new(false),
            done: done_rx,
            waiter: Mutex::new(None),
            permit: Mutex::new(Some(permit)),
        });

        self.counters.successful_starts.fetch_add(1, Ordering::Relaxed);
        let running = self.counters.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.peak.fetch_max(running, Ordering::Relaxed);

        let waiter = tokio::spawn(supervise(
            child,
            Arc::clone(&entry),
            limits.timeout(),
            self.graceful_timeout,
            self.shutdown.clone(),
            Arc::clone(&self.counters),
            done_tx,
        ));
        *entry.waiter.lock() = Some(waiter);

        Ok((instance, entry))
    }

    /// Make the entry visible. A manager that closed while the process was
    /// starting never drains it, so the entry is torn down here instead.
    async fn register(&self, entry: Arc<ProcessEntry>) -> Result<()> {
        let id = entry.info.read().id.clone();
        self.processes.write().insert(id.clone(), Arc::clone(&entry));

        if !self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let removed = self.processes.write().remove(&id);
        if let Some(entry) = removed {
            warn!("Process manager closed while {} was starting, killing it", id);
            entry.kill_requested.store(true, Ordering::Release);
            entry.kill.cancel();
            self.retire(&id, entry).await;
        }
        Err(OrchestratorError::ManagerClosed("process manager"))
    }

    /// SIGTERM, then SIGKILL if the process outlives `graceful_timeout`.
    /// The process ends up `Killed` either way.
    pub async fn terminate_process(&self, id: &str, graceful_timeout: Duration) -> Result<()> {
        let entry = self.running_entry(id)?;
        entry.kill_requested.store(true, Ordering::Release);
        *entry.stop_grace.lock() = graceful_timeout;
        entry.stop.cancel();

        entry.wait_done().await;
        debug!("Terminated process {}", id);
        Ok(())
    }

    /// SIGKILL without a grace period
    pub async fn kill_process(&self, id: &str) -> Result<()> {
        let entry = self.running_entry(id)?;
        entry.kill_requested.store(true, Ordering::Release);
        entry.kill.cancel();

        entry.wait_done().await;
        debug!("Killed process {}", id);
        Ok(())
    }

    pub fn process_status(&self, id: &str) -> Result<ProcessInstance> {
        Ok(self.entry(id)?.snapshot())
    }

    /// Wait until the process reaches a terminal state and return it
    pub async fn wait_for_process(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> Result<ProcessInstance> {
        let entry = self.entry(id)?;

        tokio::select! {
            finished = entry.wait_done() => {
                if finished {
                    Ok(entry.snapshot())
                } else {
                    Err(OrchestratorError::ProcessControl(format!("waiter for {} vanished", id)))
                }
            }
            _ = cancel.cancelled() => Err(OrchestratorError::ProcessControl(format!(
                "wait for {} cancelled",
                id
            ))),
        }
    }

    pub fn list_processes(&self) -> Vec<ProcessInstance> {
        self.processes
            .read()
            .values()
            .map(|entry| entry.snapshot())
            .collect()
    }

    /// Remove a process from the registry and return its slot.
    ///
    /// A process that is still running is killed first.
    pub async fn cleanup_process(&self, id: &str) -> Result<()> {
        let entry = self
            .processes
            .write()
            .remove(id)
            .ok_or_else(|| OrchestratorError::not_found(RESOURCE, id))?;

        if !entry.state().is_terminal() {
            debug!("Cleaning up running process {}, killing it first", id);
            entry.kill_requested.store(true, Ordering::Release);
            entry.kill.cancel();
        }

        self.retire(id, entry).await;
        Ok(())
    }

    pub fn metrics(&self) -> ProcessMetrics {
        let successful_starts = self.counters.successful_starts.load(Ordering::Relaxed);
        let failed_starts = self.counters.failed_starts.load(Ordering::Relaxed);
        let finished = self.counters.finished.load(Ordering::Relaxed);
        let total_secs = self.counters.process_time_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        let starts = successful_starts + failed_starts;

        ProcessMetrics {
            process_instances: self.processes.read().len() as u64,
            active_processes: self.counters.running.load(Ordering::Relaxed),
            successful_starts,
            failed_starts,
            start_success_rate: if starts == 0 {
                100.0
            } else {
                successful_starts as f64 / starts as f64 * 100.0
            },
            successful_shutdowns: self.counters.successful_shutdowns.load(Ordering::Relaxed),
            failed_shutdowns: self.counters.failed_shutdowns.load(Ordering::Relaxed),
            processes_killed: self.counters.killed.load(Ordering::Relaxed),
            timeout_occurrences: self.counters.timeouts.load(Ordering::Relaxed),
            total_process_time_secs: total_secs,
            avg_process_time_secs: if finished == 0 {
                0.0
            } else {
                total_secs / finished as f64
            },
            peak_concurrent_processes: self.counters.peak.load(Ordering::Relaxed),
            max_processes: self.max_processes,
        }
    }

    /// Stop every tracked process (graceful, then forced) and free all slots.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Closing process manager");
        self.gate.close();
        self.shutdown.cancel();

        let entries: Vec<(String, Arc<ProcessEntry>)> = self.processes.write().drain().collect();
        let count = entries.len();

        futures::future::join_all(
            entries
                .into_iter()
                .map(|(id, entry)| async move { self.retire(&id, entry).await }),
        )
        .await;

        info!("Process manager closed, {} processes cleaned up", count);
        Ok(())
    }

    /// Join the waiter, free the slot and count the shutdown
    async fn retire(&self, id: &str, entry: Arc<ProcessEntry>) {
        let waiter = entry.waiter.lock().take();
        if let Some(waiter) = waiter {
            if let Err(e) = waiter.await {
                error!("Waiter for process {} failed: {}", id, e);
            }
        }

        entry.permit.lock().take();

        let graceful = entry.stopped_gracefully.load(Ordering::Acquire);
        match entry.state() {
            ProcessState::Completed => {
                self.counters.successful_shutdowns.fetch_add(1, Ordering::Relaxed);
            }
            ProcessState::Killed if graceful => {
                self.counters.successful_shutdowns.fetch_add(1, Ordering::Relaxed);
            }
            ProcessState::Failed | ProcessState::Killed => {
                self.counters.failed_shutdowns.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        debug!("Process {} removed, slot released", id);
    }

    fn entry(&self, id: &str) -> Result<Arc<ProcessEntry>> {
        self.processes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(RESOURCE, id))
    }

    fn running_entry(&self, id: &str) -> Result<Arc<ProcessEntry>> {
        let entry = self.entry(id)?;
        if entry.state() != ProcessState::Running {
            return Err(OrchestratorError::ProcessControl(format!(
                "process not running: {}",
                id
            )));
        }
        Ok(entry)
    }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    StopRequested,
    KillRequested,
    TimedOut,
    Shutdown,
}

/// Owns the child until it exits and records the terminal state exactly once
async fn supervise(
    mut child: Child,
    entry: Arc<ProcessEntry>,
    timeout: Duration,
    graceful_timeout: Duration,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    done: watch::Sender<bool>,
) {
    let id = entry.info.read().id.clone();

    let exit = tokio::select! {
        status = child.wait() => Exit::Finished(status),
        _ = entry.stop.cancelled() => Exit::StopRequested,
        _ = entry.kill.cancelled() => Exit::KillRequested,
        _ = tokio::time::sleep(timeout) => Exit::TimedOut,
        _ = shutdown.cancelled() => Exit::Shutdown,
    };

    let status = match exit {
        Exit::Finished(status) => status,
        Exit::StopRequested => {
            let grace = *entry.stop_grace.lock();
            debug!("Sending SIGTERM to {} ({:?} grace)", id, grace);
            graceful_stop(&mut child, grace, &entry, &counters).await
        }
        Exit::KillRequested => {
            counters.killed.fetch_add(1, Ordering::Relaxed);
            force_kill(&mut child).await
        }
        Exit::TimedOut => {
            warn!("Process {} exceeded its {:?} timeout, killing", id, timeout);
            entry.kill_requested.store(true, Ordering::Release);
            counters.timeouts.fetch_add(1, Ordering::Relaxed);
            counters.killed.fetch_add(1, Ordering::Relaxed);
            force_kill(&mut child).await
        }
        Exit::Shutdown => {
            entry.kill_requested.store(true, Ordering::Release);
            graceful_stop(&mut child, graceful_timeout, &entry, &counters).await
        }
    };

    let terminated_at = Utc::now();
    {
        let mut info = entry.info.write();
        info.terminated_at = Some(terminated_at);
        info.exit_code = status.as_ref().ok().and_then(|status| status.code());
        info.state = if entry.kill_requested.load(Ordering::Acquire) {
            ProcessState::Killed
        } else {
            match &status {
                Ok(status) if status.success() => ProcessState::Completed,
                _ => ProcessState::Failed,
            }
        };

        if let Some(started) = info.started_at {
            let elapsed_ms = (terminated_at - started).num_milliseconds().max(0) as u64;
            info.elapsed_secs = elapsed_ms as f64 / 1000.0;
            counters.process_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        }

        debug!(
            "Process {} finished: {:?} (exit code {:?})",
            id, info.state, info.exit_code
        );
    }

    counters.running.fetch_sub(1, Ordering::Relaxed);
    counters.finished.fetch_add(1, Ordering::Relaxed);
    done.send_replace(true);
}

async fn force_kill(child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!("SIGKILL not delivered: {}", e);
    }
    child.wait().await
}

/// SIGTERM, then SIGKILL once `graceful_timeout` passes or a kill is requested.
///
/// `child.id()` is `None` once the child has been reaped, so the signal never
/// reaches a recycled pid.
async fn graceful_stop(
    child: &mut Child,
    graceful_timeout: Duration,
    entry: &ProcessEntry,
    counters: &Counters,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = signal(pid, Signal::SIGTERM) {
            debug!("{}", e);
        }
    }

    let exited = tokio::select! {
        status = tokio::time::timeout(graceful_timeout, child.wait()) => status.ok(),
        _ = entry.kill.cancelled() => None,
    };

    match exited {
        Some(status) => {
            entry.stopped_gracefully.store(true, Ordering::Release);
            status
        }
        None => {
            warn!("Process still alive after {:?}, sending SIGKILL", graceful_timeout);
            counters.killed.fetch_add(1, Ordering::Relaxed);
            force_kill(child).await
        }
    }
}

/// Signal a pid; a process that is already gone is not an error
fn signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(OrchestratorError::ProcessControl(format!(
            "Failed to send {:?} to pid {}: {}",
            signal, pid, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(manager: &ProcessManager, command: &str, args: &[&str]) -> ProcessInstance {
        manager
            .start_process(&CancellationToken::new(), "test", command, args)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_completed_process_keeps_slot_until_cleanup() {
        let manager = ProcessManager::new(2);
        let instance = start(&manager, "true", &[]).await;
        assert_eq!(instance.state, ProcessState::Running);
        assert!(instance.id.starts_with("proc-"));

        let finished = manager
            .wait_for_process(&CancellationToken::new(), &instance.id)
            .await
            .unwrap();
        assert_eq!(finished.state, ProcessState::Completed);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.terminated_at.is_some());

        // finished but not cleaned up: slot still held
        assert_eq!(manager.gate.available(), 1);

        manager.cleanup_process(&instance.id).await.unwrap();
        assert_eq!(manager.gate.available(), 2);
        assert_eq!(manager.metrics().successful_shutdowns, 1);
        assert!(manager.process_status(&instance.id).is_err());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let manager = ProcessManager::new(1);
        let instance = start(&manager, "false", &[]).await;

        let finished = manager
            .wait_for_process(&CancellationToken::new(), &instance.id)
            .await
            .unwrap();
        assert_eq!(finished.state, ProcessState::Failed);
        assert_eq!(finished.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_launch_failure_returns_slot() {
        let manager = ProcessManager::new(1);
        let result = manager
            .start_process(
                &CancellationToken::new(),
                "test",
                "/definitely/not/a/binary",
                &[],
            )
            .await;

        assert!(matches!(result, Err(OrchestratorError::LaunchFailure { .. })));
        assert_eq!(manager.gate.available(), 1);

        let metrics = manager.metrics();
        assert_eq!(metrics.failed_starts, 1);
        assert_eq!(metrics.start_success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let manager = ProcessManager::new(1);
        let instance = start(&manager, "sleep", &["30"]).await;

        manager
            .terminate_process(&instance.id, Duration::from_secs(5))
            .await
            .unwrap();

        let status = manager.process_status(&instance.id).unwrap();
        assert_eq!(status.state, ProcessState::Killed);
        assert_eq!(manager.metrics().active_processes, 0);

        // the shutdown is counted once, when the slot is released
        assert_eq!(manager.metrics().successful_shutdowns, 0);
        manager.cleanup_process(&instance.id).await.unwrap();

        let metrics = manager.metrics();
        assert_eq!(metrics.successful_shutdowns, 1);
        assert_eq!(metrics.failed_shutdowns, 0);
        assert_eq!(metrics.processes_killed, 0);
    }

    #[tokio::test]
    async fn test_terminate_finished_process_is_rejected() {
        let manager = ProcessManager::new(1);
        let instance = start(&manager, "true", &[]).await;
        manager
            .wait_for_process(&CancellationToken::new(), &instance.id)
            .await
            .unwrap();

        let result = manager
            .terminate_process(&instance.id, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(OrchestratorError::ProcessControl(_))));

        let status = manager.process_status(&instance.id).unwrap();
        assert_eq!(status.state, ProcessState::Completed);
        assert_eq!(manager.metrics().processes_killed, 0);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let manager = ProcessManager::new(1);
        let instance = start(&manager, "sh", &["-c", "trap '' TERM; sleep 30"]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager
            .terminate_process(&instance.id, Duration::from_millis(200))
            .await
            .unwrap();

        let status = manager.process_status(&instance.id).unwrap();
        assert_eq!(status.state, ProcessState::Killed);
        assert_eq!(manager.metrics().processes_killed, 1);

        manager.cleanup_process(&instance.id).await.unwrap();
        let metrics = manager.metrics();
        assert_eq!(metrics.successful_shutdowns, 0);
        assert_eq!(metrics.failed_shutdowns, 1);
        assert_eq!(metrics.processes_killed, 1);
    }

    #[tokio::test]
    async fn test_kill_and_not_running_errors() {
        let manager = ProcessManager::new(1);
        let instance = start(&manager, "sleep", &["30"]).await;

        manager.kill_process(&instance.id).await.unwrap();
        assert_eq!(
            manager.process_status(&instance.id).unwrap().state,
            ProcessState::Killed
        );

        // terminal state is written once; a second kill is rejected
        let again = manager.kill_process(&instance.id).await;
        assert!(matches!(again, Err(OrchestratorError::ProcessControl(_))));

        let missing = manager.kill_process("proc-missing").await;
        assert!(matches!(missing, Err(OrchestratorError::ResourceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_admission_blocks_until_cleanup() {
        let manager = Arc::new(ProcessManager::new(1));
        let first = start(&manager, "sleep", &["30"]).await;

        let blocked = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .start_process(&CancellationToken::new(), "test", "sleep", &["30"])
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished());

        manager.cleanup_process(&first.id).await.unwrap();
        let second = blocked.await.unwrap().unwrap();
        assert_eq!(second.state, ProcessState::Running);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_start() {
        let manager = ProcessManager::new(1);
        let _held = start(&manager, "sleep", &["30"]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager.start_process(&cancel, "test", "sleep", &["1"]).await;
        assert!(matches!(result, Err(OrchestratorError::AdmissionCancelled(_))));

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_type_timeout_kills_process() {
        let manager = ProcessManager::new(1);
        manager.set_resource_limit(
            "short",
            ResourceLimits {
                timeout_secs: 1,
                ..ResourceLimits::default()
            },
        );

        let instance = manager
            .start_process(&CancellationToken::new(), "short", "sleep", &["30"])
            .await
            .unwrap();
        assert_eq!(instance.limits.timeout_secs, 1);

        let finished = manager
            .wait_for_process(&CancellationToken::new(), &instance.id)
            .await
            .unwrap();
        assert_eq!(finished.state, ProcessState::Killed);
        assert_eq!(manager.metrics().timeout_occurrences, 1);
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let manager = ProcessManager::new(3);
        for _ in 0..3 {
            start(&manager, "sleep", &["30"]).await;
        }
        assert_eq!(manager.list_processes().len(), 3);

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert!(manager.list_processes().is_empty());
        let metrics = manager.metrics();
        assert_eq!(metrics.active_processes, 0);
        // `sleep` exits on SIGTERM, so every stop was graceful and counted once
        assert_eq!(metrics.successful_shutdowns, 3);
        assert_eq!(metrics.failed_shutdowns, 0);
        assert_eq!(metrics.processes_killed, 0);

        let result = manager
            .start_process(&CancellationToken::new(), "test", "true", &[])
            .await;
        assert!(matches!(result, Err(OrchestratorError::ManagerClosed(_))));
    }

    #[tokio::test]
    async fn test_injected_shutdown_stops_processes() {
        let shutdown = CancellationToken::new();
        let manager = ProcessManager::with_shutdown(1, shutdown.clone());
        let instance = start(&manager, "sleep", &["30"]).await;

        shutdown.cancel();
        let finished = manager
            .wait_for_process(&CancellationToken::new(), &instance.id)
            .await
            .unwrap();
        assert_eq!(finished.state, ProcessState::Killed);

        // a second manager is unaffected by the first one's token
        let other = ProcessManager::new(1);
        assert!(start(&other, "true", &[]).await.pid.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_not_an_admission_error() {
        let manager = ProcessManager::new(1);
        let instance = start(&manager, "sleep", &["30"]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager.wait_for_process(&cancel, &instance.id).await;
        assert!(matches!(result, Err(OrchestratorError::ProcessControl(_))));

        // the process is untouched by the abandoned wait
        assert_eq!(
            manager.process_status(&instance.id).unwrap().state,
            ProcessState::Running
        );
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_after_close_tears_down() {
        let manager = ProcessManager::new(1);
        manager.close().await.unwrap();

        // a start that won its slot before close() drained the registry
        let other_gate = AdmissionGate::new("test", 1);
        let permit = other_gate
            .acquire(&CancellationToken::new(), None)
            .await
            .unwrap();
        let (instance, entry) = manager.launch(permit, "test", "sleep", &["30"]).unwrap();

        let result = manager.register(Arc::clone(&entry)).await;
        assert!(matches!(result, Err(OrchestratorError::ManagerClosed(_))));

        assert!(manager.list_processes().is_empty());
        assert!(manager.process_status(&instance.id).is_err());
        assert!(entry.state().is_terminal());
        assert!(entry.permit.lock().is_none());
        assert_eq!(other_gate.available(), 1);
        assert_eq!(manager.metrics().active_processes, 0);
    }
}
