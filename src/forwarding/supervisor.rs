//! Forwarding Process Supervisor
//!
//! Starts one external forwarder (socat by default) per rule, answers
//! liveness queries from the OS, and tears the whole process tree down on
//! stop. The forwarder forks a child per accepted connection, so stop walks
//! the tree and signals leaves first, then the root, then escalates to
//! SIGKILL once the grace period runs out.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use super::error::{SpawnError, StopError};
use super::process_tree::{self, Delivery, TreeMember, TreeSignal};
use super::rule::ForwardTarget;
use super::sampler::IoLedger;

/// Poll interval while waiting for a tree to exit
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for the kernel to reap after SIGKILL
const FORCE_REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// Forwarder stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Forwarder program and argument template.
///
/// `{local_port}`, `{remote_host}` and `{remote_port}` are substituted in
/// every argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ForwarderCommand {
    /// socat listening with address reuse and fork-per-connection
    pub fn socat(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![
                "TCP-LISTEN:{local_port},reuseaddr,fork".into(),
                "TCP:{remote_host}:{remote_port}".into(),
            ],
        }
    }

    /// Arguments for a concrete target
    pub fn render(&self, target: &ForwardTarget) -> Vec<String> {
        let local_port = target.local_port.to_string();
        let remote_host = target.address_host();
        let remote_port = target.remote_port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{local_port}", &local_port)
                    .replace("{remote_host}", &remote_host)
                    .replace("{remote_port}", &remote_port)
            })
            .collect()
    }
}

impl Default for ForwarderCommand {
    fn default() -> Self {
        Self::socat("socat")
    }
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: ForwarderCommand,
    /// How long a fresh forwarder must survive before it counts as started
    pub startup_probe: Duration,
    /// SIGTERM grace period before SIGKILL
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: ForwarderCommand::default(),
            startup_probe: Duration::from_millis(200),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// OS-level liveness of a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Exited; exit code when it ended normally
    Exited(Option<i32>),
}

/// Result of a successful stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Handle was already released; nothing to do
    AlreadyStopped,
    /// Root had already died; it was reaped and its group swept
    AlreadyExited { code: Option<i32> },
    /// Tree was torn down
    Terminated {
        /// Everything exited within the grace period
        graceful: bool,
        /// Processes signalled, root included
        processes: usize,
    },
}

/// Ownership of a spawned forwarder process
pub struct ProcessHandle {
    pid: u32,
    local_port: u16,
    child: Mutex<Child>,
    released: AtomicBool,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    ledger: Mutex<IoLedger>,
}

impl ProcessHandle {
    fn new(pid: u32, local_port: u16, child: Child, stderr_tail: Arc<Mutex<VecDeque<String>>>) -> Self {
        Self {
            pid,
            local_port,
            child: Mutex::new(child),
            released: AtomicBool::new(false),
            stderr_tail,
            ledger: Mutex::new(IoLedger::default()),
        }
    }

    /// OS process id (also the process group id)
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the handle has been torn down
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Non-blocking `waitpid(WNOHANG)` on the forwarder
    pub fn liveness(&self) -> Liveness {
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(status)) => Liveness::Exited(status.code()),
            // ECHILD: reaped behind our back, it is certainly not running
            Err(e) => {
                debug!("try_wait failed for pid {}: {}", self.pid, e);
                Liveness::Exited(None)
            }
        }
    }

    /// Last lines the forwarder wrote to stderr
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub(crate) fn ledger(&self) -> &Mutex<IoLedger> {
        &self.ledger
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("local_port", &self.local_port)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // An unreleased handle still owns a live tree; never leak it
        if !self.is_released() {
            debug!("Dropping live forwarder handle, killing process group {}", self.pid);
            let _ = process_tree::signal_group(self.pid, TreeSignal::Kill);
            let _ = self.child.get_mut().start_kill();
        }
    }
}

/// Starts, stops and inspects forwarder processes
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Spawn a forwarder for `target` and confirm it survives startup.
    pub async fn start(&self, target: &ForwardTarget) -> Result<ProcessHandle, SpawnError> {
        preflight_bind(target.local_port).await?;

        let program = &self.config.command.program;
        let args = self.config.command.render(target);
        debug!("Spawning forwarder: {} {:?}", program, args);

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // Own process group so the whole tree can be swept with killpg
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SpawnError::ExecutableNotFound {
                program: program.clone(),
            },
            _ => SpawnError::Os(e),
        })?;

        let Some(pid) = child.id() else {
            return Err(SpawnError::ExitedEarly {
                code: None,
                stderr: "forwarder exited before reporting a pid".into(),
            });
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let drain = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, target.local_port, stderr_tail.clone())));

        let handle = ProcessHandle::new(pid, target.local_port, child, stderr_tail);

        tokio::time::sleep(self.config.startup_probe).await;
        if let Liveness::Exited(code) = handle.liveness() {
            // Let the drain task pick up the last words before reporting
            if let Some(drain) = drain {
                let _ = tokio::time::timeout(Duration::from_millis(250), drain).await;
            }
            handle.release();
            let stderr = handle.stderr_tail();
            warn!(
                "Forwarder for {} exited during startup (code {:?}): {}",
                target, code, stderr
            );
            return Err(SpawnError::ExitedEarly { code, stderr });
        }

        info!("Forwarder started for {} (pid {})", target, pid);
        Ok(handle)
    }

    /// Whether the forwarder behind `handle` is still running
    pub fn is_alive(&self, handle: &ProcessHandle) -> bool {
        !handle.is_released() && handle.liveness() == Liveness::Alive
    }

    /// Tear down the forwarder and every descendant.
    pub async fn stop(&self, handle: &ProcessHandle) -> Result<StopOutcome, StopError> {
        if handle.is_released() {
            return Ok(StopOutcome::AlreadyStopped);
        }

        let pid = handle.pid();
        if let Liveness::Exited(code) = handle.liveness() {
            // Connection handlers may outlive their parent; sweep the group
            let _ = process_tree::signal_group(pid, TreeSignal::Kill);
            handle.release();
            info!("Forwarder {} had already exited (code {:?})", pid, code);
            return Ok(StopOutcome::AlreadyExited { code });
        }

        let tree = tokio::task::spawn_blocking(move || process_tree::snapshot(pid))
            .await
            .unwrap_or_else(|e| {
                warn!("Process tree snapshot for {} failed: {}", pid, e);
                process_tree::ProcessTree::default()
            });
        let descendants: Vec<TreeMember> = tree.descendants().copied().collect();
        debug!(
            "Stopping forwarder {} with {} descendants",
            pid,
            descendants.len()
        );

        for child in &descendants {
            if let Err(reason) = process_tree::signal_process(child.pid, TreeSignal::Terminate) {
                warn!("Failed to send SIGTERM to descendant {}: {}", child.pid, reason);
            }
        }
        match process_tree::signal_process(pid, TreeSignal::Terminate) {
            Ok(Delivery::Delivered) => {}
            Ok(Delivery::Gone) => {
                // Exited between the liveness check and the signal
                if let Liveness::Exited(code) = handle.liveness() {
                    let _ = process_tree::signal_group(pid, TreeSignal::Kill);
                    handle.release();
                    return Ok(StopOutcome::AlreadyExited { code });
                }
                return Err(StopError::ProcessNotFound { pid });
            }
            Err(reason) => return Err(StopError::SignalFailed { pid, reason }),
        }

        let graceful = wait_for_tree(handle, &descendants, self.config.stop_grace).await;
        if !graceful {
            warn!(
                "Forwarder {} did not exit within {:?}, sending SIGKILL",
                pid, self.config.stop_grace
            );
            // A pid that exited and was reused is no longer ours to kill
            for child in descendants.iter().filter(|m| process_tree::still_running(m)) {
                let _ = process_tree::signal_process(child.pid, TreeSignal::Kill);
            }
            if let Err(reason) = process_tree::signal_process(pid, TreeSignal::Kill) {
                return Err(StopError::SignalFailed { pid, reason });
            }
        }
        // Handlers forked after the snapshot are still in the group
        let _ = process_tree::signal_group(pid, TreeSignal::Kill);

        if !graceful && !wait_for_tree(handle, &[], FORCE_REAP_TIMEOUT).await {
            return Err(StopError::SignalFailed {
                pid,
                reason: "process survived SIGKILL".into(),
            });
        }

        handle.release();
        info!(
            "Forwarder {} stopped ({} processes, graceful: {})",
            pid,
            descendants.len() + 1,
            graceful
        );
        Ok(StopOutcome::Terminated {
            graceful,
            processes: descendants.len() + 1,
        })
    }
}

/// Refuse early when something else already listens on the port.
async fn preflight_bind(port: u16) -> Result<(), SpawnError> {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) => Err(match e.kind() {
            std::io::ErrorKind::AddrInUse => SpawnError::PortInUse { port },
            std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { port },
            _ => SpawnError::Os(e),
        }),
    }
}

/// Wait until the root is reaped and every listed descendant is gone
/// (exited, a zombie, or its pid reused by another process).
async fn wait_for_tree(
    handle: &ProcessHandle,
    descendants: &[TreeMember],
    within: Duration,
) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let root_done = matches!(handle.liveness(), Liveness::Exited(_));
        if root_done && !descendants.iter().any(process_tree::still_running) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

async fn drain_stderr(stderr: ChildStderr, port: u16, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                warn!(port, "forwarder: {}", line);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(port, "Stopped reading forwarder stderr: {}", e);
                break;
            }
        }
    }
}
