// src/process/mod.rs

//! Child-process execution and supervision.
//!
//! Every invocation is registered under its `(workspace, target)` key so
//! that [`ProcessRunner::kill`] can terminate everything in flight for that
//! task. Kill is graceful first (the whole process group), then escalates
//! to a forceful kill after a grace period when the process survives or a
//! release-port is still bound.

pub mod command;
pub mod daemon;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

pub use daemon::DaemonResult;

/// Default grace period between the graceful and the forceful kill;
/// callers pick the actual value per [`ProcessRunner::kill`] call.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Identity of one scheduled task; the registry key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TaskKey {
    pub workspace: String,
    pub target: String,
}

impl TaskKey {
    pub fn new(workspace: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            target: target.into(),
        }
    }
}

/// How child stdio is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Capture stdout/stderr into the [`CommandResult`].
    #[default]
    Capture,
    /// Pass stdio through to the parent; nothing is captured.
    Inherit,
}

/// Where and how to spawn a command.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub stdio: StdioMode,
}

/// Captured outcome of one finished shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order.
    pub all: String,
    pub took_ms: u64,
}

/// Handle to one in-flight child, as stored in the registry.
#[derive(Clone)]
struct ProcessHandle {
    pid: Option<u32>,
    /// Wakes the owning future to stop the child where signals are
    /// unavailable (and for daemon owners).
    cancel: Arc<Notify>,
    /// Closes when the root process has fully exited.
    done: watch::Receiver<()>,
}

impl ProcessHandle {
    fn terminate_graceful(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
            return;
        }
        self.cancel.notify_one();
    }

    fn terminate_forceful(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL);
        }
        self.cancel.notify_one();
    }

    fn is_done(&self) -> bool {
        // The sender side is dropped exactly when the owner observes exit.
        self.done.has_changed().is_err()
    }

    async fn wait_done(mut self) {
        while self.done.changed().await.is_ok() {}
    }
}

/// Send a signal to the whole process group of `pid`.
///
/// Children are spawned with `process_group(0)`, so the group id equals the
/// root pid and shells plus their forks are all covered.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

type Registry = Arc<Mutex<HashMap<TaskKey, HashMap<u64, ProcessHandle>>>>;

/// Removes the registry entry (and closes the `done` channel) when the
/// owning future finishes, however it finishes.
struct Registration {
    registry: Registry,
    key: TaskKey,
    invocation: u64,
    _done_tx: watch::Sender<()>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(handles) = registry.get_mut(&self.key) {
                handles.remove(&self.invocation);
                if handles.is_empty() {
                    registry.remove(&self.key);
                }
            }
        }
    }
}

/// Spawns and supervises child processes.
#[derive(Default)]
pub struct ProcessRunner {
    registry: Registry,
    next_invocation: AtomicU64,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, key: &TaskKey, pid: Option<u32>, cancel: Arc<Notify>) -> Registration {
        let invocation = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(());

        let handle = ProcessHandle {
            pid,
            cancel,
            done: done_rx,
        };

        match self.registry.lock() {
            Ok(mut registry) => {
                registry
                    .entry(key.clone())
                    .or_default()
                    .insert(invocation, handle);
            }
            Err(_) => warn!("process registry poisoned; handle not tracked"),
        }

        Registration {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            invocation,
            _done_tx: done_tx,
        }
    }

    /// Number of in-flight invocations for a task. Used by tests and for
    /// diagnostics.
    pub fn in_flight(&self, key: &TaskKey) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.get(key).map(HashMap::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Terminate every in-flight process for `key`.
    ///
    /// Graceful signal to each process tree, wait out `grace`, then
    /// escalate to a forceful kill when a process is still alive or one
    /// of `release_ports` is still bound. Resolves once every root
    /// process has reported close.
    pub async fn kill(&self, key: &TaskKey, release_ports: &[u16], grace: Duration) {
        let handles: Vec<ProcessHandle> = self
            .registry
            .lock()
            .map(|registry| {
                registry
                    .get(key)
                    .map(|m| m.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        if handles.is_empty() {
            return;
        }

        debug!(workspace = %key.workspace, target = %key.target, count = handles.len(), "killing task processes");
        for handle in &handles {
            handle.terminate_graceful();
        }

        tokio::time::sleep(grace).await;

        let mut escalate = handles.iter().any(|h| !h.is_done());
        if !escalate {
            for port in release_ports {
                if port_bound(*port).await {
                    warn!(port, "port still bound after graceful kill; escalating");
                    escalate = true;
                    break;
                }
            }
        }

        if escalate {
            for handle in &handles {
                handle.terminate_forceful();
            }
        }

        for handle in handles {
            handle.wait_done().await;
        }
        debug!(workspace = %key.workspace, target = %key.target, "task processes closed");
    }
}

/// Whether something still listens on the given local port.
async fn port_bound(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(100),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}
