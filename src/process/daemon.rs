// src/process/daemon.rs

//! Daemon supervision: long-lived commands whose readiness comes from log
//! conditions rather than exit status.
//!
//! Every condition watches the child's output with its own timeout; the
//! conditions and a crash watcher race, the first resolution wins and the
//! rest are cancelled.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::process::command::{shell_command, spawn_line_reader, OutputLine};
use crate::process::{ProcessRunner, SpawnOptions, TaskKey};
use crate::project::targets::{ConditionKind, LogCondition, StdioSelector};

/// A successfully started daemon. The process keeps running; its handle
/// stays in the runner's registry until it exits or is killed.
#[derive(Debug, Clone)]
pub struct DaemonResult {
    pub pid: Option<u32>,
    pub started_at: SystemTime,
    pub took: Duration,
}

enum ConditionOutcome {
    Matched(LogCondition),
    TimedOut(LogCondition),
}

impl ProcessRunner {
    /// Spawn a daemon command and wait for it to become ready.
    ///
    /// Resolution, whichever comes first:
    /// - a `success` condition matches → `Ok(DaemonResult)`, process keeps
    ///   running under the registry;
    /// - a `failure` condition matches → the tree is killed,
    ///   `Err(DaemonError::Failure)`;
    /// - a condition's timer elapses → the tree is killed,
    ///   `Err(DaemonError::Timeout)`;
    /// - the process exits first → `Err(DaemonError::Crashed)`.
    pub async fn run_daemon(
        &self,
        key: &TaskKey,
        command: &str,
        conditions: &[LogCondition],
        opts: &SpawnOptions,
    ) -> Result<DaemonResult, DaemonError> {
        info!(
            workspace = %key.workspace,
            target = %key.target,
            cmd = %command,
            conditions = conditions.len(),
            "starting daemon"
        );

        // Daemons always capture: the conditions read the log stream.
        let mut shell = shell_command(command, opts);
        shell.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = shell.spawn().map_err(|e| DaemonError::Spawn(e.to_string()))?;
        let pid = child.id();
        let cancel = Arc::new(Notify::new());
        let registration = self.register(key, pid, Arc::clone(&cancel));

        let (line_tx, _) = broadcast::channel::<OutputLine>(1024);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, StdioSelector::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, StdioSelector::Stderr, line_tx.clone());
        }

        let started_at = SystemTime::now();
        let started = Instant::now();

        let mut watchers: JoinSet<ConditionOutcome> = JoinSet::new();
        for condition in conditions.iter().cloned() {
            let rx = line_tx.subscribe();
            watchers.spawn(watch_condition(condition, rx));
        }

        // Conditions and the crash watcher race; first resolution wins.
        // Ownership of the child only moves after the loop, so the loop
        // body can keep borrowing it.
        let resolution = loop {
            tokio::select! {
                Some(joined) = watchers.join_next() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "daemon condition watcher failed; ignoring");
                            continue;
                        }
                    };
                    match outcome {
                        ConditionOutcome::Matched(condition)
                            if condition.kind == ConditionKind::Success =>
                        {
                            break Ok(started.elapsed());
                        }
                        ConditionOutcome::Matched(condition) => {
                            warn!(
                                workspace = %key.workspace,
                                target = %key.target,
                                value = %condition.value,
                                "daemon failure condition matched; killing"
                            );
                            terminate(&mut child, pid).await;
                            break Err(DaemonError::Failure(condition));
                        }
                        ConditionOutcome::TimedOut(condition) => {
                            warn!(
                                workspace = %key.workspace,
                                target = %key.target,
                                timeout_ms = condition.timeout_ms,
                                "daemon condition timed out; killing"
                            );
                            terminate(&mut child, pid).await;
                            break Err(DaemonError::Timeout(condition));
                        }
                    }
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    warn!(
                        workspace = %key.workspace,
                        target = %key.target,
                        exit_code = ?code,
                        "daemon exited before any condition resolved"
                    );
                    break Err(DaemonError::Crashed(code));
                }
                _ = cancel.notified() => {
                    // External kill while still starting up; the crash
                    // watcher picks up the exit on the next turn.
                    let _ = child.start_kill();
                }
            }
        };
        // Cancel the losing condition watchers, clearing their timers.
        drop(watchers);

        let took = resolution?;
        debug!(
            workspace = %key.workspace,
            target = %key.target,
            took_ms = took.as_millis() as u64,
            "daemon ready"
        );

        // Hand the child to a background owner so the registry entry
        // outlives this call; killing the task later resolves through it.
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = cancel.notified() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            drop(registration);
        });

        Ok(DaemonResult { pid, started_at, took })
    }
}

/// Watch the log stream for one condition, bounded by its timeout.
async fn watch_condition(
    condition: LogCondition,
    mut rx: broadcast::Receiver<OutputLine>,
) -> ConditionOutcome {
    let timeout = Duration::from_millis(condition.timeout_ms);
    let matched = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(line) if condition.watches(line.source) && condition.matches(&line.text) => {
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "daemon log watcher lagged; lines dropped");
                }
                // Stream closed: the process is gone; let the crash watcher
                // or the timer decide.
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    })
    .await;

    match matched {
        Ok(()) => ConditionOutcome::Matched(condition),
        Err(_) => ConditionOutcome::TimedOut(condition),
    }
}

/// Kill a failing daemon's tree and wait for the root to close.
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        super::signal_group(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = pid;

    let _ = child.start_kill();
    let _ = child.wait().await;
}
