// src/run/events.rs

//! The scheduler's observable surface: a closed set of typed events pushed
//! through a bounded channel.
//!
//! Consumers drain the stream with [`EventStream::next`]; backpressure is
//! implicit because step transitions wait on the consumer side. A terminal
//! failure arrives as the final `Err` item, after which the channel closes.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::errors::{CacheError, RunnerError, TaskError};
use crate::process::CommandResult;

/// One entry of the flattened plan carried by `TargetsResolved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTarget {
    pub workspace: String,
    pub step: usize,
    pub affected: bool,
    pub has_command: bool,
}

/// Outcome payload of `NodeProcessed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub from_cache: bool,
    pub results: Vec<CommandResult>,
    pub took: Duration,
}

/// The kind of file-system change behind a `SourcesChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
}

/// Everything a run can tell its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Always the first event, exactly once per run.
    TargetsResolved { targets: Vec<PlannedTarget> },
    NodeStarted { workspace: String },
    NodeProcessed { workspace: String, summary: RunSummary },
    NodeErrored { workspace: String, error: TaskError },
    NodeSkipped { workspace: String, affected: bool, has_command: bool },
    /// The workspace's in-flight processes were killed mid-run (watch mode).
    NodeInterrupted { workspace: String },
    CacheInvalidated { workspace: String },
    /// Fatal: the stream errors out right after this event.
    ErrorInvalidatingCache { workspace: String, error: CacheError },
    /// Watch mode only.
    SourcesChanged { workspace: String, kind: ChangeKind, path: PathBuf },
}

impl RunEvent {
    /// The workspace this event concerns, if any.
    pub fn workspace(&self) -> Option<&str> {
        match self {
            RunEvent::TargetsResolved { .. } => None,
            RunEvent::NodeStarted { workspace }
            | RunEvent::NodeProcessed { workspace, .. }
            | RunEvent::NodeErrored { workspace, .. }
            | RunEvent::NodeSkipped { workspace, .. }
            | RunEvent::NodeInterrupted { workspace }
            | RunEvent::CacheInvalidated { workspace }
            | RunEvent::ErrorInvalidatingCache { workspace, .. }
            | RunEvent::SourcesChanged { workspace, .. } => Some(workspace),
        }
    }
}

/// Control messages from the consumer back into a running driver.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ControlMsg {
    Unwatch,
}

/// Detached unwatch trigger for a running watch stream.
#[derive(Clone)]
pub struct UnwatchHandle {
    control: mpsc::UnboundedSender<ControlMsg>,
}

impl UnwatchHandle {
    pub fn unwatch(&self) {
        let _ = self.control.send(ControlMsg::Unwatch);
    }
}

/// The stream handed back by `run_command`.
pub struct EventStream {
    rx: mpsc::Receiver<Result<RunEvent, RunnerError>>,
    control: mpsc::UnboundedSender<ControlMsg>,
}

impl EventStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<RunEvent, RunnerError>>,
        control: mpsc::UnboundedSender<ControlMsg>,
    ) -> Self {
        Self { rx, control }
    }

    /// Next item, or `None` once the run has completed.
    pub async fn next(&mut self) -> Option<Result<RunEvent, RunnerError>> {
        self.rx.recv().await
    }

    /// Watch mode: release the file-system watches and let the stream
    /// complete cleanly. A no-op for non-watch runs.
    pub fn unwatch(&self) {
        let _ = self.control.send(ControlMsg::Unwatch);
    }

    /// A clonable handle for unwatching from elsewhere (e.g. a signal
    /// handler) while the stream itself is being drained.
    pub fn unwatch_handle(&self) -> UnwatchHandle {
        UnwatchHandle {
            control: self.control.clone(),
        }
    }

    /// Drain the stream to completion, collecting events and the terminal
    /// outcome. Mostly useful in tests and the CLI.
    pub async fn collect(mut self) -> (Vec<RunEvent>, Result<(), RunnerError>) {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(event) => events.push(event),
                Err(error) => return (events, Err(error)),
            }
        }
        (events, Ok(()))
    }
}
