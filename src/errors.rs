// src/errors.rs

//! Crate-wide error types.
//!
//! Each subsystem has its own `thiserror` enum; the scheduler aggregates the
//! ones that can terminate an event stream into [`RunnerError`]. Event
//! payloads carry errors by value, so everything here is `Clone` and keeps
//! underlying IO failures as rendered strings.

use std::path::PathBuf;

use thiserror::Error;

use crate::process::CommandResult;
use crate::project::targets::LogCondition;

/// Errors raised while loading the workspace graph. All of these are fatal:
/// a project that fails to load never reaches the scheduler.
#[derive(Debug, Clone, Error)]
pub enum ProjectLoadError {
    #[error("dependency cycle detected involving workspace '{0}'")]
    Cycle(String),

    #[error("unreadable manifest at {path}: {reason}")]
    UnreadableManifest { path: PathBuf, reason: String },

    #[error("invalid workspace glob '{pattern}': {reason}")]
    BadWorkspaceGlob { pattern: String, reason: String },

    #[error("invalid target configuration at {path}: {reason}")]
    InvalidTargetConfig { path: PathBuf, reason: String },
}

/// Errors surfaced by the version-control probe.
#[derive(Debug, Clone, Error)]
pub enum VcsError {
    #[error("unknown revision '{0}'")]
    BadRevision(String),

    #[error("vcs command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn vcs tool: {0}")]
    Spawn(String),
}

/// Errors around fingerprinting and the on-disk cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The source globs matched no files; treated as a cache miss upstream.
    #[error("no input files matched the source globs")]
    NoInputs,

    #[error("invalid source glob '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("failed to write cache: {0}")]
    WriteFailed(String),

    /// Removing stale cache files failed. Fatal to the run: the scheduler
    /// cannot guarantee a clean cache state afterwards.
    #[error("failed to invalidate cache: {0}")]
    InvalidationFailed(String),
}

/// Errors from running a plain (non-daemon) command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("io error while supervising command: {0}")]
    Io(String),

    #[error("command exited with code {code}")]
    Exit { code: i32, result: CommandResult },
}

/// Errors from supervising a daemon command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaemonError {
    #[error("daemon failure condition matched: log {} '{}'", .0.matcher, .0.value)]
    Failure(LogCondition),

    #[error("daemon condition timed out after {}ms", .0.timeout_ms)]
    Timeout(LogCondition),

    #[error("daemon exited before any log condition resolved (status {0:?})")]
    Crashed(Option<i32>),

    #[error("failed to spawn daemon: {0}")]
    Spawn(String),
}

/// Failure of a single scheduled task, as carried by `NodeErrored` events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Errors that reject a `run_command` call before any plan executes.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("no workspace declares target '{0}'")]
    UnknownTarget(String),

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// Terminal failure of an event stream. Emitted as the final `Err` item of
/// the stream, after which the channel closes.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    #[error("target failed in workspace '{workspace}': {error}")]
    Task { workspace: String, error: TaskError },

    #[error("cache invalidation failed in workspace '{workspace}': {error}")]
    CacheInvalidation { workspace: String, error: CacheError },

    #[error("file watcher failed: {0}")]
    Watch(String),
}
