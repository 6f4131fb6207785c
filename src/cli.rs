// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `toporun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "toporun",
    version,
    about = "Run a target across the monorepo, in parallel or topological order.",
    long_about = None
)]
pub struct CliArgs {
    /// Target name to run (e.g. `build`, `lint`, `start`).
    pub target: String,

    /// Extra arguments appended to every command invocation.
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Order execution by the dependency graph instead of one parallel step.
    #[arg(long)]
    pub topological: bool,

    /// Watch source globs and reschedule impacted workspaces on change.
    #[arg(long)]
    pub watch: bool,

    /// Ignore cached results; run every task.
    #[arg(long)]
    pub force: bool,

    /// Only run workspaces affected by this revision range (`rev1[..rev2]`).
    #[arg(long, value_name = "RANGE")]
    pub affected: Option<String>,

    /// Topological mode: restrict the plan to this workspace and its
    /// dependencies.
    #[arg(long, value_name = "NAME")]
    pub to: Option<String>,

    /// Parallel mode: run only the named workspaces (repeatable).
    #[arg(long = "workspace", value_name = "NAME")]
    pub workspace: Vec<String>,

    /// Maximum concurrently running tasks within a step.
    #[arg(long, value_name = "N", default_value_t = crate::run::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Watch mode: debounce interval for file-system events.
    #[arg(long, value_name = "MS", default_value_t = crate::run::DEFAULT_DEBOUNCE_MS)]
    pub debounce_ms: u64,

    /// Ports probed by the kill protocol before escalating (repeatable).
    #[arg(long = "release-port", value_name = "PORT")]
    pub release_port: Vec<u16>,

    /// Grace period before a kill escalates to a forceful one.
    #[arg(long, value_name = "MS", default_value_t = crate::run::DEFAULT_GRACE_MS)]
    pub grace_ms: u64,

    /// Pass child stdio through instead of capturing it.
    #[arg(long)]
    pub pass_through: bool,

    /// Project root (defaults to the current working directory).
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TOPORUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Resolve and print the plan, but don't execute any commands.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
