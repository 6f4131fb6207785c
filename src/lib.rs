// src/lib.rs

pub mod affected;
pub mod cache;
pub mod cli;
pub mod errors;
pub mod logging;
pub mod process;
pub mod project;
pub mod run;
pub mod vcs;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::affected::RevisionRange;
use crate::cli::CliArgs;
use crate::process::StdioMode;
use crate::project::WorkspaceGraph;
use crate::run::{RunEvent, RunMode, RunOptions, Runner};
use crate::vcs::GitProbe;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - project loading
/// - plan resolution and the runner
/// - (optional) watch mode
/// - plain line-per-event rendering of the stream
///
/// Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let project_root = match &args.cwd {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let graph = Arc::new(WorkspaceGraph::load(&project_root)?);

    if args.dry_run {
        print_dry_run(&graph, &args);
        return Ok(0);
    }

    let vcs = Arc::new(GitProbe::new(graph.project_root()));
    let runner = Runner::new(Arc::clone(&graph), vcs);

    let options = options_from_args(&args);
    let watch = options.watch;
    let mut stream = runner.run_command(&args.target, options).await?;

    // Ctrl-C in watch mode unwatches instead of tearing the process down.
    if watch {
        let unwatch = stream.unwatch_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; unwatching");
                unwatch.unwatch();
            }
        });
    }

    let mut failed = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if matches!(event, RunEvent::NodeErrored { .. }) {
                    failed = true;
                }
                render_event(&event);
            }
            Err(error) => {
                eprintln!("toporun: run failed: {error}");
                return Ok(1);
            }
        }
    }

    Ok(if failed { 1 } else { 0 })
}

fn options_from_args(args: &CliArgs) -> RunOptions {
    RunOptions {
        mode: if args.topological {
            RunMode::Topological
        } else {
            RunMode::Parallel
        },
        force: args.force,
        affected: args.affected.as_deref().map(RevisionRange::parse),
        stdio: if args.pass_through {
            StdioMode::Inherit
        } else {
            StdioMode::Capture
        },
        to: args.to.clone(),
        workspaces: if args.workspace.is_empty() {
            None
        } else {
            Some(args.workspace.clone())
        },
        concurrency: args.concurrency,
        args: args.args.clone(),
        env: std::collections::HashMap::new(),
        watch: args.watch,
        debounce_ms: args.debounce_ms,
        release_ports: args.release_port.clone(),
        grace_ms: args.grace_ms,
    }
}

fn render_event(event: &RunEvent) {
    match event {
        RunEvent::TargetsResolved { targets } => {
            println!("plan: {} target(s)", targets.len());
            for target in targets {
                println!(
                    "  [{}] {}{}",
                    target.step,
                    target.workspace,
                    match (target.affected, target.has_command) {
                        (false, _) => " (unaffected)",
                        (_, false) => " (no command)",
                        _ => "",
                    }
                );
            }
        }
        RunEvent::NodeStarted { workspace } => println!("start   {workspace}"),
        RunEvent::NodeProcessed { workspace, summary } => println!(
            "done    {workspace} ({}ms{})",
            summary.took.as_millis(),
            if summary.from_cache { ", from cache" } else { "" }
        ),
        RunEvent::NodeErrored { workspace, error } => println!("error   {workspace}: {error}"),
        RunEvent::NodeSkipped { workspace, .. } => println!("skip    {workspace}"),
        RunEvent::NodeInterrupted { workspace } => println!("killed  {workspace}"),
        RunEvent::CacheInvalidated { workspace } => println!("invalid {workspace}"),
        RunEvent::ErrorInvalidatingCache { workspace, error } => {
            println!("fatal   {workspace}: {error}")
        }
        RunEvent::SourcesChanged { workspace, kind, path } => {
            println!("change  {workspace}: {kind:?} {}", path.display())
        }
    }
}

/// Print the resolved workspaces and their target commands, no execution.
fn print_dry_run(graph: &WorkspaceGraph, args: &CliArgs) {
    println!("toporun dry-run: target '{}'", args.target);
    for workspace in graph.workspaces() {
        match workspace.target(&args.target) {
            Some(config) => {
                println!("  - {}", workspace.name);
                for command in &config.commands {
                    let marker = if command.is_daemon() { " (daemon)" } else { "" };
                    println!("      cmd: {}{marker}", command.run);
                }
                if !config.src.is_empty() {
                    println!("      src: {:?}", config.src);
                }
            }
            None => println!("  - {} (no command)", workspace.name),
        }
    }
}
