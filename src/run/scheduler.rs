// src/run/scheduler.rs

//! The runner: executes an ordered plan and emits the event stream.
//!
//! The driver is the sole mutator of run state. Tasks report back over an
//! internal message channel; actual parallelism comes from independent
//! process invocations, capped by a semaphore per step.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::errors::{CacheError, RunnerError, SchedulerError, TaskError};
use crate::process::{CommandResult, ProcessRunner, SpawnOptions, TaskKey};
use crate::project::WorkspaceGraph;
use crate::run::events::{ControlMsg, EventStream, RunEvent, RunSummary};
use crate::run::plan::{OrderedTargets, ResolvedTarget, TargetsResolver};
use crate::run::watch_mode;
use crate::run::{RunMode, RunOptions};
use crate::vcs::VcsProbe;
use crate::watch::WatchPipe;

/// Executes targets across the workspace graph.
pub struct Runner {
    graph: Arc<WorkspaceGraph>,
    vcs: Arc<dyn VcsProbe>,
    processes: Arc<ProcessRunner>,
}

impl Runner {
    pub fn new(graph: Arc<WorkspaceGraph>, vcs: Arc<dyn VcsProbe>) -> Self {
        Self {
            graph,
            vcs,
            processes: Arc::new(ProcessRunner::new()),
        }
    }

    pub fn processes(&self) -> &Arc<ProcessRunner> {
        &self.processes
    }

    /// Resolve a plan for `target` and start executing it, returning the
    /// event stream.
    ///
    /// Plan resolution happens before the stream exists, so an unknown
    /// target or a bad revision fails the call itself.
    pub async fn run_command(
        &self,
        target: &str,
        options: RunOptions,
    ) -> Result<EventStream, SchedulerError> {
        let pipe = None;
        self.start(target, options, pipe).await
    }

    /// Watch-mode entry point with an externally supplied change feed.
    ///
    /// This is the seam integration tests use instead of real file-system
    /// watches; `run_command` wires up the notify-based watcher itself.
    pub async fn run_command_with_watch_pipe(
        &self,
        target: &str,
        mut options: RunOptions,
        pipe: WatchPipe,
    ) -> Result<EventStream, SchedulerError> {
        options.watch = true;
        self.start(target, options, Some(pipe)).await
    }

    async fn start(
        &self,
        target: &str,
        options: RunOptions,
        pipe: Option<WatchPipe>,
    ) -> Result<EventStream, SchedulerError> {
        let resolver = TargetsResolver::new(&self.graph, self.vcs.as_ref());
        let plan = resolver.resolve(target, &options).await?;

        info!(
            target,
            steps = plan.steps.len(),
            targets = plan.len(),
            watch = options.watch,
            "starting run"
        );

        let (tx, rx) = mpsc::channel(256);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<ControlMsg>();

        let ctx = DriverCtx {
            shared: Arc::new(TaskCtx {
                graph: Arc::clone(&self.graph),
                processes: Arc::clone(&self.processes),
                target: target.to_string(),
                options,
            }),
            tx,
        };

        if ctx.shared.options.watch {
            tokio::spawn(watch_mode::drive_watch(ctx, plan, ctrl_rx, pipe));
        } else {
            tokio::spawn(drive(ctx, plan));
        }

        Ok(EventStream::new(rx, ctrl_tx))
    }
}

/// Everything a task needs, shared across the whole run.
pub(crate) struct TaskCtx {
    pub graph: Arc<WorkspaceGraph>,
    pub processes: Arc<ProcessRunner>,
    pub target: String,
    pub options: RunOptions,
}

/// The driver's side: shared context plus the outgoing event channel.
pub(crate) struct DriverCtx {
    pub shared: Arc<TaskCtx>,
    pub tx: mpsc::Sender<Result<RunEvent, RunnerError>>,
}

impl DriverCtx {
    /// Emit an event; `false` when the consumer is gone.
    pub async fn emit(&self, event: RunEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    /// Terminate the stream with an error.
    pub async fn fail(&self, error: RunnerError) {
        let _ = self.tx.send(Err(error)).await;
    }

    pub fn topological(&self) -> bool {
        self.shared.options.mode == RunMode::Topological
    }
}

/// Messages from tasks back into the driver loop.
#[derive(Debug)]
pub(crate) enum TaskMsg {
    Started { workspace: String },
    Skipped { workspace: String, affected: bool, has_command: bool },
    /// The task observed the abort signal before starting; no event.
    NotStarted,
    Finished { workspace: String, summary: RunSummary },
    Failed { workspace: String, error: TaskError },
}

/// Collected results of one settled step.
#[derive(Debug, Default)]
pub(crate) struct StepOutcome {
    /// Errored executions in settle order.
    pub errored: Vec<(String, TaskError)>,
    /// Whether any execution ran for real (not from cache).
    pub rebuilt: bool,
}

/// Non-watch driver: strict step sequence, then done.
async fn drive(ctx: DriverCtx, plan: OrderedTargets) {
    if !ctx
        .emit(RunEvent::TargetsResolved {
            targets: plan.flattened(),
        })
        .await
    {
        return;
    }
    if plan.is_empty() {
        debug!("empty plan; completing immediately");
        return;
    }

    for (idx, step) in plan.steps.iter().enumerate() {
        let outcome = match run_step(&ctx, step).await {
            Some(outcome) => outcome,
            None => return,
        };

        if !settle_step(&ctx, &plan, idx, &outcome).await {
            return;
        }

        if ctx.topological() {
            if let Some((workspace, error)) = outcome.errored.into_iter().next() {
                ctx.fail(RunnerError::Task { workspace, error }).await;
                return;
            }
        }
    }
}

/// Step-completion policy: invalidate caches for errored workspaces, and in
/// topological mode for every workspace in strictly-subsequent steps when
/// anything errored or rebuilt. Returns `false` when the stream is done
/// (fatal invalidation failure or consumer gone).
pub(crate) async fn settle_step(
    ctx: &DriverCtx,
    plan: &OrderedTargets,
    step_idx: usize,
    outcome: &StepOutcome,
) -> bool {
    let mut to_invalidate: Vec<String> = outcome
        .errored
        .iter()
        .map(|(workspace, _)| workspace.clone())
        .collect();

    if ctx.topological() && (outcome.rebuilt || !outcome.errored.is_empty()) {
        to_invalidate.extend(
            plan.steps[step_idx + 1..]
                .iter()
                .flatten()
                .map(|rt| rt.workspace.clone()),
        );
    }

    for workspace in to_invalidate {
        match invalidate_workspace(ctx, &workspace).await {
            Ok(()) => {
                if !ctx
                    .emit(RunEvent::CacheInvalidated {
                        workspace: workspace.clone(),
                    })
                    .await
                {
                    return false;
                }
            }
            Err(error) => {
                let _ = ctx
                    .emit(RunEvent::ErrorInvalidatingCache {
                        workspace: workspace.clone(),
                        error: error.clone(),
                    })
                    .await;
                ctx.fail(RunnerError::CacheInvalidation { workspace, error })
                    .await;
                return false;
            }
        }
    }

    true
}

async fn invalidate_workspace(ctx: &DriverCtx, workspace: &str) -> Result<(), CacheError> {
    let Some(ws) = ctx.shared.graph.get(workspace) else {
        return Ok(());
    };
    let store = CacheStore::new(&ws.root, &ctx.shared.target, "", Vec::new());
    tokio::task::spawn_blocking(move || store.invalidate())
        .await
        .unwrap_or(Ok(()))
}

/// Run one step to settlement, forwarding task messages as events.
/// Returns `None` when the consumer is gone or the run turned fatal.
async fn run_step(ctx: &DriverCtx, step: &[ResolvedTarget]) -> Option<StepOutcome> {
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<TaskMsg>();
    let (abort_tx, abort_rx) = watch::channel(false);

    let spawned = spawn_step_tasks(ctx, step, &msg_tx, &abort_rx);
    drop(msg_tx);

    let mut outcome = StepOutcome::default();
    let mut settled = 0usize;
    while settled < spawned {
        let Some(msg) = msg_rx.recv().await else {
            break;
        };
        match msg {
            TaskMsg::Started { workspace } => {
                if !ctx.emit(RunEvent::NodeStarted { workspace }).await {
                    return None;
                }
            }
            TaskMsg::Skipped {
                workspace,
                affected,
                has_command,
            } => {
                settled += 1;
                if !ctx
                    .emit(RunEvent::NodeSkipped {
                        workspace,
                        affected,
                        has_command,
                    })
                    .await
                {
                    return None;
                }
            }
            TaskMsg::NotStarted => settled += 1,
            TaskMsg::Finished { workspace, summary } => {
                settled += 1;
                if !summary.from_cache {
                    outcome.rebuilt = true;
                }
                if !ctx
                    .emit(RunEvent::NodeProcessed { workspace, summary })
                    .await
                {
                    return None;
                }
            }
            TaskMsg::Failed { workspace, error } => {
                settled += 1;
                if let TaskError::Cache(cache_error @ CacheError::InvalidationFailed(_)) = &error {
                    let _ = ctx
                        .emit(RunEvent::ErrorInvalidatingCache {
                            workspace: workspace.clone(),
                            error: cache_error.clone(),
                        })
                        .await;
                    ctx.fail(RunnerError::CacheInvalidation {
                        workspace,
                        error: cache_error.clone(),
                    })
                    .await;
                    return None;
                }
                if ctx.topological() {
                    // Abort the rest of the step; running tasks finish.
                    let _ = abort_tx.send(true);
                }
                if !ctx
                    .emit(RunEvent::NodeErrored {
                        workspace: workspace.clone(),
                        error: error.clone(),
                    })
                    .await
                {
                    return None;
                }
                outcome.errored.push((workspace, error));
            }
        }
    }

    Some(outcome)
}

/// Spawn every task of a step in source order; returns the spawn count.
pub(crate) fn spawn_step_tasks(
    ctx: &DriverCtx,
    step: &[ResolvedTarget],
    msg_tx: &mpsc::UnboundedSender<TaskMsg>,
    abort_rx: &watch::Receiver<bool>,
) -> usize {
    let semaphore = Arc::new(Semaphore::new(ctx.shared.options.concurrency.max(1)));
    for rt in step {
        spawn_task(
            Arc::clone(&ctx.shared),
            rt.clone(),
            msg_tx.clone(),
            abort_rx.clone(),
            Arc::clone(&semaphore),
        );
    }
    step.len()
}

fn spawn_task(
    shared: Arc<TaskCtx>,
    rt: ResolvedTarget,
    msg_tx: mpsc::UnboundedSender<TaskMsg>,
    abort_rx: watch::Receiver<bool>,
    semaphore: Arc<Semaphore>,
) {
    tokio::spawn(async move {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let _ = msg_tx.send(TaskMsg::NotStarted);
                return;
            }
        };
        if *abort_rx.borrow() {
            let _ = msg_tx.send(TaskMsg::NotStarted);
            return;
        }

        if !rt.affected || !rt.has_command {
            let _ = msg_tx.send(TaskMsg::Skipped {
                workspace: rt.workspace,
                affected: rt.affected,
                has_command: rt.has_command,
            });
            return;
        }

        let _ = msg_tx.send(TaskMsg::Started {
            workspace: rt.workspace.clone(),
        });

        match run_target(&shared, &rt.workspace).await {
            Ok(summary) => {
                let _ = msg_tx.send(TaskMsg::Finished {
                    workspace: rt.workspace,
                    summary,
                });
            }
            Err(error) => {
                let _ = msg_tx.send(TaskMsg::Failed {
                    workspace: rt.workspace,
                    error,
                });
            }
        }
    });
}

/// Execute one target in one workspace: cache read, command sequence,
/// cache write.
async fn run_target(shared: &Arc<TaskCtx>, workspace: &str) -> Result<RunSummary, TaskError> {
    let started = Instant::now();

    // Plans are built from the graph, so both lookups hold; stay defensive
    // the way the rest of the crate is.
    let Some(ws) = shared.graph.get(workspace) else {
        warn!(workspace, "planned workspace missing from graph");
        return Err(TaskError::Process(crate::errors::ProcessError::Spawn(
            format!("workspace '{workspace}' not found"),
        )));
    };
    let Some(config) = ws.target(&shared.target) else {
        warn!(workspace, target = %shared.target, "planned target missing from workspace");
        return Err(TaskError::Process(crate::errors::ProcessError::Spawn(
            format!("target '{}' not found in '{workspace}'", shared.target),
        )));
    };

    let store = Arc::new(CacheStore::new(
        &ws.root,
        &shared.target,
        config.canonical_command(),
        config.src.clone(),
    ));

    if !shared.options.force {
        let read_store = Arc::clone(&store);
        let cached = tokio::task::spawn_blocking(move || read_store.read())
            .await
            .unwrap_or(None);
        if let Some(results) = cached {
            debug!(workspace, target = %shared.target, "cache hit; skipping execution");
            return Ok(RunSummary {
                from_cache: true,
                results,
                took: started.elapsed(),
            });
        }
    }

    let key = TaskKey::new(workspace, &shared.target);
    let spawn_opts = SpawnOptions {
        cwd: ws.root.clone(),
        env: shared.options.env.clone(),
        stdio: shared.options.stdio,
    };

    let mut results: Vec<CommandResult> = Vec::with_capacity(config.commands.len());
    for command in &config.commands {
        let line = compose_command(&command.run, &shared.options.args);
        if command.is_daemon() {
            let daemon = shared
                .processes
                .run_daemon(&key, &line, &command.daemon, &spawn_opts)
                .await
                .map_err(TaskError::Daemon)?;
            // The process is still running; record the readiness delay in
            // place of a captured result.
            results.push(CommandResult {
                command: line,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                all: String::new(),
                took_ms: daemon.took.as_millis() as u64,
            });
        } else {
            let result = shared
                .processes
                .run_command(&key, &line, &spawn_opts)
                .await
                .map_err(TaskError::Process)?;
            results.push(result);
        }
    }

    // A target holding a daemon never completes, so there is nothing
    // cacheable about it.
    if !config.has_daemon() {
        let write_store = Arc::clone(&store);
        let write_results = results.clone();
        let written = tokio::task::spawn_blocking(move || write_store.write(&write_results))
            .await
            .unwrap_or(Ok(()));
        match written {
            Ok(()) => {}
            Err(error @ CacheError::InvalidationFailed(_)) => {
                return Err(TaskError::Cache(error));
            }
            Err(error) => {
                warn!(workspace, target = %shared.target, %error, "cache write failed; run continues uncached");
            }
        }
    }

    Ok(RunSummary {
        from_cache: false,
        results,
        took: started.elapsed(),
    })
}

/// Append the caller's extra arguments to a command line.
fn compose_command(run: &str, args: &[String]) -> String {
    if args.is_empty() {
        run.to_string()
    } else {
        format!("{run} {}", args.join(" "))
    }
}
