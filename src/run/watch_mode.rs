// src/run/watch_mode.rs

//! Watch-mode execution: reacts to source changes mid-run by interrupting,
//! killing, and rescheduling only the impacted part of the plan.
//!
//! The driver loop is the single owner of [`WatchState`]; task completions,
//! debounced change batches, and consumer control messages are multiplexed
//! onto it, so every mutation is serialised.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::{CacheError, RunnerError, TaskError};
use crate::process::TaskKey;
use crate::run::events::{ControlMsg, RunEvent};
use crate::run::plan::{OrderedTargets, ResolvedTarget};
use crate::run::scheduler::{settle_step, spawn_step_tasks, DriverCtx, StepOutcome, TaskMsg};
use crate::watch::{spawn_watcher, WatchEvent, WatchPipe, WatcherHandle};

/// Mutable per-run state for watch mode.
#[derive(Debug, Default)]
struct WatchState {
    /// Step whose tasks are currently executing; `None` between passes.
    current_step: Option<usize>,
    /// Workspaces with an in-flight process invocation.
    running: HashSet<String>,
    /// Workspaces that reached `NodeProcessed`/`NodeErrored` this pass and
    /// were not impacted since.
    processed: HashSet<String>,
    /// Workspaces whose sources changed and that must re-run.
    impacted: HashSet<String>,
    /// Workspaces whose processes were killed; their eventual completions
    /// are swallowed.
    killed: HashSet<String>,
    /// Abort once the current step has settled.
    let_finish_and_abort: bool,
    /// Abort now: remaining queued tasks must not start.
    should_abort: bool,
}

impl WatchState {
    fn wants_reschedule(&self) -> bool {
        (self.should_abort || self.let_finish_and_abort) && !self.impacted.is_empty()
    }

    /// Consume the impacted set for a reschedule: processed entries for
    /// impacted workspaces are dropped (everything else stays
    /// authoritative), kill bookkeeping resets.
    fn take_reschedule(&mut self, plan: &OrderedTargets) -> (usize, HashSet<String>) {
        let impacted = std::mem::take(&mut self.impacted);
        let from_step = impacted
            .iter()
            .filter_map(|ws| plan.step_of(ws))
            .min()
            .unwrap_or(0);
        for workspace in &impacted {
            self.processed.remove(workspace);
        }
        self.killed.clear();
        self.running.clear();
        self.let_finish_and_abort = false;
        self.should_abort = false;
        (from_step, impacted)
    }
}

/// Watch-mode driver. Emits `TargetsResolved` once, then loops passes until
/// the consumer unwatches (or goes away).
pub(crate) async fn drive_watch(
    ctx: DriverCtx,
    plan: OrderedTargets,
    mut ctrl_rx: mpsc::UnboundedReceiver<ControlMsg>,
    pipe: Option<WatchPipe>,
) {
    if !ctx
        .emit(RunEvent::TargetsResolved {
            targets: plan.flattened(),
        })
        .await
    {
        return;
    }
    if plan.is_empty() {
        debug!("empty watch plan; completing immediately");
        return;
    }

    let pipe = match pipe {
        Some(pipe) => pipe,
        None => {
            let debounce = Duration::from_millis(ctx.shared.options.debounce_ms);
            match spawn_watcher(&ctx.shared.graph, &plan, &ctx.shared.target, debounce) {
                Ok(pipe) => pipe,
                Err(e) => {
                    ctx.fail(RunnerError::Watch(e.to_string())).await;
                    return;
                }
            }
        }
    };
    let WatchPipe {
        mut handle,
        mut batches,
    } = pipe;

    let mut state = WatchState::default();
    let mut pass_from = 0usize;
    let mut reduced: Option<HashSet<String>> = None;

    'pass: loop {
        let mut step_idx = pass_from;
        let mut pass_errored = false;

        while step_idx < plan.steps.len() {
            let members: Vec<ResolvedTarget> = plan.steps[step_idx]
                .iter()
                .filter(|rt| match (&reduced, step_idx == pass_from) {
                    (Some(set), true) => set.contains(&rt.workspace),
                    _ => true,
                })
                .cloned()
                .collect();

            if members.is_empty() {
                step_idx += 1;
                continue;
            }

            state.current_step = Some(step_idx);
            let outcome = match run_watched_step(
                &ctx,
                &plan,
                &mut state,
                &members,
                &mut batches,
                &mut ctrl_rx,
                &mut handle,
            )
            .await
            {
                StepRun::Settled(outcome) => outcome,
                StepRun::Unwatched(outcome) => {
                    // Current step settled; finish the bookkeeping and
                    // complete cleanly.
                    let _ = settle_step(&ctx, &plan, step_idx, &outcome).await;
                    info!("unwatched; run complete");
                    return;
                }
                StepRun::Fatal => return,
            };

            if !settle_step(&ctx, &plan, step_idx, &outcome).await {
                return;
            }

            if state.wants_reschedule() {
                let (from_step, impacted) = state.take_reschedule(&plan);
                debug!(from_step, impacted = impacted.len(), "rescheduling after interruption");
                pass_from = from_step;
                reduced = Some(impacted);
                continue 'pass;
            }

            if ctx.topological() && !outcome.errored.is_empty() {
                // Skip the remaining steps of this pass; the run stays
                // alive waiting for changes.
                pass_errored = true;
                break;
            }

            step_idx += 1;
        }

        if pass_errored {
            debug!("pass aborted after step error; waiting for changes");
        } else {
            debug!("pass complete; waiting for changes");
        }
        state.current_step = None;
        reduced = None;

        // Idle: only change batches or an unwatch can wake us.
        loop {
            tokio::select! {
                maybe_batch = batches.recv() => {
                    let Some(batch) = maybe_batch else {
                        warn!("watch event stream closed; completing");
                        return;
                    };
                    for event in batch {
                        if !handle_change(&ctx, &plan, &mut state, event, None).await {
                            return;
                        }
                    }
                    if !state.impacted.is_empty() {
                        let (from_step, impacted) = state.take_reschedule(&plan);
                        debug!(from_step, impacted = impacted.len(), "rescheduling from idle");
                        pass_from = from_step;
                        reduced = Some(impacted);
                        continue 'pass;
                    }
                }
                maybe_ctrl = ctrl_rx.recv() => {
                    match maybe_ctrl {
                        Some(ControlMsg::Unwatch) | None => {
                            handle.unwatch();
                            info!("unwatched; run complete");
                            return;
                        }
                    }
                }
            }
        }
    }
}

enum StepRun {
    Settled(StepOutcome),
    /// The consumer unwatched mid-step; tasks were left to settle.
    Unwatched(StepOutcome),
    /// Consumer gone or fatal cache failure; the driver must stop.
    Fatal,
}

/// Run one step while reacting to change batches and control messages.
#[allow(clippy::too_many_arguments)]
async fn run_watched_step(
    ctx: &DriverCtx,
    plan: &OrderedTargets,
    state: &mut WatchState,
    members: &[ResolvedTarget],
    batches: &mut mpsc::Receiver<Vec<WatchEvent>>,
    ctrl_rx: &mut mpsc::UnboundedReceiver<ControlMsg>,
    handle: &mut WatcherHandle,
) -> StepRun {
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<TaskMsg>();
    let (abort_tx, abort_rx) = watch::channel(false);

    let spawned = spawn_step_tasks(ctx, members, &msg_tx, &abort_rx);
    drop(msg_tx);

    let mut outcome = StepOutcome::default();
    let mut settled = 0usize;
    let mut unwatching = false;
    let mut batches_closed = false;
    let mut ctrl_closed = false;

    while settled < spawned {
        tokio::select! {
            maybe_msg = msg_rx.recv() => {
                let Some(msg) = maybe_msg else { break };
                match msg {
                    TaskMsg::Started { workspace } => {
                        state.running.insert(workspace.clone());
                        if !ctx.emit(RunEvent::NodeStarted { workspace }).await {
                            return StepRun::Fatal;
                        }
                    }
                    TaskMsg::NotStarted => settled += 1,
                    TaskMsg::Skipped { workspace, affected, has_command } => {
                        settled += 1;
                        if !ctx.emit(RunEvent::NodeSkipped { workspace, affected, has_command }).await {
                            return StepRun::Fatal;
                        }
                    }
                    TaskMsg::Finished { workspace, summary } => {
                        settled += 1;
                        state.running.remove(&workspace);
                        if state.killed.contains(&workspace) {
                            // Cancelled by an interrupt; the completion is
                            // swallowed.
                            debug!(workspace = %workspace, "dropping completion of killed task");
                        } else {
                            if !summary.from_cache {
                                outcome.rebuilt = true;
                            }
                            state.processed.insert(workspace.clone());
                            if !ctx.emit(RunEvent::NodeProcessed { workspace, summary }).await {
                                return StepRun::Fatal;
                            }
                        }
                    }
                    TaskMsg::Failed { workspace, error } => {
                        settled += 1;
                        state.running.remove(&workspace);
                        if state.killed.contains(&workspace) {
                            debug!(workspace = %workspace, "dropping failure of killed task");
                        } else if let TaskError::Cache(cache_error @ CacheError::InvalidationFailed(_)) = &error {
                            let _ = ctx.emit(RunEvent::ErrorInvalidatingCache {
                                workspace: workspace.clone(),
                                error: cache_error.clone(),
                            }).await;
                            ctx.fail(RunnerError::CacheInvalidation {
                                workspace,
                                error: cache_error.clone(),
                            }).await;
                            return StepRun::Fatal;
                        } else {
                            state.processed.insert(workspace.clone());
                            if ctx.topological() {
                                let _ = abort_tx.send(true);
                            }
                            if !ctx.emit(RunEvent::NodeErrored {
                                workspace: workspace.clone(),
                                error: error.clone(),
                            }).await {
                                return StepRun::Fatal;
                            }
                            outcome.errored.push((workspace, error));
                        }
                    }
                }
            }
            maybe_batch = batches.recv(), if !batches_closed => {
                match maybe_batch {
                    Some(batch) => {
                        for event in batch {
                            if !handle_change(ctx, plan, state, event, Some(&abort_tx)).await {
                                return StepRun::Fatal;
                            }
                        }
                    }
                    None => batches_closed = true,
                }
            }
            maybe_ctrl = ctrl_rx.recv(), if !ctrl_closed => {
                if maybe_ctrl.is_none() {
                    ctrl_closed = true;
                }
                if matches!(maybe_ctrl, Some(ControlMsg::Unwatch) | None) && !unwatching {
                    info!("unwatch requested; aborting after current tasks settle");
                    unwatching = true;
                    handle.unwatch();
                    let _ = abort_tx.send(true);
                }
            }
        }
    }

    if unwatching {
        StepRun::Unwatched(outcome)
    } else {
        StepRun::Settled(outcome)
    }
}

/// React to a single source change. Returns `false` when the consumer is
/// gone.
async fn handle_change(
    ctx: &DriverCtx,
    plan: &OrderedTargets,
    state: &mut WatchState,
    event: WatchEvent,
    abort_tx: Option<&watch::Sender<bool>>,
) -> bool {
    let WatchEvent {
        workspace,
        kind,
        path,
    } = event;

    if !ctx
        .emit(RunEvent::SourcesChanged {
            workspace: workspace.clone(),
            kind,
            path,
        })
        .await
    {
        return false;
    }

    // Changes on targets that would not execute anyway trigger nothing.
    let Some(rt) = plan.target_for(&workspace) else {
        return true;
    };
    if !rt.affected || !rt.has_command {
        return true;
    }
    let Some(changed_step) = plan.step_of(&workspace) else {
        return true;
    };

    // Between passes every step counts as "earlier": impact and reschedule.
    let current = state.current_step.unwrap_or(usize::MAX);

    if changed_step < current {
        debug!(
            workspace = %workspace,
            changed_step, current, "change in earlier step; aborting current step"
        );
        state.should_abort = true;
        state.impacted.insert(workspace);
        if let Some(abort_tx) = abort_tx {
            let _ = abort_tx.send(true);
        }
        // Kill everything the current step has in flight.
        for running in state.running.clone() {
            if !kill_workspace(ctx, state, running).await {
                return false;
            }
        }
    } else if changed_step == current {
        if state.running.contains(&workspace) {
            debug!(workspace = %workspace, "change on running task; killing and finishing step");
            state.impacted.insert(workspace.clone());
            state.let_finish_and_abort = true;
            if !kill_workspace(ctx, state, workspace).await {
                return false;
            }
        } else if state.processed.contains(&workspace) {
            debug!(workspace = %workspace, "change on processed task; rescheduling after step");
            state.impacted.insert(workspace);
            state.let_finish_and_abort = true;
        }
        // Not started yet: the step will reach it with the new sources.
    }
    // changed_step > current: the plan naturally reaches it.

    true
}

/// Kill a workspace's in-flight processes, once, emitting `NodeInterrupted`.
async fn kill_workspace(ctx: &DriverCtx, state: &mut WatchState, workspace: String) -> bool {
    if !state.killed.insert(workspace.clone()) {
        return true;
    }
    if !ctx
        .emit(RunEvent::NodeInterrupted {
            workspace: workspace.clone(),
        })
        .await
    {
        return false;
    }

    let key = TaskKey::new(workspace, &ctx.shared.target);
    let ports = ctx.shared.options.release_ports.clone();
    let grace = Duration::from_millis(ctx.shared.options.grace_ms);
    let processes = std::sync::Arc::clone(&ctx.shared.processes);
    // The kill protocol has its own grace period; never block the event
    // loop on it.
    tokio::spawn(async move {
        processes.kill(&key, &ports, grace).await;
    });
    true
}
