// src/run/plan.rs

//! Turns a target name plus run options into an ordered execution plan.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::affected::AffectedResolver;
use crate::errors::SchedulerError;
use crate::project::{Workspace, WorkspaceGraph};
use crate::run::events::PlannedTarget;
use crate::run::{RunMode, RunOptions};
use crate::vcs::VcsProbe;

/// One workspace's slot in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub workspace: String,
    pub affected: bool,
    pub has_command: bool,
}

/// The full execution plan: a sequence of steps, each a set of workspaces
/// executable in parallel.
#[derive(Debug, Clone, Default)]
pub struct OrderedTargets {
    pub steps: Vec<Vec<ResolvedTarget>>,
}

impl OrderedTargets {
    /// Total number of planned targets across all steps.
    pub fn len(&self) -> usize {
        self.steps.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The step index a workspace is planned in.
    pub fn step_of(&self, workspace: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.iter().any(|rt| rt.workspace == workspace))
    }

    pub fn target_for(&self, workspace: &str) -> Option<&ResolvedTarget> {
        self.steps
            .iter()
            .flatten()
            .find(|rt| rt.workspace == workspace)
    }

    /// Flatten into the `TargetsResolved` payload.
    pub fn flattened(&self) -> Vec<PlannedTarget> {
        self.steps
            .iter()
            .enumerate()
            .flat_map(|(step, targets)| {
                targets.iter().map(move |rt| PlannedTarget {
                    workspace: rt.workspace.clone(),
                    step,
                    affected: rt.affected,
                    has_command: rt.has_command,
                })
            })
            .collect()
    }
}

/// Resolves plans against the workspace graph and the affected state.
pub struct TargetsResolver<'a> {
    graph: &'a WorkspaceGraph,
    vcs: &'a dyn VcsProbe,
}

impl<'a> TargetsResolver<'a> {
    pub fn new(graph: &'a WorkspaceGraph, vcs: &'a dyn VcsProbe) -> Self {
        Self { graph, vcs }
    }

    /// Build the plan for `target` under the given options.
    ///
    /// Fails with `UnknownTarget` when no workspace declares the target and
    /// propagates `BadRevision` from affected resolution.
    pub async fn resolve(
        &self,
        target: &str,
        options: &RunOptions,
    ) -> Result<OrderedTargets, SchedulerError> {
        if !self.graph.has_target(target) {
            return Err(SchedulerError::UnknownTarget(target.to_string()));
        }

        let plan = match options.mode {
            RunMode::Parallel => self.resolve_parallel(target, options).await?,
            RunMode::Topological => self.resolve_topological(target, options).await?,
        };

        debug!(
            target,
            steps = plan.steps.len(),
            targets = plan.len(),
            "plan resolved"
        );
        Ok(plan)
    }

    async fn resolve_parallel(
        &self,
        target: &str,
        options: &RunOptions,
    ) -> Result<OrderedTargets, SchedulerError> {
        let eligible: Vec<&Workspace> = match &options.workspaces {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let found = self.graph.get(name);
                    if found.is_none() {
                        warn!(workspace = %name, "selected workspace not found; ignoring");
                    }
                    found
                })
                .collect(),
            None => self.graph.workspaces().collect(),
        };

        let step = self
            .resolve_targets(target, &eligible, options, false)
            .await?;
        Ok(OrderedTargets { steps: vec![step] })
    }

    async fn resolve_topological(
        &self,
        target: &str,
        options: &RunOptions,
    ) -> Result<OrderedTargets, SchedulerError> {
        let eligible = self.graph.topological(options.to.as_deref());
        let resolved = self
            .resolve_targets(target, &eligible, options, true)
            .await?;

        Ok(partition_steps(self.graph, eligible, resolved))
    }

    /// Resolve the per-workspace flags, preserving the eligible order.
    async fn resolve_targets(
        &self,
        target: &str,
        eligible: &[&Workspace],
        options: &RunOptions,
        topological: bool,
    ) -> Result<Vec<ResolvedTarget>, SchedulerError> {
        let mut resolver = options
            .affected
            .as_ref()
            .map(|range| AffectedResolver::new(self.graph, self.vcs, range.clone()));

        let mut targets = Vec::with_capacity(eligible.len());
        for workspace in eligible {
            let config = workspace.target(target);
            let affected = match resolver.as_mut() {
                Some(resolver) => {
                    let patterns: &[String] = config.map(|c| c.src.as_slice()).unwrap_or(&[]);
                    resolver
                        .is_affected(&workspace.name, patterns, topological)
                        .await?
                }
                None => true,
            };

            targets.push(ResolvedTarget {
                workspace: workspace.name.clone(),
                affected,
                has_command: config.is_some(),
            });
        }
        Ok(targets)
    }
}

/// Partition topologically ordered targets into steps: step `k` holds the
/// workspaces whose in-plan dependencies all sit in steps `0..k`.
fn partition_steps(
    graph: &WorkspaceGraph,
    eligible: Vec<&Workspace>,
    resolved: Vec<ResolvedTarget>,
) -> OrderedTargets {
    let in_plan: HashSet<&str> = eligible.iter().map(|w| w.name.as_str()).collect();
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut steps: Vec<Vec<ResolvedTarget>> = Vec::new();

    // `eligible` is topologically ordered, so dependencies always have
    // their level assigned before their dependents.
    for (workspace, target) in eligible.iter().zip(resolved) {
        let step = graph
            .dependencies_of(&workspace.name)
            .filter(|dep| in_plan.contains(dep.name.as_str()))
            .filter_map(|dep| level.get(dep.name.as_str()))
            .map(|dep_level| dep_level + 1)
            .max()
            .unwrap_or(0);

        level.insert(workspace.name.as_str(), step);
        if steps.len() <= step {
            steps.resize_with(step + 1, Vec::new);
        }
        steps[step].push(target);
    }

    OrderedTargets { steps }
}
