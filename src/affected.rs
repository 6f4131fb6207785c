// src/affected.rs

//! Decides which workspaces are "affected" by a revision range.
//!
//! A workspace is locally affected when the range touches files matching its
//! source patterns; the topology-aware variant also walks the workspace's
//! transitive dependencies, where any change in the dependency's tree counts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSetBuilder};
use tracing::{debug, warn};

use crate::errors::VcsError;
use crate::project::WorkspaceGraph;
use crate::vcs::VcsProbe;

/// A pair of version-control revisions. Without `rev2`, the range runs from
/// `rev1` to the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRange {
    pub rev1: String,
    pub rev2: Option<String>,
}

impl RevisionRange {
    pub fn new(rev1: impl Into<String>, rev2: Option<String>) -> Self {
        Self {
            rev1: rev1.into(),
            rev2,
        }
    }

    /// Parse the CLI form `rev1[..rev2]`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once("..") {
            Some((rev1, rev2)) if !rev2.is_empty() => {
                Self::new(rev1.to_string(), Some(rev2.to_string()))
            }
            _ => Self::new(spec.to_string(), None),
        }
    }
}

/// Patterns meaning "any change in the workspace tree counts".
fn is_match_all(patterns: &[String]) -> bool {
    patterns.is_empty() || (patterns.len() == 1 && patterns[0] == "**")
}

/// Resolves affectedness against a single revision range.
///
/// The resolver memoises per-workspace verdicts for dependency walks, so a
/// plan resolution visits each workspace's diff at most once.
pub struct AffectedResolver<'a> {
    graph: &'a WorkspaceGraph,
    vcs: &'a dyn VcsProbe,
    range: RevisionRange,
    validated: bool,
    /// Memoised "any change in tree" verdicts, used for dependency walks.
    memo: HashMap<String, bool>,
}

impl<'a> AffectedResolver<'a> {
    pub fn new(graph: &'a WorkspaceGraph, vcs: &'a dyn VcsProbe, range: RevisionRange) -> Self {
        Self {
            graph,
            vcs,
            range,
            validated: false,
            memo: HashMap::new(),
        }
    }

    /// Whether `workspace` is affected by the range.
    ///
    /// `patterns` scope the local check; with `topological` set, the
    /// workspace is also affected when any transitive dependency changed.
    /// Any bad revision fails the whole call.
    pub async fn is_affected(
        &mut self,
        workspace: &str,
        patterns: &[String],
        topological: bool,
    ) -> Result<bool, VcsError> {
        self.validate_range().await?;

        if self.locally_affected(workspace, patterns).await? {
            return Ok(true);
        }
        if !topological {
            return Ok(false);
        }

        // Walk the transitive dependencies; any change anywhere in a
        // dependency's tree propagates to this workspace.
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = self
            .graph
            .dependencies_of(workspace)
            .map(|w| w.name.clone())
            .collect();

        while let Some(dep) = stack.pop() {
            if !visited.insert(dep.clone()) {
                continue;
            }
            if self.tree_changed(&dep).await? {
                debug!(workspace, dependency = %dep, "affected through dependency");
                return Ok(true);
            }
            stack.extend(self.graph.dependencies_of(&dep).map(|w| w.name.clone()));
        }

        Ok(false)
    }

    async fn validate_range(&mut self) -> Result<(), VcsError> {
        if self.validated {
            return Ok(());
        }
        if !self.vcs.revision_exists(&self.range.rev1).await? {
            return Err(VcsError::BadRevision(self.range.rev1.clone()));
        }
        if let Some(rev2) = &self.range.rev2 {
            if !self.vcs.revision_exists(rev2).await? {
                return Err(VcsError::BadRevision(rev2.clone()));
            }
        }
        self.validated = true;
        Ok(())
    }

    async fn locally_affected(
        &mut self,
        workspace: &str,
        patterns: &[String],
    ) -> Result<bool, VcsError> {
        if is_match_all(patterns) {
            return self.tree_changed(workspace).await;
        }

        let Some(ws) = self.graph.get(workspace) else {
            warn!(workspace, "affected check for unknown workspace");
            return Ok(false);
        };

        let diffs = self.diff_for(workspace).await?;
        if diffs.is_empty() {
            return Ok(false);
        }

        // Expand the patterns under the workspace root and compare against
        // the diff paths, both relative to the project root.
        let expanded = match expand_patterns(self.graph.project_root(), &ws.root, patterns) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(workspace, error = %e, "failed to expand source patterns; treating as affected");
                return Ok(true);
            }
        };

        Ok(diffs.iter().any(|diff| expanded.contains(diff)))
    }

    /// Memoised "anything changed under the workspace root" check.
    async fn tree_changed(&mut self, workspace: &str) -> Result<bool, VcsError> {
        if let Some(&hit) = self.memo.get(workspace) {
            return Ok(hit);
        }
        let changed = !self.diff_for(workspace).await?.is_empty();
        self.memo.insert(workspace.to_string(), changed);
        Ok(changed)
    }

    async fn diff_for(&self, workspace: &str) -> Result<Vec<PathBuf>, VcsError> {
        let prefix = self
            .graph
            .get(workspace)
            .map(|w| w.relative_root(self.graph.project_root()));
        self.vcs
            .diff_names(&self.range.rev1, self.range.rev2.as_deref(), prefix.as_deref())
            .await
    }
}

/// Expand glob patterns rooted at a workspace into project-root-relative
/// paths of existing files.
fn expand_patterns(
    project_root: &Path,
    workspace_root: &Path,
    patterns: &[String],
) -> Result<HashSet<PathBuf>, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    let set = builder.build()?;

    let mut matched = HashSet::new();
    let mut stack = vec![workspace_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(workspace_root) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if set.is_match(&rel_str) {
                    if let Ok(project_rel) = path.strip_prefix(project_root) {
                        matched.insert(project_rel.to_path_buf());
                    }
                }
            }
        }
    }

    Ok(matched)
}
