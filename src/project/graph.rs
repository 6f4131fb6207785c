// src/project/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSetBuilder};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info, warn};

use crate::errors::ProjectLoadError;
use crate::project::manifest::PackageManifest;
use crate::project::targets::{self, TargetConfig};

/// Directories never considered when expanding workspace globs.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", ".caches"];

/// A single workspace: identity, location, and its target recipes.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub name: String,
    /// Absolute path to the workspace directory.
    pub root: PathBuf,
    pub version: Option<String>,
    pub private: bool,
    /// Names of in-project workspaces this one depends on (regular and dev
    /// dependencies combined; external packages are not represented).
    pub dependencies: BTreeSet<String>,
    pub targets: BTreeMap<String, TargetConfig>,
}

impl Workspace {
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.get(name)
    }

    /// The workspace root relative to the project root.
    pub fn relative_root(&self, project_root: &Path) -> PathBuf {
        self.root
            .strip_prefix(project_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.root.clone())
    }
}

/// The loaded project: every workspace plus dependency/dependent adjacency.
///
/// Acyclicity is checked once at load; traversal methods assume a DAG.
#[derive(Debug)]
pub struct WorkspaceGraph {
    project_root: PathBuf,
    workspaces: BTreeMap<String, Workspace>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl WorkspaceGraph {
    /// Load a project from its root directory.
    ///
    /// Reads the root manifest for workspace globs, loads each matching
    /// workspace's manifest and target configuration, draws dependency
    /// edges between known workspaces, and rejects cycles.
    pub fn load(project_root: &Path) -> Result<Self, ProjectLoadError> {
        let project_root = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());

        let root_manifest = PackageManifest::load(&project_root.join("package.json"))?;

        let mut workspaces = BTreeMap::new();
        for dir in expand_workspace_globs(&project_root, &root_manifest.workspaces)? {
            let manifest_path = dir.join("package.json");
            if !manifest_path.exists() {
                debug!(dir = %dir.display(), "workspace glob matched directory without manifest; skipping");
                continue;
            }

            let manifest = PackageManifest::load(&manifest_path)?;
            let targets = targets::load_targets(&dir)?;
            let declared: BTreeSet<String> =
                manifest.dependency_names().map(str::to_string).collect();

            let workspace = Workspace {
                name: manifest.name.clone(),
                root: dir,
                version: manifest.version,
                private: manifest.private,
                dependencies: declared,
                targets,
            };

            if let Some(previous) = workspaces.insert(workspace.name.clone(), workspace) {
                warn!(
                    workspace = %previous.name,
                    "duplicate workspace name; keeping the last one loaded"
                );
            }
        }

        // Keep only edges to known workspaces; external packages are not
        // part of the graph.
        let known: HashSet<String> = workspaces.keys().cloned().collect();
        for workspace in workspaces.values_mut() {
            workspace.dependencies.retain(|dep| known.contains(dep));
        }

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for workspace in workspaces.values() {
            for dep in &workspace.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(workspace.name.clone());
            }
        }

        let graph = Self {
            project_root,
            workspaces,
            dependents,
        };
        graph.reject_cycles()?;

        info!(workspaces = graph.workspaces.len(), "project loaded");
        Ok(graph)
    }

    fn reject_cycles(&self) -> Result<(), ProjectLoadError> {
        // Edge direction: dependency -> dependent, the same orientation the
        // scheduler executes in.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in self.workspaces.keys() {
            graph.add_node(name.as_str());
        }
        for workspace in self.workspaces.values() {
            for dep in &workspace.dependencies {
                graph.add_edge(dep.as_str(), workspace.name.as_str(), ());
            }
        }

        match toposort(&graph, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => Err(ProjectLoadError::Cycle(cycle.node_id().to_string())),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn workspaces(&self) -> impl Iterator<Item = &Workspace> {
        self.workspaces.values()
    }

    pub fn get(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.get(name)
    }

    /// Direct dependencies of a workspace (in-project only).
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &Workspace> {
        self.workspaces
            .get(name)
            .into_iter()
            .flat_map(|w| w.dependencies.iter())
            .filter_map(|dep| self.workspaces.get(dep))
    }

    /// Direct dependents of a workspace.
    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &Workspace> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|dep| self.workspaces.get(dep))
    }

    /// Whether any workspace declares the given target.
    pub fn has_target(&self, target: &str) -> bool {
        self.workspaces.values().any(|w| w.targets.contains_key(target))
    }

    /// Depth-first post-order over dependency edges: every emitted workspace
    /// appears after all of its dependencies.
    ///
    /// With `to` set, only the transitive dependency closure of that
    /// workspace is emitted; otherwise every workspace is, starting from the
    /// dependent-free roots.
    pub fn topological(&self, to: Option<&str>) -> Vec<&Workspace> {
        let starts: Vec<&str> = match to {
            Some(name) => self.workspaces.get(name).map(|w| w.name.as_str()).into_iter().collect(),
            None => self
                .workspaces
                .values()
                .filter(|w| !self.dependents.contains_key(&w.name))
                .map(|w| w.name.as_str())
                .collect(),
        };

        let mut visited: HashSet<&str> = HashSet::new();
        let mut order: Vec<&Workspace> = Vec::new();
        for start in starts {
            self.post_order(start, &mut visited, &mut order);
        }
        order
    }

    fn post_order<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        order: &mut Vec<&'a Workspace>,
    ) {
        if !visited.insert(name) {
            return;
        }
        let Some(workspace) = self.workspaces.get(name) else {
            return;
        };
        for dep in &workspace.dependencies {
            self.post_order(dep, visited, order);
        }
        order.push(workspace);
    }
}

/// Expand the root manifest's workspace globs into workspace directories.
fn expand_workspace_globs(
    project_root: &Path,
    patterns: &[String],
) -> Result<Vec<PathBuf>, ProjectLoadError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| ProjectLoadError::BadWorkspaceGlob {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| ProjectLoadError::BadWorkspaceGlob {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

    let mut dirs = Vec::new();
    let mut stack = vec![project_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to read directory while expanding workspace globs");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(project_root) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if set.is_match(&rel_str) {
                    dirs.push(path.clone());
                }
            }
            stack.push(path);
        }
    }

    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_json(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn scaffold(root: &Path, name: &str, deps: &[&str]) {
        let deps_json: Vec<String> = deps.iter().map(|d| format!(r#""{d}": "*""#)).collect();
        write_json(
            &root.join("packages").join(name).join("package.json"),
            &format!(
                r#"{{ "name": "{name}", "version": "1.0.0", "dependencies": {{ {} }} }}"#,
                deps_json.join(", ")
            ),
        );
    }

    fn project(names_and_deps: &[(&str, &[&str])]) -> (tempfile::TempDir, WorkspaceGraph) {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            &dir.path().join("package.json"),
            r#"{ "name": "root", "workspaces": ["packages/*"] }"#,
        );
        for (name, deps) in names_and_deps {
            scaffold(dir.path(), name, deps);
        }
        let graph = WorkspaceGraph::load(dir.path()).unwrap();
        (dir, graph)
    }

    #[test]
    fn loads_workspaces_and_filters_external_deps() {
        let (_dir, graph) = project(&[("a", &[]), ("b", &["a", "left-pad"])]);

        assert_eq!(graph.workspaces().count(), 2);
        let b = graph.get("b").unwrap();
        assert_eq!(b.dependencies.iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(
            graph.dependents_of("a").map(|w| w.name.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
    }

    #[test]
    fn topological_emits_dependencies_first() {
        let (_dir, graph) = project(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &[]),
            ("d", &["b", "c"]),
        ]);

        let order: Vec<&str> = graph.topological(None).iter().map(|w| w.name.as_str()).collect();
        assert_eq!(order.len(), 4);
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn topological_to_limits_to_dependency_closure() {
        let (_dir, graph) = project(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &[]),
            ("d", &["b", "c"]),
        ]);

        let order: Vec<&str> = graph
            .topological(Some("b"))
            .iter()
            .map(|w| w.name.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn cycle_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            &dir.path().join("package.json"),
            r#"{ "name": "root", "workspaces": ["packages/*"] }"#,
        );
        scaffold(dir.path(), "a", &["b"]);
        scaffold(dir.path(), "b", &["a"]);

        let err = WorkspaceGraph::load(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectLoadError::Cycle(_)));
    }
}
