// crates/test-utils/src/project.rs

//! Builds throwaway projects on disk for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use toporun::project::WorkspaceGraph;

/// One workspace to scaffold.
#[derive(Debug, Clone)]
pub struct WorkspaceSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    /// `(target name, commands, src globs)` triples written to
    /// `targets.json`.
    pub targets: Vec<(String, Vec<String>, Vec<String>)>,
    /// Extra `path -> contents` files under the workspace root.
    pub files: Vec<(String, String)>,
}

impl WorkspaceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            targets: Vec::new(),
            files: vec![("src/index.js".to_string(), "// source\n".to_string())],
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Add a target with a single command and the default `src/**` globs.
    pub fn target(self, name: &str, command: &str) -> Self {
        self.target_with(name, &[command], &["src/**"])
    }

    pub fn target_with(mut self, name: &str, commands: &[&str], src: &[&str]) -> Self {
        self.targets.push((
            name.to_string(),
            commands.iter().map(|c| c.to_string()).collect(),
            src.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    pub fn file(mut self, path: &str, contents: &str) -> Self {
        self.files.push((path.to_string(), contents.to_string()));
        self
    }

    /// Raw `targets.json` contents, overriding the structured `targets`.
    pub fn raw_targets(mut self, contents: &str) -> Self {
        self.files
            .push(("targets.json".to_string(), contents.to_string()));
        self.targets.clear();
        self
    }
}

/// Fluent builder for an on-disk project.
#[derive(Debug, Default)]
pub struct ProjectBuilder {
    workspaces: Vec<WorkspaceSpec>,
}

impl ProjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workspace(mut self, spec: WorkspaceSpec) -> Self {
        self.workspaces.push(spec);
        self
    }

    pub fn build(self) -> FixtureProject {
        let dir = TempDir::new().expect("create fixture dir");
        let root = dir.path().to_path_buf();

        write(
            &root.join("package.json"),
            r#"{ "name": "fixture-root", "workspaces": ["packages/*"] }"#,
        );

        for spec in &self.workspaces {
            let ws_root = root.join("packages").join(&spec.name);
            let deps: Vec<String> = spec
                .dependencies
                .iter()
                .map(|d| format!(r#""{d}": "*""#))
                .collect();
            write(
                &ws_root.join("package.json"),
                &format!(
                    r#"{{ "name": "{}", "version": "1.0.0", "dependencies": {{ {} }} }}"#,
                    spec.name,
                    deps.join(", ")
                ),
            );

            if !spec.targets.is_empty() {
                let targets: Vec<String> = spec
                    .targets
                    .iter()
                    .map(|(name, commands, src)| {
                        let cmds: Vec<String> =
                            commands.iter().map(|c| format!(r#""{c}""#)).collect();
                        let globs: Vec<String> = src.iter().map(|s| format!(r#""{s}""#)).collect();
                        format!(
                            r#""{name}": {{ "cmd": [{}], "src": [{}] }}"#,
                            cmds.join(", "),
                            globs.join(", ")
                        )
                    })
                    .collect();
                write(
                    &ws_root.join("targets.json"),
                    &format!(r#"{{ "targets": {{ {} }} }}"#, targets.join(", ")),
                );
            }

            for (path, contents) in &spec.files {
                write(&ws_root.join(path), contents);
            }
        }

        FixtureProject { dir, root }
    }
}

/// A scaffolded project; the directory lives as long as this value.
pub struct FixtureProject {
    dir: TempDir,
    root: PathBuf,
}

impl FixtureProject {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_root(&self, name: &str) -> PathBuf {
        self.root.join("packages").join(name)
    }

    pub fn load(&self) -> Arc<WorkspaceGraph> {
        Arc::new(WorkspaceGraph::load(&self.root).expect("load fixture project"))
    }

    /// Keep the temp directory alive explicitly (documentation of intent).
    pub fn keep(self) -> Self {
        self
    }

    pub fn write_file(&self, workspace: &str, rel: &str, contents: &str) {
        write(&self.workspace_root(workspace).join(rel), contents);
    }
}

impl std::fmt::Debug for FixtureProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureProject")
            .field("root", &self.dir.path())
            .finish()
    }
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture dirs");
    }
    std::fs::write(path, contents).expect("write fixture file");
}

/// The canonical six-workspace fixture:
///
/// ```text
/// step 0: workspace-a, workspace-c
/// step 1: workspace-b (-> a), app-a (-> a, c)
/// step 2: api (-> b, app-a)
/// step 3: app-b (-> api)
/// ```
///
/// Every workspace gets the given target with the given command.
pub fn canonical_fixture(target: &str, command: &str) -> ProjectBuilder {
    canonical_fixture_with(target, |_| command.to_string())
}

/// Canonical fixture with a per-workspace command.
pub fn canonical_fixture_with(
    target: &str,
    command_for: impl Fn(&str) -> String,
) -> ProjectBuilder {
    let mut builder = ProjectBuilder::new();
    for (name, deps) in [
        ("workspace-a", &[][..]),
        ("workspace-b", &["workspace-a"][..]),
        ("workspace-c", &[][..]),
        ("app-a", &["workspace-a", "workspace-c"][..]),
        ("app-b", &["api"][..]),
        ("api", &["workspace-b", "app-a"][..]),
    ] {
        builder = builder.workspace(
            WorkspaceSpec::new(name)
                .depends_on(deps)
                .target(target, &command_for(name)),
        );
    }
    builder
}
