// src/project/targets.rs

//! Per-workspace target configuration (`targets.json`).
//!
//! The raw file shapes allow the shorthand forms (`cmd` as a single string,
//! `daemon` as a single condition); everything is normalised into
//! [`TargetConfig`] before the rest of the crate sees it. `extends` chains
//! are resolved relative to the referencing file; a chain that reaches the
//! same file twice is rejected.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ProjectLoadError;

pub const TARGETS_FILE: &str = "targets.json";

/// Default per-condition timeout for daemon log conditions.
pub const DEFAULT_CONDITION_TIMEOUT_MS: u64 = 120_000;

/// Which stdio stream a log condition listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioSelector {
    Stdout,
    Stderr,
    All,
}

/// How a log condition matches a line. Only substring matching is defined;
/// anything else in the file is a configuration error, not a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMatcher {
    Contains,
}

impl fmt::Display for LogMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMatcher::Contains => write!(f, "contains"),
        }
    }
}

/// Whether a matched condition marks the daemon as ready or as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Success,
    Failure,
}

/// A single readiness/failure condition for a daemon command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCondition {
    pub stdio: StdioSelector,
    pub matcher: LogMatcher,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default = "default_condition_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_condition_timeout_ms() -> u64 {
    DEFAULT_CONDITION_TIMEOUT_MS
}

impl LogCondition {
    /// Whether a line from the given stream is in scope for this condition.
    pub fn watches(&self, source: StdioSelector) -> bool {
        matches!(self.stdio, StdioSelector::All) || self.stdio == source
    }

    /// Whether this condition matches the given line.
    pub fn matches(&self, line: &str) -> bool {
        match self.matcher {
            LogMatcher::Contains => line.contains(&self.value),
        }
    }
}

/// A single shell invocation within a target, normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub run: String,
    /// Log conditions defining daemon readiness; empty for plain commands.
    pub daemon: Vec<LogCondition>,
}

impl Command {
    pub fn is_daemon(&self) -> bool {
        !self.daemon.is_empty()
    }
}

/// Normalised target configuration: the command sequence plus the source
/// globs used for fingerprinting and watching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetConfig {
    pub commands: Vec<Command>,
    pub src: Vec<String>,
}

impl TargetConfig {
    /// Canonical command string used as the `"cmd"` fingerprint entry.
    pub fn canonical_command(&self) -> String {
        self.commands
            .iter()
            .map(|c| c.run.as_str())
            .collect::<Vec<_>>()
            .join(" && ")
    }

    pub fn has_daemon(&self) -> bool {
        self.commands.iter().any(Command::is_daemon)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Detailed {
        run: String,
        #[serde(default)]
        daemon: Option<OneOrMany<LogCondition>>,
    },
}

impl RawCommand {
    fn normalise(self) -> Command {
        match self {
            RawCommand::Line(run) => Command {
                run,
                daemon: Vec::new(),
            },
            RawCommand::Detailed { run, daemon } => Command {
                run,
                daemon: daemon.map(OneOrMany::into_vec).unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawTargetConfig {
    cmd: OneOrMany<RawCommand>,
    #[serde(default)]
    src: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawTargetsFile {
    #[serde(default)]
    targets: BTreeMap<String, RawTargetConfig>,
    #[serde(default)]
    extends: Option<String>,
}

/// Load the target configuration for a workspace root.
///
/// A missing file is equivalent to an empty one. `extends` entries are
/// resolved first, so the referencing file's own targets win on name
/// collisions.
pub fn load_targets(workspace_root: &Path) -> Result<BTreeMap<String, TargetConfig>, ProjectLoadError> {
    let mut visited = HashSet::new();
    load_targets_file(&workspace_root.join(TARGETS_FILE), &mut visited)
}

fn load_targets_file(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<BTreeMap<String, TargetConfig>, ProjectLoadError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(ProjectLoadError::InvalidTargetConfig {
            path: path.to_path_buf(),
            reason: "extends chain resolves back to this file".to_string(),
        });
    }

    let contents =
        std::fs::read_to_string(path).map_err(|e| ProjectLoadError::InvalidTargetConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let raw: RawTargetsFile =
        serde_json::from_str(&contents).map_err(|e| ProjectLoadError::InvalidTargetConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut merged = match raw.extends {
        Some(ref rel) => {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            load_targets_file(&base.join(rel), visited)?
        }
        None => BTreeMap::new(),
    };

    for (name, raw_target) in raw.targets {
        let config = TargetConfig {
            commands: raw_target
                .cmd
                .into_vec()
                .into_iter()
                .map(RawCommand::normalise)
                .collect(),
            src: raw_target.src,
        };
        merged.insert(name, config);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let targets = load_targets(dir.path()).unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn normalises_shorthand_commands() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            TARGETS_FILE,
            r#"{
                "targets": {
                    "build": { "cmd": "echo build", "src": ["src/**/*.js"] },
                    "serve": {
                        "cmd": [
                            "echo pre",
                            {
                                "run": "serve .",
                                "daemon": {
                                    "stdio": "stdout",
                                    "matcher": "contains",
                                    "value": "listening",
                                    "type": "success"
                                }
                            }
                        ],
                        "src": ["**"]
                    }
                }
            }"#,
        );

        let targets = load_targets(dir.path()).unwrap();

        let build = &targets["build"];
        assert_eq!(build.commands.len(), 1);
        assert_eq!(build.commands[0].run, "echo build");
        assert!(!build.has_daemon());

        let serve = &targets["serve"];
        assert_eq!(serve.commands.len(), 2);
        assert!(serve.commands[1].is_daemon());
        assert_eq!(serve.commands[1].daemon[0].timeout_ms, DEFAULT_CONDITION_TIMEOUT_MS);
        assert_eq!(serve.canonical_command(), "echo pre && serve .");
    }

    #[test]
    fn extends_merges_with_local_override() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "base.json",
            r#"{
                "targets": {
                    "lint": { "cmd": "echo base-lint", "src": ["**"] },
                    "build": { "cmd": "echo base-build", "src": ["**"] }
                }
            }"#,
        );
        write(
            dir.path(),
            TARGETS_FILE,
            r#"{
                "extends": "base.json",
                "targets": {
                    "build": { "cmd": "echo local-build", "src": ["src/**"] }
                }
            }"#,
        );

        let targets = load_targets(dir.path()).unwrap();
        assert_eq!(targets["lint"].commands[0].run, "echo base-lint");
        assert_eq!(targets["build"].commands[0].run, "echo local-build");
    }

    #[test]
    fn self_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            TARGETS_FILE,
            &format!(r#"{{ "extends": "{TARGETS_FILE}" }}"#),
        );

        let err = load_targets(dir.path()).unwrap_err();
        assert!(matches!(err, ProjectLoadError::InvalidTargetConfig { .. }));
    }

    #[test]
    fn unknown_matcher_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            TARGETS_FILE,
            r#"{
                "targets": {
                    "serve": {
                        "cmd": {
                            "run": "serve .",
                            "daemon": {
                                "stdio": "stdout",
                                "matcher": "regex",
                                "value": "listening",
                                "type": "success"
                            }
                        },
                        "src": ["**"]
                    }
                }
            }"#,
        );

        assert!(load_targets(dir.path()).is_err());
    }
}
