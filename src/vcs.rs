// src/vcs.rs

//! Thin, stateless adapter over the version-control tool.
//!
//! Every operation shells out to `git` anew, so a test double can stand in
//! for the whole trait without any shared state. Only `diff_names` and
//! `revision_exists` feed the affected resolver; the write operations are
//! consumed by the publish pipeline outside this crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::VcsError;

#[async_trait]
pub trait VcsProbe: Send + Sync {
    /// Whether `rev` resolves to a commit.
    async fn revision_exists(&self, rev: &str) -> Result<bool, VcsError>;

    /// Paths (relative to the project root) changed between `rev1` and
    /// `rev2`, or between `rev1` and the working tree when `rev2` is absent.
    /// With `path_prefix` set, only changes under that prefix are listed.
    async fn diff_names(
        &self,
        rev1: &str,
        rev2: Option<&str>,
        path_prefix: Option<&Path>,
    ) -> Result<Vec<PathBuf>, VcsError>;

    /// List tag names, optionally fetching from the remote first.
    async fn tag_list(&self, fetch: bool) -> Result<Vec<String>, VcsError>;

    async fn create_tag(&self, name: &str) -> Result<(), VcsError>;

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<(), VcsError>;

    async fn push_including_tags(&self) -> Result<(), VcsError>;
}

/// Production probe: shells out to the `git` CLI in the project root.
#[derive(Debug, Clone)]
pub struct GitProbe {
    root: PathBuf,
}

impl GitProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        debug!(?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| VcsError::Spawn(e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.contains("unknown revision") || stderr.contains("bad revision") {
                // git names the offending revision in its message; callers
                // that pre-validate will usually not reach this.
                Err(VcsError::BadRevision(stderr.trim().to_string()))
            } else {
                Err(VcsError::CommandFailed(stderr.trim().to_string()))
            }
        }
    }
}

#[async_trait]
impl VcsProbe for GitProbe {
    async fn revision_exists(&self, rev: &str) -> Result<bool, VcsError> {
        let probe = format!("{rev}^{{commit}}");
        match self.git(&["rev-parse", "--verify", "--quiet", &probe]).await {
            Ok(_) => Ok(true),
            Err(VcsError::CommandFailed(_)) | Err(VcsError::BadRevision(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn diff_names(
        &self,
        rev1: &str,
        rev2: Option<&str>,
        path_prefix: Option<&Path>,
    ) -> Result<Vec<PathBuf>, VcsError> {
        let mut args = vec!["diff", "--name-only", rev1];
        if let Some(rev2) = rev2 {
            args.push(rev2);
        }
        let prefix;
        if let Some(path) = path_prefix {
            prefix = path.to_string_lossy().into_owned();
            args.push("--");
            args.push(&prefix);
        }

        let stdout = self.git(&args).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    async fn tag_list(&self, fetch: bool) -> Result<Vec<String>, VcsError> {
        if fetch {
            self.git(&["fetch", "--tags"]).await?;
        }
        let stdout = self.git(&["tag", "--list"]).await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn create_tag(&self, name: &str) -> Result<(), VcsError> {
        self.git(&["tag", name]).await?;
        Ok(())
    }

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<(), VcsError> {
        let mut add_args = vec!["add".to_string(), "--".to_string()];
        add_args.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let add_refs: Vec<&str> = add_args.iter().map(String::as_str).collect();
        self.git(&add_refs).await?;

        self.git(&["commit", "-m", message]).await?;
        Ok(())
    }

    async fn push_including_tags(&self) -> Result<(), VcsError> {
        self.git(&["push", "--follow-tags"]).await?;
        Ok(())
    }
}
