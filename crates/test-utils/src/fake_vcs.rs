// crates/test-utils/src/fake_vcs.rs

//! In-memory [`VcsProbe`] double: preset revisions, diffs, and tags.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use toporun::errors::VcsError;
use toporun::vcs::VcsProbe;

/// A probe whose answers are fixed up front.
///
/// `diff_names` filters the preset changed files by the requested path
/// prefix, the way the real tool would.
#[derive(Debug, Default)]
pub struct FakeVcs {
    revisions: Vec<String>,
    changed_files: Vec<PathBuf>,
    tags: Mutex<Vec<String>>,
    commits: Mutex<Vec<(Vec<PathBuf>, String)>>,
    pushes: Mutex<usize>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_revisions(mut self, revisions: &[&str]) -> Self {
        self.revisions = revisions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_changed_files(mut self, files: &[&str]) -> Self {
        self.changed_files = files.iter().map(PathBuf::from).collect();
        self
    }

    pub fn with_tags(self, tags: &[&str]) -> Self {
        *self.tags.lock().unwrap() = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn recorded_commits(&self) -> Vec<(Vec<PathBuf>, String)> {
        self.commits.lock().unwrap().clone()
    }

    pub fn push_count(&self) -> usize {
        *self.pushes.lock().unwrap()
    }
}

#[async_trait]
impl VcsProbe for FakeVcs {
    async fn revision_exists(&self, rev: &str) -> Result<bool, VcsError> {
        Ok(self.revisions.iter().any(|r| r == rev))
    }

    async fn diff_names(
        &self,
        _rev1: &str,
        _rev2: Option<&str>,
        path_prefix: Option<&Path>,
    ) -> Result<Vec<PathBuf>, VcsError> {
        Ok(self
            .changed_files
            .iter()
            .filter(|file| match path_prefix {
                Some(prefix) => file.starts_with(prefix),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn tag_list(&self, _fetch: bool) -> Result<Vec<String>, VcsError> {
        Ok(self.tags.lock().unwrap().clone())
    }

    async fn create_tag(&self, name: &str) -> Result<(), VcsError> {
        self.tags.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<(), VcsError> {
        self.commits
            .lock()
            .unwrap()
            .push((paths.to_vec(), message.to_string()));
        Ok(())
    }

    async fn push_including_tags(&self) -> Result<(), VcsError> {
        *self.pushes.lock().unwrap() += 1;
        Ok(())
    }
}
