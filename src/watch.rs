// src/watch.rs

//! File-system watching for watch mode.
//!
//! One recursive `notify` watcher on the project root feeds raw events into
//! the async world; a debounce task buckets them per workspace against each
//! planned target's source globs and flushes non-empty batches every
//! debounce interval.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, EventKind, RemoveKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::project::WorkspaceGraph;
use crate::run::events::ChangeKind;
use crate::run::plan::OrderedTargets;

/// Paths containing these components never produce watch events; cache
/// writes during a run must not feed back into the watcher.
const IGNORED_COMPONENTS: &[&str] = &[".caches", ".git", "node_modules"];

/// A single debounced file-system change, attributed to a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub workspace: String,
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Keeps the underlying FS watcher alive; dropping or unwatching releases
/// the watches and ends the batch stream.
pub struct WatcherHandle {
    inner: Option<RecommendedWatcher>,
    stop: Option<watch::Sender<bool>>,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish_non_exhaustive()
    }
}

impl WatcherHandle {
    /// A handle with no file-system watcher behind it, for externally fed
    /// pipes (tests, embedders).
    pub fn detached() -> Self {
        Self {
            inner: None,
            stop: None,
        }
    }

    /// Release the FS watches and terminate the event stream.
    pub fn unwatch(&mut self) {
        if self.inner.take().is_some() {
            info!("file watcher released");
        }
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

/// The watcher as the scheduler consumes it: a handle plus the batch feed.
pub struct WatchPipe {
    pub handle: WatcherHandle,
    pub batches: mpsc::Receiver<Vec<WatchEvent>>,
}

impl WatchPipe {
    /// A pipe fed by the caller instead of the file system; returns the
    /// sender used to inject batches.
    pub fn detached() -> (mpsc::Sender<Vec<WatchEvent>>, Self) {
        let (tx, rx) = mpsc::channel(64);
        (
            tx,
            Self {
                handle: WatcherHandle::detached(),
                batches: rx,
            },
        )
    }
}

/// Compiled source globs for one workspace's planned target.
struct WorkspaceWatchProfile {
    workspace: String,
    /// Workspace root relative to the project root.
    root: PathBuf,
    globs: GlobSet,
}

impl WorkspaceWatchProfile {
    /// Attribute a project-relative path to this workspace, if it matches.
    fn matches(&self, project_rel: &Path) -> bool {
        let Ok(ws_rel) = project_rel.strip_prefix(&self.root) else {
            return false;
        };
        let rel_str = ws_rel.to_string_lossy().replace('\\', "/");
        self.globs.is_match(&rel_str)
    }
}

/// Subscribe to every glob of every planned workspace's target config and
/// start the debounce loop.
pub fn spawn_watcher(
    graph: &WorkspaceGraph,
    plan: &OrderedTargets,
    target: &str,
    debounce: Duration,
) -> Result<WatchPipe> {
    let profiles = build_profiles(graph, plan, target)?;
    let root = graph.project_root().to_path_buf();

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

    // The notify callback runs on notify's own thread; it only forwards.
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(err) => {
                eprintln!("toporun: file watch error: {err}");
            }
        },
        notify::Config::default(),
    )?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", root.display()))?;

    info!(root = %root.display(), profiles = profiles.len(), "file watcher started");

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<WatchEvent>>(64);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut buffers: BTreeMap<String, Vec<WatchEvent>> = BTreeMap::new();
        let mut tick = tokio::time::interval(debounce);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = raw_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    bucket_event(&root, &profiles, &event, &mut buffers);
                }
                _ = tick.tick() => {
                    let batch: Vec<WatchEvent> = std::mem::take(&mut buffers)
                        .into_values()
                        .flatten()
                        .collect();
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(events = batch.len(), "flushing debounced watch batch");
                    if batch_tx.send(batch).await.is_err() {
                        break;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("watch debounce loop finished");
    });

    Ok(WatchPipe {
        handle: WatcherHandle {
            inner: Some(watcher),
            stop: Some(stop_tx),
        },
        batches: batch_rx,
    })
}

fn build_profiles(
    graph: &WorkspaceGraph,
    plan: &OrderedTargets,
    target: &str,
) -> Result<Vec<WorkspaceWatchProfile>> {
    let mut profiles = Vec::new();
    for rt in plan.steps.iter().flatten() {
        if !rt.has_command {
            continue;
        }
        let Some(ws) = graph.get(&rt.workspace) else {
            continue;
        };
        let Some(config) = ws.target(target) else {
            continue;
        };

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.src {
            let glob = Glob::new(pattern)
                .with_context(|| format!("invalid source glob '{pattern}' in '{}'", ws.name))?;
            builder.add(glob);
        }
        profiles.push(WorkspaceWatchProfile {
            workspace: ws.name.clone(),
            root: ws.relative_root(graph.project_root()),
            globs: builder.build()?,
        });
    }
    Ok(profiles)
}

fn bucket_event(
    root: &Path,
    profiles: &[WorkspaceWatchProfile],
    event: &Event,
    buffers: &mut BTreeMap<String, Vec<WatchEvent>>,
) {
    let Some(kind) = change_kind(&event.kind) else {
        return;
    };

    for path in &event.paths {
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        if rel
            .components()
            .any(|c| IGNORED_COMPONENTS.contains(&c.as_os_str().to_string_lossy().as_ref()))
        {
            continue;
        }

        for profile in profiles {
            if profile.matches(rel) {
                buffers
                    .entry(profile.workspace.clone())
                    .or_default()
                    .push(WatchEvent {
                        workspace: profile.workspace.clone(),
                        kind,
                        path: rel.to_path_buf(),
                    });
            }
        }
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(CreateKind::Folder) => Some(ChangeKind::AddDir),
        EventKind::Create(_) => Some(ChangeKind::Add),
        EventKind::Modify(_) => Some(ChangeKind::Change),
        EventKind::Remove(RemoveKind::Folder) => Some(ChangeKind::UnlinkDir),
        EventKind::Remove(_) => Some(ChangeKind::Unlink),
        EventKind::Access(_) => None,
        _ => {
            warn!(?kind, "unclassified fs event kind; treating as change");
            Some(ChangeKind::Change)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::ModifyKind;

    #[test]
    fn classifies_event_kinds() {
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Add)
        );
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::Folder)),
            Some(ChangeKind::AddDir)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Change)
        );
        assert_eq!(
            change_kind(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Unlink)
        );
        assert_eq!(change_kind(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }
}
