// tests/watch_rescheduling.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use toporun::affected::RevisionRange;
use toporun::run::{ChangeKind, RunEvent, RunOptions, Runner};
use toporun::watch::{WatchEvent, WatchPipe};
use toporun_test_utils::{canonical_fixture_with, FakeVcs};

use crate::common::{count, init_tracing};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

fn change(workspace: &str) -> Vec<WatchEvent> {
    vec![WatchEvent {
        workspace: workspace.to_string(),
        kind: ChangeKind::Change,
        path: format!("packages/{workspace}/src/index.js").into(),
    }]
}

/// Read events until `pred` matches, failing on timeout or stream end.
async fn read_until(
    stream: &mut toporun::run::EventStream,
    seen: &mut Vec<RunEvent>,
    pred: impl Fn(&RunEvent) -> bool,
) {
    timeout(STEP_TIMEOUT, async {
        while let Some(item) = stream.next().await {
            let event = item.expect("stream must not error");
            let hit = pred(&event);
            seen.push(event);
            if hit {
                return;
            }
        }
        panic!("stream ended before the expected event");
    })
    .await
    .expect("timed out waiting for event");
}

/// Scenario: a source change lands while the workspace's task is running.
/// The task is interrupted and re-run in a reduced reschedule step.
#[tokio::test]
async fn change_during_running_step_interrupts_and_reschedules() {
    init_tracing();
    // api stays busy long enough for the change to land mid-flight.
    let fixture = canonical_fixture_with("dev", |name| {
        if name == "api" {
            "sleep 2".to_string()
        } else {
            "echo done".to_string()
        }
    })
    .build();
    let runner = Runner::new(fixture.load(), Arc::new(FakeVcs::new()));

    let (change_tx, pipe) = WatchPipe::detached();
    let mut stream = runner
        .run_command_with_watch_pipe("dev", RunOptions::default(), pipe)
        .await
        .unwrap();

    let mut events = Vec::new();
    read_until(&mut stream, &mut events, |e| {
        matches!(e, RunEvent::NodeStarted { workspace } if workspace == "api")
    })
    .await;

    change_tx.send(change("api")).await.unwrap();

    read_until(&mut stream, &mut events, |e| {
        matches!(e, RunEvent::NodeInterrupted { workspace } if workspace == "api")
    })
    .await;

    // The reschedule pass re-runs only api: a second start, then processed.
    read_until(&mut stream, &mut events, |e| {
        matches!(e, RunEvent::NodeStarted { workspace } if workspace == "api")
    })
    .await;
    read_until(&mut stream, &mut events, |e| {
        matches!(e, RunEvent::NodeProcessed { workspace, .. } if workspace == "api")
    })
    .await;

    stream.unwatch();
    let (rest, outcome) = stream.collect().await;
    outcome.unwrap();
    events.extend(rest);

    // The change was announced before api re-ran.
    let changed_at = events
        .iter()
        .position(|e| matches!(e, RunEvent::SourcesChanged { workspace, .. } if workspace == "api"))
        .expect("SourcesChanged for api");
    let restarted_at = events
        .iter()
        .rposition(|e| matches!(e, RunEvent::NodeStarted { workspace } if workspace == "api"))
        .unwrap();
    assert!(changed_at < restarted_at);

    // Exactly one interrupt, and api started exactly twice.
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeInterrupted { .. })),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeStarted { workspace } if workspace == "api")),
        2
    );
    // The killed first attempt never surfaced as processed or errored: api
    // has exactly one terminal NodeProcessed and no NodeErrored.
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeProcessed { workspace, .. } if workspace == "api")),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeErrored { workspace, .. } if workspace == "api")),
        0
    );

    // The other five ran exactly once.
    for workspace in ["workspace-a", "workspace-b", "workspace-c", "app-a", "app-b"] {
        assert_eq!(
            count(&events, |e| matches!(e, RunEvent::NodeProcessed { workspace: w, .. } if w == workspace)),
            1,
            "{workspace} must run exactly once"
        );
    }
}

/// Scenario: a change on a workspace that is not affected in this plan is
/// announced but triggers nothing.
#[tokio::test]
async fn change_on_unaffected_target_triggers_nothing() {
    init_tracing();
    let fixture = canonical_fixture_with("dev", |_| "echo done".to_string()).build();
    let graph = fixture.load();
    // Everything except api changed, so api resolves unaffected.
    let vcs = Arc::new(FakeVcs::new().with_revisions(&["main"]).with_changed_files(&[
        "packages/workspace-a/src/index.js",
        "packages/workspace-b/src/index.js",
        "packages/workspace-c/src/index.js",
        "packages/app-a/src/index.js",
        "packages/app-b/src/index.js",
    ]));
    let runner = Runner::new(graph, vcs);

    let (change_tx, pipe) = WatchPipe::detached();
    let options = RunOptions {
        affected: Some(RevisionRange::new("main", None)),
        ..Default::default()
    };
    let mut stream = runner
        .run_command_with_watch_pipe("dev", options, pipe)
        .await
        .unwrap();

    // Let the first pass finish: five processed, api skipped.
    let mut events = Vec::new();
    for _ in 0..5 {
        read_until(&mut stream, &mut events, |e| {
            matches!(e, RunEvent::NodeProcessed { .. })
        })
        .await;
    }

    change_tx.send(change("api")).await.unwrap();
    read_until(&mut stream, &mut events, |e| {
        matches!(e, RunEvent::SourcesChanged { workspace, .. } if workspace == "api")
    })
    .await;

    stream.unwatch();
    let (rest, outcome) = stream.collect().await;
    outcome.unwrap();
    events.extend(rest);

    // Announced, but never interrupted, started, or re-run.
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::SourcesChanged { workspace, .. } if workspace == "api")),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeInterrupted { .. })),
        0
    );
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeStarted { workspace } if workspace == "api")),
        0
    );
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeSkipped { workspace, .. } if workspace == "api")),
        1
    );
}

/// A change arriving between passes reschedules from the changed step with
/// a reduced first step.
#[tokio::test]
async fn idle_change_reschedules_only_the_impacted_workspace_first() {
    init_tracing();
    let fixture = canonical_fixture_with("dev", |_| "echo done".to_string()).build();
    let runner = Runner::new(fixture.load(), Arc::new(FakeVcs::new()));

    let (change_tx, pipe) = WatchPipe::detached();
    let mut stream = runner
        .run_command_with_watch_pipe("dev", RunOptions::default(), pipe)
        .await
        .unwrap();

    let mut events = Vec::new();
    for _ in 0..6 {
        read_until(&mut stream, &mut events, |e| {
            matches!(e, RunEvent::NodeProcessed { .. })
        })
        .await;
    }
    let first_pass_len = events.len();

    change_tx.send(change("workspace-b")).await.unwrap();
    read_until(&mut stream, &mut events, |e| {
        matches!(e, RunEvent::NodeProcessed { workspace, .. } if workspace == "workspace-b")
    })
    .await;

    stream.unwatch();
    let (rest, outcome) = stream.collect().await;
    outcome.unwrap();
    events.extend(rest);

    let second_pass = &events[first_pass_len..];
    // Only workspace-b re-ran; its unimpacted peers stayed authoritative.
    assert_eq!(
        count(second_pass, |e| matches!(e, RunEvent::NodeStarted { workspace } if workspace == "workspace-b")),
        1
    );
    for untouched in ["workspace-a", "workspace-c"] {
        assert_eq!(
            count(second_pass, |e| matches!(
                e,
                RunEvent::NodeStarted { workspace } if workspace == untouched
            )),
            0,
            "{untouched} must not re-run"
        );
    }
}

/// Unwatch with nothing running completes the stream cleanly.
#[tokio::test]
async fn unwatch_completes_the_stream() {
    init_tracing();
    let fixture = canonical_fixture_with("dev", |_| "echo done".to_string()).build();
    let runner = Runner::new(fixture.load(), Arc::new(FakeVcs::new()));

    let (_change_tx, pipe) = WatchPipe::detached();
    let mut stream = runner
        .run_command_with_watch_pipe("dev", RunOptions::default(), pipe)
        .await
        .unwrap();

    let mut events = Vec::new();
    for _ in 0..6 {
        read_until(&mut stream, &mut events, |e| {
            matches!(e, RunEvent::NodeProcessed { .. })
        })
        .await;
    }

    stream.unwatch();
    let (_rest, outcome) = timeout(STEP_TIMEOUT, stream.collect())
        .await
        .expect("stream must complete after unwatch");
    outcome.unwrap();
}
