// tests/scheduler_events.rs

mod common;

use std::sync::Arc;

use toporun::errors::TaskError;
use toporun::run::{RunEvent, RunOptions, Runner};
use toporun_test_utils::{canonical_fixture, canonical_fixture_with, FakeVcs, ProjectBuilder, WorkspaceSpec};

use crate::common::{assert_node_order, count, init_tracing, position};

const WORKSPACES: [&str; 6] = [
    "workspace-a",
    "workspace-b",
    "workspace-c",
    "app-a",
    "app-b",
    "api",
];

fn runner(fixture: &toporun_test_utils::FixtureProject) -> Runner {
    Runner::new(fixture.load(), Arc::new(FakeVcs::new()))
}

#[tokio::test]
async fn parallel_all_affected_all_succeed() {
    init_tracing();
    let fixture = canonical_fixture("lint", "echo linted").build();
    let runner = runner(&fixture);

    let stream = runner
        .run_command("lint", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;
    outcome.unwrap();

    // TargetsResolved first, exactly once.
    assert!(matches!(events[0], RunEvent::TargetsResolved { .. }));
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::TargetsResolved { .. })),
        1
    );

    assert_eq!(count(&events, |e| matches!(e, RunEvent::NodeStarted { .. })), 6);
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeProcessed { .. })),
        6
    );
    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::CacheInvalidated { .. })),
        0
    );

    for workspace in WORKSPACES {
        assert_node_order(&events, workspace);
    }
}

#[tokio::test]
async fn parallel_single_failure_is_reported_not_fatal() {
    init_tracing();
    let fixture = canonical_fixture_with("lint", |name| {
        if name == "workspace-c" {
            "exit 1".to_string()
        } else {
            "echo linted".to_string()
        }
    })
    .build();
    let runner = runner(&fixture);

    let stream = runner
        .run_command("lint", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;

    // Parallel mode reports the failure as events; the stream completes.
    outcome.unwrap();

    assert_eq!(
        count(&events, |e| matches!(e, RunEvent::NodeProcessed { .. })),
        5
    );
    let errored: Vec<&RunEvent> = events
        .iter()
        .filter(|e| matches!(e, RunEvent::NodeErrored { .. }))
        .collect();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].workspace(), Some("workspace-c"));
    match errored[0] {
        RunEvent::NodeErrored {
            error: TaskError::Process(toporun::errors::ProcessError::Exit { code, .. }),
            ..
        } => assert_eq!(*code, 1),
        other => panic!("unexpected error event {other:?}"),
    }

    let invalidated: Vec<&RunEvent> = events
        .iter()
        .filter(|e| matches!(e, RunEvent::CacheInvalidated { .. }))
        .collect();
    assert_eq!(invalidated.len(), 1);
    assert_eq!(invalidated[0].workspace(), Some("workspace-c"));
}

#[tokio::test]
async fn workspace_without_the_command_is_skipped() {
    init_tracing();
    let fixture = ProjectBuilder::new()
        .workspace(WorkspaceSpec::new("with-cmd").target("lint", "echo ok"))
        .workspace(WorkspaceSpec::new("without-cmd"))
        .build();
    let runner = runner(&fixture);

    let stream = runner
        .run_command("lint", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;
    outcome.unwrap();

    let skipped: Vec<&RunEvent> = events
        .iter()
        .filter(|e| matches!(e, RunEvent::NodeSkipped { .. }))
        .collect();
    assert_eq!(skipped.len(), 1);
    match skipped[0] {
        RunEvent::NodeSkipped {
            workspace,
            affected,
            has_command,
        } => {
            assert_eq!(workspace, "without-cmd");
            assert!(*affected);
            assert!(!*has_command);
        }
        _ => unreachable!(),
    }

    // Skipped means skipped: no start, no processed.
    assert!(common::events_for(&events, "without-cmd")
        .iter()
        .all(|e| matches!(e, RunEvent::NodeSkipped { .. })));
}

#[tokio::test]
async fn second_run_hits_the_cache_without_spawning() {
    init_tracing();
    // The command appends to a side-channel file, so an actual re-run is
    // observable even if the cache were bypassed.
    let fixture = ProjectBuilder::new()
        .workspace(WorkspaceSpec::new("solo").target("build", "echo built >> ../../build-count"))
        .build();
    let runner = runner(&fixture);

    let first = runner
        .run_command("build", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = first.collect().await;
    outcome.unwrap();
    match &events[2] {
        RunEvent::NodeProcessed { summary, .. } => assert!(!summary.from_cache),
        other => panic!("expected NodeProcessed, got {other:?}"),
    }

    let second = runner
        .run_command("build", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = second.collect().await;
    outcome.unwrap();
    let processed = events
        .iter()
        .find_map(|e| match e {
            RunEvent::NodeProcessed { summary, .. } => Some(summary),
            _ => None,
        })
        .expect("a NodeProcessed event");
    assert!(processed.from_cache);
    // The cached results replay the first run's captured output.
    assert_eq!(processed.results.len(), 1);
    assert_eq!(processed.results[0].exit_code, 0);

    let runs = std::fs::read_to_string(fixture.root().join("build-count")).unwrap();
    assert_eq!(runs.lines().count(), 1, "cached run must not spawn");
}

#[tokio::test]
async fn force_bypasses_the_cache() {
    init_tracing();
    let fixture = ProjectBuilder::new()
        .workspace(WorkspaceSpec::new("solo").target("build", "echo built >> ../../build-count"))
        .build();
    let runner = runner(&fixture);

    for _ in 0..2 {
        let stream = runner
            .run_command(
                "build",
                RunOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (_events, outcome) = stream.collect().await;
        outcome.unwrap();
    }

    let runs = std::fs::read_to_string(fixture.root().join("build-count")).unwrap();
    assert_eq!(runs.lines().count(), 2);
}

#[tokio::test]
async fn empty_plan_resolves_then_completes() {
    init_tracing();
    let fixture = canonical_fixture("build", "true").build();
    let runner = runner(&fixture);

    let stream = runner
        .run_command(
            "build",
            RunOptions {
                workspaces: Some(vec![]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;
    outcome.unwrap();

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], RunEvent::TargetsResolved { ref targets } if targets.is_empty()));
}

#[tokio::test]
async fn unaffected_workspaces_are_skipped_not_run() {
    init_tracing();
    let fixture = canonical_fixture("lint", "echo linted").build();
    let graph = fixture.load();
    let vcs = Arc::new(
        FakeVcs::new()
            .with_revisions(&["main"])
            .with_changed_files(&["packages/api/src/index.js"]),
    );
    let runner = Runner::new(graph, vcs);

    let stream = runner
        .run_command(
            "lint",
            RunOptions {
                affected: Some(toporun::affected::RevisionRange::new("main", None)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;
    outcome.unwrap();

    assert_eq!(count(&events, |e| matches!(e, RunEvent::NodeProcessed { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, RunEvent::NodeSkipped { .. })), 5);
    assert_eq!(
        position(&events, |e| matches!(e, RunEvent::NodeProcessed { workspace, .. } if workspace == "api"))
            .is_some(),
        true
    );
}

#[tokio::test]
async fn daemon_timeout_surfaces_as_node_error() {
    init_tracing();
    let fixture = ProjectBuilder::new()
        .workspace(WorkspaceSpec::new("api").raw_targets(
            r#"{
                "targets": {
                    "start": {
                        "cmd": [{
                            "run": "sleep 5",
                            "daemon": {
                                "stdio": "stdout",
                                "matcher": "contains",
                                "value": "listening",
                                "type": "success",
                                "timeout_ms": 300
                            }
                        }],
                        "src": ["src/**"]
                    }
                }
            }"#,
        ))
        .build();
    let runner = runner(&fixture);

    let stream = runner
        .run_command("start", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;
    outcome.unwrap();

    let errored = events
        .iter()
        .find(|e| matches!(e, RunEvent::NodeErrored { .. }))
        .expect("a NodeErrored event");
    match errored {
        RunEvent::NodeErrored {
            workspace,
            error: TaskError::Daemon(toporun::errors::DaemonError::Timeout(condition)),
        } => {
            assert_eq!(workspace, "api");
            assert_eq!(condition.timeout_ms, 300);
        }
        other => panic!("expected a daemon timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn daemon_success_processes_and_registers_the_process() {
    init_tracing();
    let fixture = ProjectBuilder::new()
        .workspace(WorkspaceSpec::new("api").raw_targets(
            r#"{
                "targets": {
                    "start": {
                        "cmd": [{
                            "run": "echo listening on 4200; sleep 10",
                            "daemon": {
                                "stdio": "all",
                                "matcher": "contains",
                                "value": "listening",
                                "type": "success"
                            }
                        }],
                        "src": ["src/**"]
                    }
                }
            }"#,
        ))
        .build();
    let runner = runner(&fixture);

    let stream = runner
        .run_command("start", RunOptions::default())
        .await
        .unwrap();
    let (events, outcome) = stream.collect().await;
    outcome.unwrap();

    assert_eq!(count(&events, |e| matches!(e, RunEvent::NodeProcessed { .. })), 1);

    // The daemon is still alive under its task key; kill it to clean up.
    let key = toporun::process::TaskKey::new("api", "start");
    assert_eq!(runner.processes().in_flight(&key), 1);
    runner
        .processes()
        .kill(&key, &[], toporun::process::DEFAULT_KILL_GRACE)
        .await;
    assert_eq!(runner.processes().in_flight(&key), 0);
}
