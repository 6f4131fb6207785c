// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Once;

use toporun::run::RunEvent;

static TRACING: Once = Once::new();

/// Initialise test tracing once; respects `TOPORUN_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let level = std::env::var("TOPORUN_LOG")
            .ok()
            .and_then(|s| s.parse::<tracing::Level>().ok())
            .unwrap_or(tracing::Level::WARN);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_test_writer()
            .try_init();
    });
}

/// Events for one workspace, in stream order.
pub fn events_for<'a>(events: &'a [RunEvent], workspace: &str) -> Vec<&'a RunEvent> {
    events
        .iter()
        .filter(|e| e.workspace() == Some(workspace))
        .collect()
}

/// Count events matching a predicate.
pub fn count(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

/// Index of the first event matching the predicate.
pub fn position(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

/// Assert the per-workspace subsequence is a prefix of
/// `[NodeStarted, terminal]`: started before exactly one terminal event.
pub fn assert_node_order(events: &[RunEvent], workspace: &str) {
    let node_events: Vec<&RunEvent> = events
        .iter()
        .filter(|e| {
            e.workspace() == Some(workspace)
                && matches!(
                    e,
                    RunEvent::NodeStarted { .. }
                        | RunEvent::NodeProcessed { .. }
                        | RunEvent::NodeErrored { .. }
                        | RunEvent::NodeInterrupted { .. }
                )
        })
        .collect();

    if let Some(first) = node_events.first() {
        assert!(
            matches!(first, RunEvent::NodeStarted { .. }),
            "workspace '{workspace}' emitted {first:?} before NodeStarted"
        );
    }
}
