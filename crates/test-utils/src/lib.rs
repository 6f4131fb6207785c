// crates/test-utils/src/lib.rs

//! Shared helpers for toporun's integration tests: an on-disk fixture
//! project builder and an in-memory version-control probe.

pub mod fake_vcs;
pub mod project;

pub use fake_vcs::FakeVcs;
pub use project::{
    canonical_fixture, canonical_fixture_with, FixtureProject, ProjectBuilder, WorkspaceSpec,
};
