// src/cache/mod.rs

//! Content-addressed per-target cache.
//!
//! A target invocation is keyed by a [`fingerprint`]: the canonical command
//! string, the source globs, and a content hash per matched file. The
//! [`store`] persists the fingerprint next to the captured command results
//! under `<workspace-root>/.caches/<target>/`.

pub mod fingerprint;
pub mod store;

pub use fingerprint::{compute_fingerprint, Fingerprint};
pub use store::CacheStore;
