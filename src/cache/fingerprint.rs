// src/cache/fingerprint.rs

use std::collections::BTreeMap;
use std::path::Path;

use globset::{Glob, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::CacheError;

/// A deterministic map describing one target invocation.
///
/// Keys are `"cmd"`, `"globs"`, and the workspace-relative path of every
/// matched source file (mapped to the hex SHA-256 of its contents). The
/// `BTreeMap` keeps key order stable, so serialised fingerprints compare
/// byte-for-byte.
pub type Fingerprint = BTreeMap<String, String>;

/// Compute the fingerprint for a target invocation.
///
/// Returns [`CacheError::NoInputs`] when the globs match no files at all;
/// callers treat that as a cache miss rather than an empty fingerprint.
pub fn compute_fingerprint(
    workspace_root: &Path,
    cmd: &str,
    globs: &[String],
) -> Result<Fingerprint, CacheError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in globs {
        let glob = Glob::new(pattern).map_err(|e| CacheError::BadPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| CacheError::BadPattern {
        pattern: globs.join(","),
        reason: e.to_string(),
    })?;

    let mut fingerprint = Fingerprint::new();
    let mut stack = vec![workspace_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                // The cache's own directory must never feed the fingerprint.
                if path.file_name().is_some_and(|n| n == ".caches" || n == "node_modules") {
                    continue;
                }
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(workspace_root) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if set.is_match(&rel_str) {
                    let hash = hash_file(&path)?;
                    fingerprint.insert(rel_str, hash);
                }
            }
        }
    }

    if fingerprint.is_empty() {
        return Err(CacheError::NoInputs);
    }

    fingerprint.insert("cmd".to_string(), cmd.to_string());
    fingerprint.insert("globs".to_string(), globs.join(","));

    debug!(entries = fingerprint.len(), "computed fingerprint");
    Ok(fingerprint)
}

fn hash_file(path: &Path) -> Result<String, CacheError> {
    let contents = std::fs::read(path)
        .map_err(|e| CacheError::WriteFailed(format!("reading {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}
