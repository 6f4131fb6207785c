// src/cache/store.rs

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cache::fingerprint::{compute_fingerprint, Fingerprint};
use crate::errors::CacheError;
use crate::process::CommandResult;

const CHECKSUMS_FILE: &str = "checksums.json";
const OUTPUT_FILE: &str = "output.json";

/// On-disk cache for one `(workspace, target)` pair.
///
/// Lives under `<workspace-root>/.caches/<target>/` as two JSON files: the
/// stored fingerprint (`checksums.json`) and the captured command results
/// (`output.json`). The scheduler never runs two tasks for the same pair
/// concurrently, so the store does no locking of its own.
pub struct CacheStore {
    workspace_root: PathBuf,
    cmd: String,
    globs: Vec<String>,
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        target: &str,
        cmd: impl Into<String>,
        globs: Vec<String>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let dir = workspace_root.join(".caches").join(target);
        Self {
            workspace_root,
            cmd: cmd.into(),
            globs,
            dir,
        }
    }

    fn checksums_path(&self) -> PathBuf {
        self.dir.join(CHECKSUMS_FILE)
    }

    fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    /// Read the cached results, or `None` on any kind of miss: fingerprint
    /// mismatch, fingerprint errors, or missing/unparseable files.
    pub fn read(&self) -> Option<Vec<CommandResult>> {
        let current = match compute_fingerprint(&self.workspace_root, &self.cmd, &self.globs) {
            Ok(fp) => fp,
            Err(CacheError::NoInputs) => {
                warn!(dir = %self.dir.display(), "source globs matched no files; cache miss");
                return None;
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "fingerprint failed; cache miss");
                return None;
            }
        };

        let stored: Fingerprint = read_json(&self.checksums_path())?;
        if stored != current {
            debug!(dir = %self.dir.display(), "fingerprint mismatch; cache miss");
            return None;
        }

        let results: Vec<CommandResult> = read_json(&self.output_path())?;
        debug!(dir = %self.dir.display(), "cache hit");
        Some(results)
    }

    /// Persist the fingerprint and the command results.
    ///
    /// A fingerprint with no inputs invalidates instead of writing; other
    /// failures surface so the caller can decide.
    pub fn write(&self, results: &[CommandResult]) -> Result<(), CacheError> {
        let fingerprint = match compute_fingerprint(&self.workspace_root, &self.cmd, &self.globs) {
            Ok(fp) => fp,
            Err(CacheError::NoInputs) => {
                warn!(dir = %self.dir.display(), "no inputs at cache write; invalidating instead");
                return self.invalidate();
            }
            Err(e) => return Err(e),
        };

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| CacheError::WriteFailed(e.to_string()))?;

        write_json_atomic(&self.checksums_path(), &fingerprint)?;
        write_json_atomic(&self.output_path(), &results)?;
        debug!(dir = %self.dir.display(), "cache written");
        Ok(())
    }

    /// Remove both cache files. Missing files are fine; any other IO error
    /// is an [`CacheError::InvalidationFailed`], which is fatal upstream.
    pub fn invalidate(&self) -> Result<(), CacheError> {
        for path in [self.checksums_path(), self.output_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::InvalidationFailed(format!(
                        "{}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unparseable cache file; cache miss");
            None
        }
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let serialised =
        serde_json::to_string_pretty(value).map_err(|e| CacheError::WriteFailed(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serialised).map_err(|e| CacheError::WriteFailed(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| CacheError::WriteFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(command: &str) -> CommandResult {
        CommandResult {
            command: command.to_string(),
            exit_code: 0,
            stdout: "out".to_string(),
            stderr: String::new(),
            all: "out".to_string(),
            took_ms: 12,
        }
    }

    fn scaffold() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.js"), "1").unwrap();
        dir
    }

    fn store(dir: &tempfile::TempDir) -> CacheStore {
        CacheStore::new(
            dir.path(),
            "build",
            "echo build",
            vec!["src/**/*.js".to_string()],
        )
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = scaffold();
        let store = store(&dir);

        assert!(store.read().is_none());
        store.write(&[result("echo build")]).unwrap();
        let cached = store.read().unwrap();
        assert_eq!(cached, vec![result("echo build")]);
    }

    #[test]
    fn source_change_misses() {
        let dir = scaffold();
        let store = store(&dir);
        store.write(&[result("echo build")]).unwrap();

        std::fs::write(dir.path().join("src/main.js"), "2").unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn corrupt_output_misses() {
        let dir = scaffold();
        let store = store(&dir);
        store.write(&[result("echo build")]).unwrap();

        std::fs::write(store.output_path(), "not json").unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn invalidate_is_idempotent() {
        let dir = scaffold();
        let store = store(&dir);
        store.write(&[result("echo build")]).unwrap();

        store.invalidate().unwrap();
        store.invalidate().unwrap();
        assert!(store.read().is_none());
    }
}
