// src/project/manifest.rs

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::ProjectLoadError;

/// Workspace manifest (`package.json`) as far as the scheduler cares.
///
/// Only the identity, the dependency tables, and (at the project root) the
/// workspace globs are read; everything else in the file is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageManifest {
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub private: bool,

    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,

    /// Workspace directory globs; only meaningful in the project root
    /// manifest.
    #[serde(default)]
    pub workspaces: Vec<String>,
}

impl PackageManifest {
    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, ProjectLoadError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ProjectLoadError::UnreadableManifest {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        serde_json::from_str(&contents).map_err(|e| ProjectLoadError::UnreadableManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Names of all declared dependencies, regular and dev combined.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let manifest: PackageManifest = serde_json::from_str(r#"{ "name": "api" }"#).unwrap();
        assert_eq!(manifest.name, "api");
        assert!(manifest.version.is_none());
        assert!(!manifest.private);
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn merges_dev_dependencies_into_names() {
        let manifest: PackageManifest = serde_json::from_str(
            r#"{
                "name": "app-a",
                "version": "1.2.3",
                "private": true,
                "dependencies": { "workspace-a": "*" },
                "devDependencies": { "workspace-c": "*" }
            }"#,
        )
        .unwrap();

        let names: Vec<&str> = manifest.dependency_names().collect();
        assert_eq!(names, vec!["workspace-a", "workspace-c"]);
        assert!(manifest.private);
    }
}
