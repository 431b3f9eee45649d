//! Version discovery and manifest parsing.
//!
//! A version is any non-hidden top-level directory of the repository (or of
//! the configured subdirectory). Versions sort lexicographically by name,
//! so `v10` sorts before `v2`; the last one is the default.
//!
//! Parsed projects are cached per (clone, version) and tagged with the
//! handle generation they were read under. When the generation advances the
//! stale entries are dropped and the manifest is re-read. The digest of the
//! first successful parse is remembered for the life of the process; a
//! re-parse that yields different bytes is rejected, since published
//! versions are immutable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use label_ledger_core::error::{LedgerError, Result};
use label_ledger_core::manifest::{parse_manifest, ManifestContext};
use label_ledger_core::models::{Project, MANIFEST_FILE};
use parking_lot::Mutex;

use crate::repo_cache::RepositoryHandle;

type VersionKey = (PathBuf, String);

#[derive(Default)]
pub struct VersionCatalog {
    projects: Mutex<HashMap<VersionKey, Arc<Project>>>,
    digests: Mutex<HashMap<VersionKey, String>>,
}

impl VersionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version directory names, sorted ascending.
    pub fn list_versions(&self, handle: &RepositoryHandle) -> Result<Vec<String>> {
        let base = handle.base_dir();
        let entries = std::fs::read_dir(&base).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LedgerError::NotFound(format!("repository directory {}", base.display()))
            } else {
                LedgerError::Io(e)
            }
        })?;

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            versions.push(name);
        }
        versions.sort();
        Ok(versions)
    }

    pub fn default_version(&self, handle: &RepositoryHandle) -> Result<String> {
        self.list_versions(handle)?
            .pop()
            .ok_or_else(|| LedgerError::NotFound(format!("no versions in {}", handle.url())))
    }

    /// Parse (or return the cached) project for `version`.
    pub fn load_project(&self, handle: &RepositoryHandle, version: &str) -> Result<Arc<Project>> {
        check_version_name(version)?;
        let generation = handle.generation();
        let version_dir = handle.base_dir().join(version);
        let key = (version_dir.clone(), version.to_string());

        {
            let mut projects = self.projects.lock();
            projects.retain(|(dir, _), p| !dir.starts_with(handle.root()) || p.generation >= generation);
            if let Some(project) = projects.get(&key) {
                return Ok(project.clone());
            }
        }

        let manifest_path = version_dir.join(MANIFEST_FILE);
        let bytes = match std::fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::NotFound(format!(
                    "version '{}' has no {}",
                    version, MANIFEST_FILE
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let ctx = ManifestContext {
            repository: handle.url().to_string(),
            version: version.to_string(),
            version_dir,
        };
        let mut project = parse_manifest(&ctx, &bytes)?;
        project.generation = generation;

        {
            let mut digests = self.digests.lock();
            match digests.get(&key) {
                Some(first) if *first != project.manifest_digest => {
                    tracing::error!(
                        version,
                        first = %first,
                        now = %project.manifest_digest,
                        "manifest of a published version changed"
                    );
                    return Err(LedgerError::schema(
                        version,
                        "manifest changed after it was first read; published versions are immutable",
                    ));
                }
                Some(_) => {}
                None => {
                    digests.insert(key.clone(), project.manifest_digest.clone());
                }
            }
        }

        let project = Arc::new(project);
        self.projects.lock().insert(key, project.clone());
        tracing::debug!(version, generation, name = %project.name, "loaded project");
        Ok(project)
    }

    /// Load every version. Each version carries its own result so a broken
    /// manifest does not hide the others.
    pub fn list_projects(
        &self,
        handle: &RepositoryHandle,
    ) -> Result<Vec<(String, Result<Arc<Project>>)>> {
        Ok(self
            .list_versions(handle)?
            .into_iter()
            .map(|version| {
                let project = self.load_project(handle, &version);
                (version, project)
            })
            .collect())
    }
}

fn check_version_name(version: &str) -> Result<()> {
    if version.is_empty()
        || version.starts_with('.')
        || version.contains('/')
        || version.contains('\\')
    {
        return Err(LedgerError::NotFound(format!("version '{}'", version)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo_url::RepoLocation;
    use tempfile::TempDir;

    const MANIFEST: &str = "name: Support chats\ntask_type: chat\nlabel_groups:\n  tone:\n    single_choice: true\n    labels: [polite, rude]\n";

    fn handle(dir: &TempDir) -> RepositoryHandle {
        let root = dir.path().to_path_buf();
        RepositoryHandle::new(
            RepoLocation::parse(&root.to_string_lossy()).unwrap(),
            root,
            "main".to_string(),
        )
    }

    fn write_version(dir: &TempDir, version: &str, manifest: &str) {
        let vdir = dir.path().join(version);
        std::fs::create_dir_all(vdir.join("source")).unwrap();
        std::fs::write(vdir.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn test_versions_sort_lexicographically() {
        let dir = TempDir::new().unwrap();
        for v in ["v2", "v10", "v1"] {
            write_version(&dir, v, MANIFEST);
        }
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();

        let h = handle(&dir);
        let catalog = VersionCatalog::new();
        assert_eq!(catalog.list_versions(&h).unwrap(), vec!["v1", "v10", "v2"]);
        assert_eq!(catalog.default_version(&h).unwrap(), "v2");
    }

    #[test]
    fn test_empty_repository_has_no_default() {
        let dir = TempDir::new().unwrap();
        let h = handle(&dir);
        let err = VersionCatalog::new().default_version(&h).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_project_is_cached_per_generation() {
        let dir = TempDir::new().unwrap();
        write_version(&dir, "v1", MANIFEST);
        let h = handle(&dir);
        let catalog = VersionCatalog::new();

        let first = catalog.load_project(&h, "v1").unwrap();
        let again = catalog.load_project(&h, "v1").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        h.advance("deadbeef");
        let reparsed = catalog.load_project(&h, "v1").unwrap();
        assert!(!Arc::ptr_eq(&first, &reparsed));
        assert_eq!(reparsed.generation, 1);
        assert_eq!(reparsed.manifest_digest, first.manifest_digest);
    }

    #[test]
    fn test_unknown_key_fails_the_version_only() {
        let dir = TempDir::new().unwrap();
        write_version(&dir, "v1", MANIFEST);
        write_version(&dir, "v2", &format!("{}colour: red\n", MANIFEST));
        let h = handle(&dir);
        let catalog = VersionCatalog::new();

        let results = catalog.list_projects(&h).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(LedgerError::Schema { .. })));
    }

    #[test]
    fn test_changed_manifest_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_version(&dir, "v1", MANIFEST);
        let h = handle(&dir);
        let catalog = VersionCatalog::new();
        catalog.load_project(&h, "v1").unwrap();

        write_version(&dir, "v1", &MANIFEST.replace("Support chats", "Renamed"));
        h.advance("cafe");
        let err = catalog.load_project(&h, "v1").unwrap_err();
        assert!(matches!(err, LedgerError::Schema { ref message, .. } if message.contains("immutable")));
    }

    #[test]
    fn test_missing_and_unsafe_versions_are_not_found() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("drafts")).unwrap();
        let h = handle(&dir);
        let catalog = VersionCatalog::new();
        assert!(catalog.load_project(&h, "drafts").unwrap_err().is_not_found());
        assert!(catalog.load_project(&h, "../etc").unwrap_err().is_not_found());
        assert!(catalog.load_project(&h, ".git").unwrap_err().is_not_found());
    }
}
