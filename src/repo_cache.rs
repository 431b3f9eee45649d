//! Process-wide cache of local repository clones.
//!
//! One [`RepositoryHandle`] exists per (canonical url, branch). Handles are
//! created on first [`RepositoryCache::acquire`] and shared by every session
//! afterwards. Concurrent first acquisitions of the same url wait on a
//! single in-flight clone instead of racing.
//!
//! # Lifecycle
//!
//! ```text
//! acquire ──▶ healthy clone on disk? ──yes──▶ pull (stale-but-usable on failure)
//!                      │
//!                      no ──▶ move broken dir aside ──▶ clone
//!                                                        │
//!              recover uncommitted annotation files ◀────┘
//! ```
//!
//! The handle's work-tree lock serializes everything that mutates the
//! clone: staging writes, pulls, commits, and pushes. Reads of projects and
//! items never take it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use label_ledger_core::error::{LedgerError, Result, SyncError};
use label_ledger_core::models::{Annotator, ANNOTATION_DIR};
use parking_lot::Mutex;
use tokio::sync::{MutexGuard, OnceCell};

use crate::git::GitCli;
use crate::repo_url::RepoLocation;
use crate::sync::GitSync;

// ═══════════════════════════════════════════════════════════════════════
// Pending changes
// ═══════════════════════════════════════════════════════════════════════

/// A staged-but-uncommitted annotation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub annotator: Annotator,
    /// Bumped every time the path is staged again.
    pub stamp: u64,
}

#[derive(Debug, Default)]
struct PendingInner {
    entries: BTreeMap<String, (Annotator, u64)>,
    next_stamp: u64,
}

/// Set of annotation paths written to disk but not yet committed.
#[derive(Debug, Default)]
pub struct PendingChanges {
    inner: Mutex<PendingInner>,
}

impl PendingChanges {
    pub fn mark(&self, path: &str, annotator: &Annotator) {
        let mut inner = self.inner.lock();
        inner.next_stamp += 1;
        let stamp = inner.next_stamp;
        inner
            .entries
            .insert(path.to_string(), (annotator.clone(), stamp));
    }

    pub fn snapshot(&self) -> Vec<PendingEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(path, (annotator, stamp))| PendingEntry {
                path: path.clone(),
                annotator: annotator.clone(),
                stamp: *stamp,
            })
            .collect()
    }

    /// Remove `entries`, except paths re-staged after the snapshot was taken.
    pub fn clear(&self, entries: &[PendingEntry]) {
        let mut inner = self.inner.lock();
        for entry in entries {
            if inner.entries.get(&entry.path).map(|(_, s)| *s) == Some(entry.stamp) {
                inner.entries.remove(&entry.path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════

/// The shared local clone of one remote repository.
#[derive(Debug)]
pub struct RepositoryHandle {
    location: RepoLocation,
    root: PathBuf,
    branch: String,
    generation: AtomicU64,
    head: Mutex<Option<String>>,
    worktree: tokio::sync::Mutex<()>,
    pending: PendingChanges,
}

impl RepositoryHandle {
    /// Wrap an existing work tree. `acquire` is the normal way to get one;
    /// this is exposed for tools that manage the clone themselves.
    pub fn new(location: RepoLocation, root: PathBuf, branch: String) -> Self {
        Self {
            location,
            root,
            branch,
            generation: AtomicU64::new(0),
            head: Mutex::new(None),
            worktree: tokio::sync::Mutex::new(()),
            pending: PendingChanges::default(),
        }
    }

    pub fn location(&self) -> &RepoLocation {
        &self.location
    }

    pub fn url(&self) -> &str {
        &self.location.url
    }

    /// Top of the work tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the version directories (root + configured subdir).
    pub fn base_dir(&self) -> PathBuf {
        if self.location.subdir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.location.subdir)
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Record HEAD without advancing the generation (initial open).
    fn observe_head(&self, head: &str) {
        *self.head.lock() = Some(head.to_string());
    }

    /// Record a successful refresh. Every refresh starts a new generation,
    /// which invalidates cached projects, items, and id indexes.
    pub fn advance(&self, head: &str) -> u64 {
        self.observe_head(head);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn head(&self) -> Option<String> {
        self.head.lock().clone()
    }

    pub async fn lock_worktree(&self) -> MutexGuard<'_, ()> {
        self.worktree.lock().await
    }

    pub fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    /// `path` relative to the repository root with `/` separators.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }

    /// Seed the pending set from annotation files that exist on disk but
    /// were never committed, e.g. after a failed cycle in an earlier run.
    /// Paths that are gone from the work tree are ignored.
    pub(crate) fn recover_pending(&self, dirty: &[String]) -> usize {
        let prefix = if self.location.subdir.is_empty() {
            String::new()
        } else {
            format!("{}/", self.location.subdir.trim_matches('/'))
        };
        let mut recovered = 0;
        for path in dirty {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            // <version>/annotation/<login>/<file...>.jsonl
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() < 4 || parts[1] != ANNOTATION_DIR || !rest.ends_with(".jsonl") {
                continue;
            }
            if !self.root.join(path).is_file() {
                continue;
            }
            if let Ok(annotator) = Annotator::new(parts[2]) {
                self.pending.mark(path, &annotator);
                recovered += 1;
            }
        }
        recovered
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════

pub struct RepositoryCache {
    clone_root: PathBuf,
    git: GitCli,
    sync: Arc<dyn GitSync>,
    handles: Mutex<HashMap<String, Arc<OnceCell<Arc<RepositoryHandle>>>>>,
}

impl RepositoryCache {
    pub fn new(clone_root: PathBuf, git: GitCli, sync: Arc<dyn GitSync>) -> Self {
        Self {
            clone_root,
            git,
            sync,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Return the shared handle for `repo_url`, cloning on first use.
    pub async fn acquire(&self, repo_url: &str) -> Result<Arc<RepositoryHandle>> {
        let location = RepoLocation::parse(repo_url)?;
        let cell = {
            let mut handles = self.handles.lock();
            handles
                .entry(location.key())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let handle = cell.get_or_try_init(|| self.open(location)).await?;
        Ok(handle.clone())
    }

    /// Pull the latest remote state. On failure the handle keeps serving
    /// its last good state and the classified error is returned.
    pub async fn refresh(&self, handle: &RepositoryHandle) -> Result<u64, SyncError> {
        let _guard = handle.lock_worktree().await;
        match self.sync.pull(handle).await {
            Ok(head) => {
                let generation = handle.advance(&head);
                tracing::debug!(url = handle.url(), generation, "refreshed repository");
                Ok(generation)
            }
            Err(err) => {
                tracing::warn!(url = handle.url(), error = %err, "refresh failed; serving last good state");
                if matches!(err, SyncError::Git(_)) && !self.git.is_healthy(handle.root()).await {
                    self.evict(handle.location());
                }
                Err(err)
            }
        }
    }

    /// Forget a handle so the next `acquire` re-opens (and if needed
    /// re-clones) the repository.
    pub fn evict(&self, location: &RepoLocation) {
        self.handles.lock().remove(&location.key());
    }

    /// Drop every cached handle (process shutdown).
    pub fn release_all(&self) {
        self.handles.lock().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    async fn open(&self, location: RepoLocation) -> Result<Arc<RepositoryHandle>> {
        let dest = location.clone_dir(&self.clone_root);

        if self.git.is_healthy(&dest).await {
            tracing::info!(url = %location.url, path = %dest.display(), "reusing local clone");
        } else {
            if dest.exists() {
                let aside = reclaim_path(&dest);
                tracing::warn!(
                    path = %dest.display(),
                    moved_to = %aside.display(),
                    "local clone unusable; moving it aside and re-cloning"
                );
                tokio::fs::rename(&dest, &aside).await?;
            }
            tracing::info!(url = %location.url, path = %dest.display(), "cloning repository");
            self.git
                .clone_repo(&location.url, location.branch.as_deref(), &dest)
                .await?;
        }

        let branch = match &location.branch {
            Some(b) => b.clone(),
            None => self.git.current_branch(&dest).await?,
        };
        let handle = RepositoryHandle::new(location, dest, branch);

        {
            let _guard = handle.lock_worktree().await;
            match self.sync.pull(&handle).await {
                Ok(head) => {
                    handle.observe_head(&head);
                }
                Err(err) => {
                    tracing::warn!(url = handle.url(), error = %err, "initial pull failed; using local state");
                    if let Ok(head) = self.git.head(handle.root()).await {
                        handle.observe_head(&head);
                    }
                }
            }
        }

        let dirty = self
            .git
            .dirty_paths(handle.root(), ".")
            .await
            .map_err(LedgerError::from)?;
        let recovered = handle.recover_pending(&dirty);
        if recovered > 0 {
            tracing::info!(url = handle.url(), recovered, "recovered unsynced annotation files");
        }

        Ok(Arc::new(handle))
    }
}

fn reclaim_path(dest: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "clone".to_string());
    dest.with_file_name(format!("{}.broken-{}", name, stamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(url: &str) -> RepositoryHandle {
        RepositoryHandle::new(
            RepoLocation::parse(url).unwrap(),
            PathBuf::from("/clones/acme/labels_default"),
            "main".to_string(),
        )
    }

    #[test]
    fn test_pending_clear_keeps_restaged_paths() {
        let pending = PendingChanges::default();
        let alice = Annotator::new("alice").unwrap();
        pending.mark("v1/annotation/alice/a.jsonl", &alice);
        pending.mark("v1/annotation/alice/b.jsonl", &alice);
        let snapshot = pending.snapshot();

        pending.mark("v1/annotation/alice/b.jsonl", &alice);
        pending.clear(&snapshot);

        assert_eq!(pending.paths(), vec!["v1/annotation/alice/b.jsonl".to_string()]);
    }

    #[test]
    fn test_every_refresh_advances_generation() {
        let h = handle("https://github.com/acme/labels");
        h.observe_head("aaa");
        assert_eq!(h.generation(), 0);
        assert_eq!(h.advance("aaa"), 1);
        assert_eq!(h.advance("bbb"), 2);
        assert_eq!(h.head().as_deref(), Some("bbb"));
    }

    #[test]
    fn test_recover_pending_only_takes_annotation_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let h = RepositoryHandle::new(
            RepoLocation::parse("https://github.com/acme/labels/tree/main/sets").unwrap(),
            dir.path().to_path_buf(),
            "main".to_string(),
        );
        let dirty = vec![
            "sets/v1/annotation/alice/part_000.jsonl".to_string(),
            "sets/v1/annotation/alice/caf\u{e9}.jsonl".to_string(),
            "sets/v1/annotation/alice/deleted.jsonl".to_string(),
            "sets/v1/source/part_000.jsonl".to_string(),
            "sets/v1/annotation/alice/.part_000.jsonl.tmp".to_string(),
            "other/v1/annotation/bob/part_000.jsonl".to_string(),
            "README.md".to_string(),
        ];
        for path in &dirty {
            if path.ends_with("deleted.jsonl") {
                continue;
            }
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, "{}\n").unwrap();
        }

        assert_eq!(h.recover_pending(&dirty), 2);
        assert_eq!(
            h.pending().paths(),
            vec![
                "sets/v1/annotation/alice/caf\u{e9}.jsonl".to_string(),
                "sets/v1/annotation/alice/part_000.jsonl".to_string(),
            ]
        );
        assert!(h.pending().snapshot().iter().all(|e| e.annotator.login() == "alice"));
    }

    #[test]
    fn test_relative_paths_use_forward_slashes() {
        let h = handle("https://github.com/acme/labels");
        let p = PathBuf::from("/clones/acme/labels_default/v1/annotation/alice/a.jsonl");
        assert_eq!(h.relative(&p).unwrap(), "v1/annotation/alice/a.jsonl");
        assert!(h.relative(Path::new("/elsewhere/x")).is_none());
    }
}
