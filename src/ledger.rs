//! The process-wide entry point that wires the store together.
//!
//! A [`Ledger`] owns one repository cache, one version catalog, one item
//! reader and one save scheduler per repository. Frontends keep a single
//! `Ledger` for the life of the process and share it between sessions.
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use label_ledger::config::Config;
//! use label_ledger::ledger::Ledger;
//! use label_ledger_core::models::{Annotator, ItemRef};
//!
//! let ledger = Ledger::new(Config::default());
//! let repo = ledger.open("https://github.com/acme/labels").await?;
//! let project = ledger.project(&repo, None)?;
//! let item = ledger.item(&project, &ItemRef::new("part_000.jsonl", 0)?)?;
//! let alice = Annotator::new("alice")?;
//! let mut annotation = ledger
//!     .annotation(&project, &alice, &item)?
//!     .unwrap_or_else(|| ledger.empty_annotation(&project, &item));
//! # let _ = &mut annotation;
//! ledger.stage(&repo, &project, &alice, &item, &annotation).await?;
//! ledger.save(&repo).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use label_ledger_core::annotation::ItemAnnotation;
use label_ledger_core::error::{LedgerError, Result, SyncError};
use label_ledger_core::models::{Annotator, Item, ItemRef, Project};
use parking_lot::Mutex;

use crate::annotations::AnnotationStore;
use crate::catalog::VersionCatalog;
use crate::config::Config;
use crate::git::GitCli;
use crate::items::ItemReader;
use crate::repo_cache::{RepositoryCache, RepositoryHandle};
use crate::scheduler::{RetryPolicy, SaveOutcome, SaveScheduler, SaveStatus};
use crate::sync::{CliGitSync, GitSync};

pub struct Ledger {
    config: Config,
    sync: Arc<dyn GitSync>,
    repos: RepositoryCache,
    catalog: VersionCatalog,
    items: ItemReader,
    annotations: AnnotationStore,
    schedulers: Mutex<HashMap<String, SaveScheduler>>,
}

impl Ledger {
    pub fn new(config: Config) -> Self {
        let git = GitCli::new(&config.git);
        let sync = Arc::new(CliGitSync::new(git.clone()));
        Self::build(config, git, sync)
    }

    /// Use a custom [`GitSync`] for commits and pulls; cloning still goes
    /// through the `git` binary.
    pub fn with_sync(config: Config, sync: Arc<dyn GitSync>) -> Self {
        let git = GitCli::new(&config.git);
        Self::build(config, git, sync)
    }

    fn build(config: Config, git: GitCli, sync: Arc<dyn GitSync>) -> Self {
        let repos = RepositoryCache::new(config.store.clone_root.clone(), git, sync.clone());
        let items = ItemReader::new(config.store.item_cache_capacity);
        Self {
            config,
            sync,
            repos,
            catalog: VersionCatalog::new(),
            items,
            annotations: AnnotationStore::new(),
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repositories(&self) -> &RepositoryCache {
        &self.repos
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    // ── repositories ────────────────────────────────────────────────────

    pub async fn open(&self, repo_url: &str) -> Result<Arc<RepositoryHandle>> {
        self.repos.acquire(repo_url).await
    }

    /// Open the repository of a project configured under `[projects]`.
    pub async fn open_project(&self, slug: &str) -> Result<Arc<RepositoryHandle>> {
        let url = self.config.projects.get(slug).ok_or_else(|| {
            LedgerError::NotFound(format!(
                "project '{}' (configured: {})",
                slug,
                self.config.projects.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        self.open(url).await
    }

    pub async fn refresh(&self, handle: &RepositoryHandle) -> Result<u64, SyncError> {
        self.repos.refresh(handle).await
    }

    // ── versions and projects ───────────────────────────────────────────

    pub fn versions(&self, handle: &RepositoryHandle) -> Result<Vec<String>> {
        self.catalog.list_versions(handle)
    }

    pub fn default_version(&self, handle: &RepositoryHandle) -> Result<String> {
        self.catalog.default_version(handle)
    }

    /// The project of `version`, or of the default version when `None`.
    pub fn project(&self, handle: &RepositoryHandle, version: Option<&str>) -> Result<Arc<Project>> {
        match version {
            Some(v) => self.catalog.load_project(handle, v),
            None => {
                let v = self.catalog.default_version(handle)?;
                self.catalog.load_project(handle, &v)
            }
        }
    }

    pub fn projects(&self, handle: &RepositoryHandle) -> Result<Vec<(String, Result<Arc<Project>>)>> {
        self.catalog.list_projects(handle)
    }

    // ── items ───────────────────────────────────────────────────────────

    pub fn item(&self, project: &Project, item_ref: &ItemRef) -> Result<Item> {
        self.items.load_item(project, item_ref)
    }

    pub fn items(&self, project: &Project) -> Result<Vec<ItemRef>> {
        self.items.list_items(project)
    }

    pub fn item_entries(&self, project: &Project) -> Result<Vec<(ItemRef, String)>> {
        self.items.list_entries(project)
    }

    pub fn locate(&self, project: &Project, item_id: &str) -> Result<ItemRef> {
        self.items.locate(project, item_id)
    }

    // ── annotations ─────────────────────────────────────────────────────

    pub fn annotation(
        &self,
        project: &Project,
        annotator: &Annotator,
        item: &Item,
    ) -> Result<Option<ItemAnnotation>> {
        self.annotations.load_annotation(project, annotator, item)
    }

    pub fn empty_annotation(&self, project: &Project, item: &Item) -> ItemAnnotation {
        self.annotations.empty_annotation(project, item)
    }

    pub async fn stage(
        &self,
        handle: &RepositoryHandle,
        project: &Project,
        annotator: &Annotator,
        item: &Item,
        annotation: &ItemAnnotation,
    ) -> Result<String> {
        self.annotations
            .stage_annotation(handle, project, annotator, item, annotation)
            .await
    }

    // ── saving ──────────────────────────────────────────────────────────

    /// The save scheduler of `handle`, created on first use.
    pub fn scheduler(&self, handle: &Arc<RepositoryHandle>) -> SaveScheduler {
        let key = handle.location().key();
        let mut schedulers = self.schedulers.lock();
        if let Some(existing) = schedulers.get(&key) {
            if Arc::ptr_eq(existing.handle(), handle) {
                return existing.clone();
            }
        }
        // First use, or the handle was evicted and re-acquired.
        let scheduler = SaveScheduler::new(
            handle.clone(),
            self.sync.clone(),
            RetryPolicy::from_config(&self.config.git),
            self.config.git.author_email_domain.clone(),
        );
        schedulers.insert(key, scheduler.clone());
        scheduler
    }

    pub async fn save(&self, handle: &Arc<RepositoryHandle>) -> Result<SaveOutcome, SyncError> {
        self.scheduler(handle)
            .request_save(crate::scheduler::Trigger::Manual)
            .await
    }

    pub fn status(&self, handle: &Arc<RepositoryHandle>) -> SaveStatus {
        self.scheduler(handle).status()
    }

    /// Drop every cached repository handle and scheduler.
    pub fn shutdown(&self) {
        self.schedulers.lock().clear();
        self.repos.release_all();
    }
}
