//! # Label Ledger
//!
//! A Git-backed, versioned annotation store for multi-annotator labeling
//! projects.
//!
//! Projects live in ordinary Git repositories. Every top-level directory is
//! an immutable *version* holding a manifest, chunked JSONL source items,
//! and one annotation subtree per annotator:
//!
//! ```text
//! <repo>/<version>/project.yaml
//! <repo>/<version>/source/**/*.jsonl
//! <repo>/<version>/annotation/<login>/**/*.jsonl
//! ```
//!
//! Annotators never share a file, so their commits never conflict.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   ┌────────────────┐   ┌────────────────┐
//! │ VersionCatalog │──▶│RepositoryCache │◀──│ SaveScheduler  │
//! └───────┬────────┘   └───────┬────────┘   └───────┬────────┘
//!         │                    │                    │
//!         ▼                    ▼                    ▼
//! ┌────────────────┐   ┌────────────────┐   ┌────────────────┐
//! │   ItemReader   │   │AnnotationStore │   │    GitSync     │
//! └────────────────┘   └────────────────┘   └────────────────┘
//! ```
//!
//! [`ledger::Ledger`] wires these together; most callers only need it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`repo_url`] | Repository URL canonicalization and clone layout |
//! | [`git`] | Async `git` command runner and failure classification |
//! | [`sync`] | [`sync::GitSync`] trait and its CLI implementation |
//! | [`repo_cache`] | Shared local clones and pending-change tracking |
//! | [`catalog`] | Version discovery and manifest parsing |
//! | [`items`] | Streaming item reads with an LRU cache |
//! | [`annotations`] | Per-annotator annotation files |
//! | [`scheduler`] | Manual save, autosave, and the commit cycle |
//! | [`ledger`] | Facade over all of the above |
//! | [`stats`] | Annotation progress |
//!
//! Data types (`Project`, `Item`, `ItemAnnotation`, errors) live in the
//! `label-ledger-core` crate.

pub mod annotations;
pub mod catalog;
pub mod config;
pub mod git;
pub mod items;
pub mod ledger;
pub mod repo_cache;
pub mod repo_url;
pub mod scheduler;
pub mod stats;
pub mod sync;
