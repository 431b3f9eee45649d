//! # Label Ledger Core
//!
//! Shared, I/O-free logic for Label Ledger: data models, the task-type
//! registry, manifest parsing, the bounded item cache, and the error
//! taxonomy used by every layer of the store.
//!
//! This crate contains no tokio, process spawning, or filesystem access.
//! Everything that touches a repository clone lives in the `label-ledger`
//! crate.

pub mod annotation;
pub mod error;
pub mod lru;
pub mod manifest;
pub mod models;
pub mod task;
