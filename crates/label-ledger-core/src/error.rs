//! Error taxonomy shared by the read and write paths.
//!
//! | Variant | Meaning | Retried? |
//! |---------|---------|----------|
//! | [`LedgerError::Schema`] | malformed manifest or unknown key | no, fatal for that version |
//! | [`LedgerError::NotFound`] | missing item, version, or file | no |
//! | [`LedgerError::Parse`] | corrupt source record | no |
//! | [`LedgerError::Sync`] | commit/pull/push failure | see [`SyncError::is_retryable`] |
//!
//! A missing *annotation* is not an error at all: the store returns
//! `Ok(None)` for it.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("schema error in version '{version}': {message}")]
    Schema { version: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error at {}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid annotation: {0}")]
    InvalidAnnotation(String),

    #[error("invalid annotator login: '{0}'")]
    InvalidAnnotator(String),

    #[error("invalid repository url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl LedgerError {
    pub fn schema(version: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            version: version.into(),
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Classified failure of a Git network or commit operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Credentials were rejected. Never retried.
    #[error("authentication rejected by remote: {0}")]
    Auth(String),

    /// Transient transport failure, including timeouts.
    #[error("network error: {0}")]
    Network(String),

    /// The remote branch advanced; a pull/rebase is required before pushing.
    #[error("push rejected, remote has new commits: {0}")]
    NonFastForward(String),

    /// No staged difference and nothing ahead of the remote.
    #[error("nothing to commit")]
    NothingToCommit,

    /// Any other git failure (rebase conflict, corrupt clone, ...).
    #[error("git error: {0}")]
    Git(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::NonFastForward(_))
    }
}
