//! Commit-and-push seam between the save scheduler and git.
//!
//! [`GitSync`] is the trait the scheduler drives; [`CliGitSync`] implements
//! it with the `git` binary. Tests substitute an in-memory fake.
//!
//! Callers hold the handle's work-tree lock for the duration of every call.

use async_trait::async_trait;
use label_ledger_core::error::SyncError;
use label_ledger_core::models::Annotator;

use crate::git::GitCli;
use crate::repo_cache::RepositoryHandle;

/// Identity recorded as the author of an annotation commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    pub fn for_annotator(annotator: &Annotator, email_domain: &str) -> Self {
        Self {
            name: annotator.login().to_string(),
            email: format!("{}@{}", annotator.login(), email_domain),
        }
    }

    /// `Name <email>` as accepted by `git commit --author`.
    pub fn to_git(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

#[async_trait]
pub trait GitSync: Send + Sync {
    /// Rebase onto the remote, commit exactly `paths` (when they differ
    /// from HEAD) and push. Safe to call again after a failure: a commit
    /// that was made but not pushed is pushed, never duplicated.
    ///
    /// Returns the resulting HEAD.
    async fn commit_and_push(
        &self,
        handle: &RepositoryHandle,
        paths: &[String],
        author: &CommitAuthor,
        message: &str,
    ) -> Result<String, SyncError>;

    /// Bring the work tree up to date with the remote branch. Returns HEAD.
    async fn pull(&self, handle: &RepositoryHandle) -> Result<String, SyncError>;
}

/// [`GitSync`] over the `git` command line.
pub struct CliGitSync {
    git: GitCli,
}

impl CliGitSync {
    pub fn new(git: GitCli) -> Self {
        Self { git }
    }
}

#[async_trait]
impl GitSync for CliGitSync {
    async fn commit_and_push(
        &self,
        handle: &RepositoryHandle,
        paths: &[String],
        author: &CommitAuthor,
        message: &str,
    ) -> Result<String, SyncError> {
        let dir = handle.root();
        let branch = handle.branch();
        let paths: Vec<&str> = paths.iter().map(String::as_str).collect();

        self.git.pull_rebase(dir, branch).await?;

        if !paths.is_empty() {
            self.git.add(dir, &paths).await?;
            if self.git.has_staged_changes(dir, &paths).await? {
                match self
                    .git
                    .commit_only(dir, &paths, &author.to_git(), message)
                    .await
                {
                    Ok(()) | Err(SyncError::NothingToCommit) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if self.git.ahead_of_remote(dir, branch).await? > 0 {
            self.git.push(dir, branch).await?;
            tracing::info!(url = handle.url(), branch, author = %author.name, "pushed annotations");
        } else {
            tracing::debug!(url = handle.url(), "nothing to push");
        }

        self.git.head(dir).await
    }

    async fn pull(&self, handle: &RepositoryHandle) -> Result<String, SyncError> {
        self.git.pull_rebase(handle.root(), handle.branch()).await?;
        self.git.head(handle.root()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_author_for_annotator() {
        let author = CommitAuthor::for_annotator(
            &Annotator::new("octo-cat").unwrap(),
            "users.noreply.github.com",
        );
        assert_eq!(author.to_git(), "octo-cat <octo-cat@users.noreply.github.com>");
    }
}
