//! Thin async wrapper around the `git` command line.
//!
//! Every invocation runs with terminal prompts disabled, the configured
//! committer identity, and a timeout. Network commands additionally carry
//! an `Authorization` header when an access token is configured; the
//! header is passed through `GIT_CONFIG_*` environment variables so the
//! token never appears in the process arguments or in `.git/config`.
//!
//! Failures are mapped onto [`SyncError`] by [`classify_failure`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::Engine;
use label_ledger_core::error::SyncError;
use tokio::process::Command;

use crate::config::GitConfig;

/// Captured result of a finished git command.
#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
    auth_header: Option<String>,
    committer_name: String,
    committer_email: String,
}

impl GitCli {
    pub fn new(config: &GitConfig) -> Self {
        let auth_header = config.token().map(|token| {
            let basic = base64::engine::general_purpose::STANDARD
                .encode(format!("x-access-token:{}", token));
            format!("Authorization: Basic {}", basic)
        });
        Self {
            timeout: config.timeout(),
            auth_header,
            committer_name: config.committer_name.clone(),
            committer_email: config.committer_email.clone(),
        }
    }

    /// Run `git <args>` in `dir`. Non-zero exit is not an error here; the
    /// caller inspects [`GitOutput::success`].
    pub async fn run(&self, dir: &Path, args: &[&str], network: bool) -> Result<GitOutput, SyncError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_COMMITTER_NAME", &self.committer_name)
            .env("GIT_COMMITTER_EMAIL", &self.committer_email)
            .env("GIT_AUTHOR_NAME", &self.committer_name)
            .env("GIT_AUTHOR_EMAIL", &self.committer_email)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if network {
            if let Some(header) = &self.auth_header {
                cmd.env("GIT_CONFIG_COUNT", "1")
                    .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                    .env("GIT_CONFIG_VALUE_0", header);
            }
        }

        let label = args.first().copied().unwrap_or("git");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SyncError::Git(format!(
                    "failed to execute 'git {}'. Is git installed? {}",
                    label, e
                )))
            }
            Err(_) => {
                return Err(SyncError::Network(format!(
                    "git {} timed out after {:?}",
                    label, self.timeout
                )))
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run and turn a non-zero exit into a classified error.
    async fn run_ok(&self, dir: &Path, args: &[&str], network: bool) -> Result<String, SyncError> {
        let out = self.run(dir, args, network).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            let label = args.first().copied().unwrap_or("git");
            Err(classify_failure(label, &out.stderr, &out.stdout))
        }
    }

    pub async fn clone_repo(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<(), SyncError> {
        let parent = dest.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| SyncError::Git(format!("cannot create {}: {}", parent.display(), e)))?;

        let dest_str = dest.to_string_lossy().to_string();
        let mut args = vec!["clone"];
        if let Some(b) = branch {
            args.extend(["--branch", b, "--single-branch"]);
        }
        args.push(url);
        args.push(&dest_str);
        self.run_ok(&parent, &args, true).await.map(|_| ())
    }

    /// `true` when `dir` is the top of a usable work tree.
    pub async fn is_healthy(&self, dir: &Path) -> bool {
        if !dir.join(".git").exists() {
            return false;
        }
        match self.run(dir, &["rev-parse", "--is-inside-work-tree"], false).await {
            Ok(out) => out.success && out.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String, SyncError> {
        let out = self.run_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"], false).await?;
        let branch = out.trim().to_string();
        if branch == "HEAD" {
            return Err(SyncError::Git("detached HEAD; nothing to push".to_string()));
        }
        Ok(branch)
    }

    /// Fetch and rebase local commits onto `origin/<branch>`, stashing any
    /// uncommitted work-tree changes around the rebase.
    pub async fn pull_rebase(&self, dir: &Path, branch: &str) -> Result<(), SyncError> {
        let out = self
            .run(dir, &["pull", "--rebase", "--autostash", "origin", branch], true)
            .await?;
        if out.success {
            return Ok(());
        }
        let err = classify_failure("pull", &out.stderr, &out.stdout);
        if matches!(err, SyncError::Git(_)) {
            // A half-applied rebase would block every later cycle.
            let _ = self.run(dir, &["rebase", "--abort"], false).await;
        }
        Err(err)
    }

    pub async fn add(&self, dir: &Path, paths: &[&str]) -> Result<(), SyncError> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run_ok(dir, &args, false).await.map(|_| ())
    }

    /// Whether the index differs from HEAD for any of `paths`.
    pub async fn has_staged_changes(&self, dir: &Path, paths: &[&str]) -> Result<bool, SyncError> {
        let mut args = vec!["diff", "--cached", "--quiet", "--"];
        args.extend_from_slice(paths);
        let out = self.run(dir, &args, false).await?;
        match out.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(classify_failure("diff", &out.stderr, &out.stdout)),
        }
    }

    /// Commit exactly `paths`, leaving any other index content alone.
    pub async fn commit_only(
        &self,
        dir: &Path,
        paths: &[&str],
        author: &str,
        message: &str,
    ) -> Result<(), SyncError> {
        let mut args = vec!["commit", "--only", "--no-verify", "-m", message, "--author", author, "--"];
        args.extend_from_slice(paths);
        self.run_ok(dir, &args, false).await.map(|_| ())
    }

    pub async fn head(&self, dir: &Path) -> Result<String, SyncError> {
        Ok(self.run_ok(dir, &["rev-parse", "HEAD"], false).await?.trim().to_string())
    }

    /// Number of local commits not yet on `origin/<branch>`.
    pub async fn ahead_of_remote(&self, dir: &Path, branch: &str) -> Result<u64, SyncError> {
        let range = format!("origin/{}..HEAD", branch);
        let out = self.run(dir, &["rev-list", "--count", &range], false).await?;
        if !out.success {
            // No remote-tracking ref yet: everything is unpublished.
            let all = self.run_ok(dir, &["rev-list", "--count", "HEAD"], false).await?;
            return Ok(all.trim().parse().unwrap_or(0));
        }
        Ok(out.stdout.trim().parse().unwrap_or(0))
    }

    pub async fn push(&self, dir: &Path, branch: &str) -> Result<(), SyncError> {
        let refspec = format!("HEAD:refs/heads/{}", branch);
        self.run_ok(dir, &["push", "origin", &refspec], true).await.map(|_| ())
    }

    /// Paths (relative to the repository root) with uncommitted changes
    /// below `pathspec`, including untracked files.
    pub async fn dirty_paths(&self, dir: &Path, pathspec: &str) -> Result<Vec<String>, SyncError> {
        let out = self
            .run_ok(
                dir,
                &["status", "--porcelain", "-z", "--untracked-files=all", "--", pathspec],
                false,
            )
            .await?;
        Ok(parse_status_z(&out))
    }
}

/// Parse `git status --porcelain -z`. Paths are verbatim (no C-quoting);
/// rename and copy entries are followed by an extra field holding the
/// source path, which is skipped.
fn parse_status_z(out: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut fields = out.split('\0');
    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            continue;
        }
        let (status, path) = entry.split_at(3);
        paths.push(path.to_string());
        if status.starts_with('R') || status.starts_with('C') {
            fields.next();
        }
    }
    paths
}

/// Map git's stderr onto the sync error taxonomy.
pub fn classify_failure(command: &str, stderr: &str, stdout: &str) -> SyncError {
    let text = format!("{}\n{}", stderr, stdout);
    let lower = text.to_lowercase();
    let detail = {
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            format!("git {} failed: {}", command, stdout.trim())
        } else {
            format!("git {} failed: {}", command, trimmed)
        }
    };

    const NOTHING: &[&str] = &["nothing to commit", "no changes added to commit"];
    const AUTH: &[&str] = &[
        "authentication failed",
        "could not read username",
        "could not read password",
        "terminal prompts disabled",
        "permission denied",
        "invalid username or password",
        "the requested url returned error: 401",
        "the requested url returned error: 403",
        "access denied",
        "write access to repository not granted",
    ];
    const REJECTED: &[&str] = &[
        "non-fast-forward",
        "fetch first",
        "updates were rejected",
        "[rejected]",
        "cannot lock ref",
    ];
    const NETWORK: &[&str] = &[
        "could not resolve host",
        "unable to access",
        "connection timed out",
        "connection refused",
        "failed to connect",
        "network is unreachable",
        "operation timed out",
        "early eof",
        "rpc failed",
        "the remote end hung up unexpectedly",
        "could not read from remote repository",
    ];

    if NOTHING.iter().any(|p| lower.contains(p)) {
        SyncError::NothingToCommit
    } else if AUTH.iter().any(|p| lower.contains(p)) {
        SyncError::Auth(detail)
    } else if REJECTED.iter().any(|p| lower.contains(p)) {
        SyncError::NonFastForward(detail)
    } else if NETWORK.iter().any(|p| lower.contains(p)) {
        SyncError::Network(detail)
    } else {
        SyncError::Git(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rejected_push() {
        let stderr = "To github.com:acme/labels.git\n ! [rejected]        main -> main (fetch first)\nerror: failed to push some refs";
        assert!(matches!(
            classify_failure("push", stderr, ""),
            SyncError::NonFastForward(_)
        ));
    }

    #[test]
    fn test_classify_auth_before_network() {
        let stderr = "fatal: unable to access 'https://github.com/acme/labels.git/': The requested URL returned error: 403";
        assert!(matches!(classify_failure("push", stderr, ""), SyncError::Auth(_)));
        let stderr = "fatal: could not read Username for 'https://github.com': terminal prompts disabled";
        assert!(matches!(classify_failure("pull", stderr, ""), SyncError::Auth(_)));
    }

    #[test]
    fn test_classify_network() {
        let stderr = "fatal: unable to access 'https://github.com/x/y.git/': Could not resolve host: github.com";
        assert!(matches!(classify_failure("pull", stderr, ""), SyncError::Network(_)));
    }

    #[test]
    fn test_classify_nothing_to_commit_from_stdout() {
        let out = "On branch main\nnothing to commit, working tree clean";
        assert_eq!(classify_failure("commit", "", out), SyncError::NothingToCommit);
    }

    #[test]
    fn test_classify_other() {
        let err = classify_failure("rebase", "CONFLICT (content): Merge conflict in a.jsonl", "");
        assert!(matches!(err, SyncError::Git(ref msg) if msg.contains("CONFLICT")));
    }

    #[test]
    fn test_auth_header_from_token_env() {
        let mut config = GitConfig::default();
        config.token_env = "LABEL_LEDGER_TEST_TOKEN_UNSET_XYZ".to_string();
        let cli = GitCli::new(&config);
        assert!(cli.auth_header.is_none());
    }

    #[test]
    fn test_status_z_keeps_paths_verbatim() {
        let out = "?? v1/annotation/alice/caf\u{e9}.jsonl\0 M v1/annotation/bob/with space.jsonl\0R  v1/annotation/bob/new.jsonl\0v1/annotation/bob/old.jsonl\0";
        assert_eq!(
            parse_status_z(out),
            vec![
                "v1/annotation/alice/caf\u{e9}.jsonl".to_string(),
                "v1/annotation/bob/with space.jsonl".to_string(),
                "v1/annotation/bob/new.jsonl".to_string(),
            ]
        );
        assert!(parse_status_z("").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_maps_to_network_error() {
        let mut cli = GitCli::new(&GitConfig::default());
        cli.timeout = Duration::from_millis(200);
        let dir = std::env::temp_dir();
        let err = cli
            .run(&dir, &["-c", "alias.stall=!sleep 5", "stall"], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network(ref msg) if msg.contains("timed out")));
        assert!(err.is_retryable());
    }
}
