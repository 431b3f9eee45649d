//! Repository URL canonicalization and the on-disk clone layout.
//!
//! Accepted shapes:
//!
//! | Input | Canonical url | Branch | Subdir |
//! |-------|---------------|--------|--------|
//! | `https://github.com/acme/labels` | `https://github.com/acme/labels.git` | default | — |
//! | `git@github.com:acme/labels.git` | `https://github.com/acme/labels.git` | default | — |
//! | `https://github.com/acme/labels/tree/main/sets` | `https://github.com/acme/labels.git` | `main` | `sets` |
//! | `https://user:pw@git.example.com/x/y.git` | `https://git.example.com/x/y.git` | default | — |
//! | `/srv/git/labels.git`, `file:///srv/git/labels.git` | absolute path | default | — |
//!
//! Clones live under the configured clone root:
//! `<root>/<owner>/<repo>_<branch>` for GitHub and
//! `<root>/_remote/<name>-<hash>_<branch>` for everything else. Branch
//! names are sanitized into a single path segment.

use std::path::{Path, PathBuf};

use label_ledger_core::error::{LedgerError, Result};
use sha2::{Digest, Sha256};

/// A canonicalized remote plus the branch and subdirectory to serve from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoLocation {
    pub url: String,
    pub branch: Option<String>,
    pub subdir: String,
    github: Option<(String, String)>,
}

impl RepoLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(LedgerError::InvalidUrl("empty url".to_string()));
        }
        if let Some(rest) = s.strip_prefix("git@github.com:") {
            return parse_github_path(raw, rest);
        }
        if let Some(path) = s.strip_prefix("file://") {
            return Ok(local(path));
        }
        if let Some((scheme, rest)) = s.split_once("://") {
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            let host = authority
                .rsplit_once('@')
                .map(|(_, h)| h)
                .unwrap_or(authority)
                .to_ascii_lowercase();
            if host == "github.com" || host == "www.github.com" {
                return parse_github_path(raw, path);
            }
            if host.is_empty() {
                return Err(LedgerError::InvalidUrl(raw.to_string()));
            }
            let path = path.split(['?', '#']).next().unwrap_or("").trim_end_matches('/');
            return Ok(Self {
                url: format!("{}://{}/{}", scheme, host, path),
                branch: None,
                subdir: String::new(),
                github: None,
            });
        }
        if s.contains('@') && s.contains(':') {
            // scp-like ssh for a non-GitHub host: keep as-is.
            return Ok(Self {
                url: s.trim_end_matches('/').to_string(),
                branch: None,
                subdir: String::new(),
                github: None,
            });
        }
        Ok(local(s))
    }

    /// Cache key: one clone per (canonical url, branch).
    pub fn key(&self) -> String {
        match &self.branch {
            Some(b) => format!("{}#{}", self.url, b),
            None => self.url.clone(),
        }
    }

    /// Deterministic clone directory under `root`.
    pub fn clone_dir(&self, root: &Path) -> PathBuf {
        let suffix = sanitize_branch(self.branch.as_deref());
        match &self.github {
            Some((owner, repo)) => root.join(owner).join(format!("{}_{}", repo, suffix)),
            None => {
                let name = self
                    .url
                    .trim_end_matches('/')
                    .rsplit(['/', ':'])
                    .next()
                    .unwrap_or("repo")
                    .trim_end_matches(".git");
                let name = sanitize_segment(name);
                root.join("_remote")
                    .join(format!("{}-{}_{}", name, short_hash(&self.url), suffix))
            }
        }
    }

    /// Browsable link for GitHub remotes.
    pub fn web_url(&self) -> Option<String> {
        let (owner, repo) = self.github.as_ref()?;
        let reference = self.branch.as_deref().unwrap_or("HEAD");
        let subdir = self.subdir.trim_matches('/');
        let suffix = if subdir.is_empty() {
            String::new()
        } else {
            format!("/{}", subdir)
        };
        Some(format!(
            "https://github.com/{}/{}/tree/{}{}",
            owner, repo, reference, suffix
        ))
    }
}

fn local(path: &str) -> RepoLocation {
    let p = Path::new(path);
    let abs = std::fs::canonicalize(p).unwrap_or_else(|_| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(p))
                .unwrap_or_else(|_| p.to_path_buf())
        }
    });
    RepoLocation {
        url: abs.to_string_lossy().trim_end_matches('/').to_string(),
        branch: None,
        subdir: String::new(),
        github: None,
    }
}

fn parse_github_path(raw: &str, path: &str) -> Result<RepoLocation> {
    let path = path.split(['?', '#']).next().unwrap_or("").trim_matches('/');
    let (owner_repo, tree) = match path.split_once("/tree/") {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    };
    let parts: Vec<&str> = owner_repo.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return Err(LedgerError::InvalidUrl(format!(
            "expected <owner>/<repo> in '{}'",
            raw
        )));
    }
    let owner = parts[0].to_string();
    let repo = parts[1].trim_end_matches(".git").to_string();

    let (branch, subdir) = match tree {
        Some(tail) => {
            let (first, rest) = tail.split_once('/').unwrap_or((tail, ""));
            let branch = (!first.is_empty()).then(|| percent_decode(first));
            (branch, percent_decode(rest.trim_matches('/')))
        }
        None => (None, String::new()),
    };

    Ok(RepoLocation {
        url: format!("https://github.com/{}/{}.git", owner, repo),
        branch,
        subdir,
        github: Some((owner, repo)),
    })
}

/// Decode `%XX` escapes; malformed escapes are kept literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(b) = decoded {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn sanitize_branch(branch: Option<&str>) -> String {
    let Some(branch) = branch.filter(|b| !b.is_empty()) else {
        return "default".to_string();
    };
    let collapsed = branch
        .split(['/', '\\'])
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("__");
    let s = sanitize_segment(&collapsed);
    if s.is_empty() {
        "default".to_string()
    } else {
        s
    }
}

fn sanitize_segment(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with('.') {
        out = format!("_{}", out.trim_start_matches('.'));
    }
    out
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}
