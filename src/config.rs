//! TOML configuration parsing.
//!
//! Every section except `[projects]` has defaults, so a minimal file only
//! needs to name the projects to serve:
//!
//! ```toml
//! [projects]
//! support = "https://github.com/acme/labels/tree/main/support"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub git: GitConfig,
    /// Project slug → repository URL (optionally a `/tree/<branch>/<subdir>` URL).
    #[serde(default)]
    pub projects: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_clone_root")]
    pub clone_root: PathBuf,
    #[serde(default = "default_item_cache_capacity")]
    pub item_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            clone_root: default_clone_root(),
            item_cache_capacity: default_item_cache_capacity(),
        }
    }
}

fn default_clone_root() -> PathBuf {
    PathBuf::from("./.label-cache")
}
fn default_item_cache_capacity() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AutosaveConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl AutosaveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct GitConfig {
    /// Environment variable holding an HTTPS access token. Unset or empty
    /// means anonymous access.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_committer_name")]
    pub committer_name: String,
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
    /// Annotator commits are authored as `<login>@<author_email_domain>`.
    #[serde(default = "default_author_email_domain")]
    pub author_email_domain: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            committer_name: default_committer_name(),
            committer_email: default_committer_email(),
            author_email_domain: default_author_email_domain(),
            timeout_secs: default_timeout_secs(),
            push_retries: default_push_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl GitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Resolve the access token from the configured environment variable.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

fn default_token_env() -> String {
    "LABEL_LEDGER_TOKEN".to_string()
}
fn default_committer_name() -> String {
    "label-ledger[bot]".to_string()
}
fn default_committer_email() -> String {
    "label-ledger[bot]@users.noreply.github.com".to_string()
}
fn default_author_email_domain() -> String {
    "users.noreply.github.com".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_push_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            autosave: AutosaveConfig::default(),
            git: GitConfig::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Look up a configured project's repository URL by slug.
    pub fn project_url(&self, slug: &str) -> Result<&str> {
        self.projects.get(slug).map(String::as_str).with_context(|| {
            format!(
                "Unknown project '{}'. Configured projects: {}",
                slug,
                self.projects.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.store.item_cache_capacity == 0 {
        anyhow::bail!("store.item_cache_capacity must be > 0");
    }
    if config.autosave.interval_secs == 0 {
        anyhow::bail!("autosave.interval_secs must be > 0");
    }
    if config.git.timeout_secs == 0 {
        anyhow::bail!("git.timeout_secs must be > 0");
    }
    if config.git.committer_name.trim().is_empty() || config.git.committer_email.trim().is_empty()
    {
        anyhow::bail!("git.committer_name and git.committer_email must be set");
    }
    for (slug, url) in &config.projects {
        if url.trim().is_empty() {
            anyhow::bail!("projects.{} has an empty repository url", slug);
        }
    }
    Ok(())
}
