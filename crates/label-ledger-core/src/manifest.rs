//! `project.yaml` parsing.
//!
//! Parsing is two-stage: the raw YAML is read into a generic value to find
//! the `task_type` tag, then the whole document is deserialized into the
//! task-specific manifest struct registered for that tag. Every manifest
//! struct uses `deny_unknown_fields`, so an authoring typo fails the whole
//! version with [`LedgerError::Schema`] instead of being ignored.
//!
//! # Example
//!
//! ```rust
//! use label_ledger_core::manifest::{parse_manifest, ManifestContext};
//!
//! let ctx = ManifestContext {
//!     repository: "https://github.com/acme/labels.git".into(),
//!     version: "v1".into(),
//!     version_dir: "/tmp/v1".into(),
//! };
//! let yaml = b"name: Demo\ntask_type: chat\nlabel_groups:\n  quality:\n    labels: [good, bad]\n";
//! let project = parse_manifest(&ctx, yaml).unwrap();
//! assert_eq!(project.name, "Demo");
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};
use crate::models::{ChatOptions, LabelGroup, Project, ProjectOptions};
use crate::task::{self, TaskType};

/// Repository-derived facts merged into every parsed [`Project`].
#[derive(Debug, Clone)]
pub struct ManifestContext {
    pub repository: String,
    pub version: String,
    pub version_dir: PathBuf,
}

/// SHA-256 hex digest of manifest bytes.
pub fn manifest_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Parse manifest bytes into the project variant selected by `task_type`.
pub fn parse_manifest(ctx: &ManifestContext, bytes: &[u8]) -> Result<Project> {
    let value: serde_yaml::Value = serde_yaml::from_slice(bytes)
        .map_err(|e| LedgerError::schema(&ctx.version, e.to_string()))?;

    let tag = match &value {
        serde_yaml::Value::Mapping(map) => match map.get("task_type") {
            Some(serde_yaml::Value::String(tag)) => tag.clone(),
            Some(_) => {
                return Err(LedgerError::schema(&ctx.version, "task_type must be a string"))
            }
            None => return Err(LedgerError::schema(&ctx.version, "missing task_type")),
        },
        _ => {
            return Err(LedgerError::schema(
                &ctx.version,
                "manifest must be a mapping",
            ))
        }
    };

    let spec = task::spec_for_tag(&tag).ok_or_else(|| {
        LedgerError::schema(
            &ctx.version,
            format!(
                "unknown task_type '{}' (known: {})",
                tag,
                task::known_tags().join(", ")
            ),
        )
    })?;

    let mut project = (spec.parse_manifest)(ctx, value)?;
    project.manifest_digest = manifest_digest(bytes);
    Ok(project)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatManifest {
    name: String,
    task_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    label_groups: BTreeMap<String, LabelGroup>,
    #[serde(default)]
    chat_options: ChatOptions,
}

pub(crate) fn parse_chat_manifest(ctx: &ManifestContext, value: serde_yaml::Value) -> Result<Project> {
    let manifest: ChatManifest = serde_yaml::from_value(value)
        .map_err(|e| LedgerError::schema(&ctx.version, e.to_string()))?;
    debug_assert_eq!(manifest.task_type, "chat");

    if manifest.name.trim().is_empty() {
        return Err(LedgerError::schema(&ctx.version, "name must not be empty"));
    }
    if manifest.label_groups.is_empty() {
        return Err(LedgerError::schema(
            &ctx.version,
            "label_groups must define at least one group",
        ));
    }
    for (slug, group) in &manifest.label_groups {
        if group.labels.is_empty() {
            return Err(LedgerError::schema(
                &ctx.version,
                format!("label group '{}' has no labels", slug),
            ));
        }
    }

    Ok(Project {
        repository: ctx.repository.clone(),
        version: ctx.version.clone(),
        name: manifest.name,
        description: manifest.description,
        instructions: manifest.instructions,
        task_type: TaskType::Chat,
        label_groups: manifest.label_groups,
        options: ProjectOptions::Chat(manifest.chat_options),
        manifest_digest: String::new(),
        version_dir: ctx.version_dir.clone(),
        generation: 0,
    })
}
