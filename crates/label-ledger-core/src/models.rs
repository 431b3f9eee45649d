//! Core data models shared by the catalog, reader, and annotation store.
//!
//! [`Project`] and [`Item`] are immutable once built. [`ItemRef`] and
//! [`Annotator`] validate their inputs on construction because both end up
//! as path segments inside a repository clone.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::task::TaskType;

/// Directory under a version holding the read-only source records.
pub const SOURCE_DIR: &str = "source";
/// Directory under a version holding per-annotator annotation subtrees.
pub const ANNOTATION_DIR: &str = "annotation";
/// Manifest file name inside every version directory.
pub const MANIFEST_FILE: &str = "project.yaml";

/// Location of one source record: a chunk file relative to `source/` and
/// the 0-based physical line inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemRef {
    path: String,
    line: usize,
}

impl ItemRef {
    /// Build a reference, rejecting absolute paths and `..` components.
    ///
    /// Backslashes are normalized to `/` so that the same reference maps to
    /// the same annotation file on every platform.
    pub fn new(path: &str, line: usize) -> Result<Self> {
        let normalized = path.replace('\\', "/");
        let trimmed = normalized.trim_start_matches("./");
        if trimmed.is_empty() {
            return Err(LedgerError::NotFound("empty item path".to_string()));
        }
        let safe = Path::new(trimmed)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(LedgerError::NotFound(format!(
                "item path '{}' escapes the source tree",
                path
            )));
        }
        Ok(Self {
            path: trimmed.to_string(),
            line,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn line(&self) -> usize {
        self.line
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

/// An annotator login, used verbatim as a directory name and commit author.
///
/// The login is trusted as already authenticated; only its shape is checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Annotator(String);

impl Annotator {
    pub fn new(login: &str) -> Result<Self> {
        let ok = !login.is_empty()
            && !login.starts_with('.')
            && login
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(Self(login.to_string()))
        } else {
            Err(LedgerError::InvalidAnnotator(login.to_string()))
        }
    }

    pub fn login(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Annotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Items
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A chat transcript record. Unknown fields in source rows are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatItem {
    pub id: String,
    pub conversation: Vec<ChatMessage>,
}

/// A decoded source record, discriminated by the project's task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ItemRecord {
    Chat(ChatItem),
}

impl ItemRecord {
    pub fn id(&self) -> &str {
        match self {
            Self::Chat(item) => &item.id,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Chat(_) => TaskType::Chat,
        }
    }
}

/// One immutable unit of source content plus where it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub reference: ItemRef,
    pub record: ItemRecord,
}

impl Item {
    pub fn id(&self) -> &str {
        self.record.id()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Projects
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelGroup {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub single_choice: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatOptions {
    /// Roles whose turns receive labels. Empty means every role.
    #[serde(default)]
    pub annotate_roles: Vec<String>,
}

impl ChatOptions {
    pub fn annotates(&self, role: &str) -> bool {
        self.annotate_roles.is_empty() || self.annotate_roles.iter().any(|r| r == role)
    }
}

/// Task-specific option block of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ProjectOptions {
    Chat(ChatOptions),
}

/// Immutable descriptor of one version of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    /// Canonical repository URL.
    pub repository: String,
    pub version: String,
    pub name: String,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub task_type: TaskType,
    pub label_groups: BTreeMap<String, LabelGroup>,
    pub options: ProjectOptions,
    /// SHA-256 of the manifest bytes this project was parsed from.
    pub manifest_digest: String,
    /// Absolute path of the version directory inside the local clone.
    pub version_dir: PathBuf,
    /// Generation of the repository clone this project was read from.
    pub generation: u64,
}

impl Project {
    pub fn source_dir(&self) -> PathBuf {
        self.version_dir.join(SOURCE_DIR)
    }

    pub fn annotation_root(&self) -> PathBuf {
        self.version_dir.join(ANNOTATION_DIR)
    }

    pub fn source_path(&self, item: &ItemRef) -> PathBuf {
        self.source_dir().join(item.path())
    }

    /// `<version>/annotation/<login>/<source-relative-path>`.
    pub fn annotation_path(&self, annotator: &Annotator, item: &ItemRef) -> PathBuf {
        self.annotation_root()
            .join(annotator.login())
            .join(item.path())
    }

    pub fn chat_options(&self) -> Option<&ChatOptions> {
        match &self.options {
            ProjectOptions::Chat(opts) => Some(opts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_ref_rejects_traversal() {
        assert!(ItemRef::new("../secrets.jsonl", 0).is_err());
        assert!(ItemRef::new("/etc/passwd", 0).is_err());
        assert!(ItemRef::new("", 0).is_err());
    }

    #[test]
    fn test_item_ref_normalizes_separators() {
        let r = ItemRef::new(".\\batch\\part_001.jsonl", 3).unwrap();
        assert_eq!(r.path(), "batch/part_001.jsonl");
        assert_eq!(r.to_string(), "batch/part_001.jsonl:3");
    }

    #[test]
    fn test_annotator_shape() {
        assert!(Annotator::new("octo-cat_2").is_ok());
        assert!(Annotator::new("a/b").is_err());
        assert!(Annotator::new("..").is_err());
        assert!(Annotator::new("").is_err());
    }

    #[test]
    fn test_annotation_path_mirrors_source() {
        let project = Project {
            repository: "https://github.com/acme/labels.git".into(),
            version: "v1".into(),
            name: "demo".into(),
            description: None,
            instructions: None,
            task_type: TaskType::Chat,
            label_groups: BTreeMap::new(),
            options: ProjectOptions::Chat(ChatOptions::default()),
            manifest_digest: String::new(),
            version_dir: PathBuf::from("/clone/v1"),
            generation: 0,
        };
        let item = ItemRef::new("batch/part_001.jsonl", 4).unwrap();
        let who = Annotator::new("alice").unwrap();
        assert_eq!(
            project.annotation_path(&who, &item),
            PathBuf::from("/clone/v1/annotation/alice/batch/part_001.jsonl")
        );
        assert_eq!(
            project.source_path(&item),
            PathBuf::from("/clone/v1/source/batch/part_001.jsonl")
        );
    }
}
