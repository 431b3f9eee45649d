//! Task-type registry.
//!
//! Every task type is a variant of the closed [`TaskType`] enum plus one
//! [`TaskSpec`] entry in [`TASK_REGISTRY`]. The entry bundles everything the
//! store needs to know about the type: how to parse its manifest, decode its
//! source rows and annotation records, validate an annotation, and which
//! renderer a frontend should use.
//!
//! Adding a task type means adding a variant and a registry entry; no
//! dispatch code elsewhere changes.
//!
//! | Tag | Items | Annotation | Renderer |
//! |-----|-------|------------|----------|
//! | `chat` | [`ChatItem`] | [`ChatAnnotation`] | [`Renderer::ChatTranscript`] |

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::annotation::{ChatAnnotation, ItemAnnotation};
use crate::error::{LedgerError, Result};
use crate::manifest::{self, ManifestContext};
use crate::models::{ChatItem, ItemRecord, Project};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Chat,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        spec_for(self).tag
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        spec_for_tag(tag).map(|spec| spec.task_type)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which frontend widget set can display a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Renderer {
    ChatTranscript,
}

/// Registry entry describing one task type.
pub struct TaskSpec {
    pub task_type: TaskType,
    /// Value of `task_type` in `project.yaml`.
    pub tag: &'static str,
    pub renderer: Renderer,
    pub parse_manifest: fn(&ManifestContext, serde_yaml::Value) -> Result<Project>,
    pub decode_item: fn(&str) -> serde_json::Result<ItemRecord>,
    pub decode_annotation: fn(&str) -> serde_json::Result<ItemAnnotation>,
    /// Build an annotation from a frontend payload for the given item id.
    pub decode_payload: fn(&str, serde_json::Value) -> Result<ItemAnnotation>,
    pub empty_annotation: fn(&ItemRecord) -> ItemAnnotation,
    pub validate: fn(&Project, &ItemRecord, &ItemAnnotation) -> Result<()>,
}

pub static TASK_REGISTRY: &[TaskSpec] = &[TaskSpec {
    task_type: TaskType::Chat,
    tag: "chat",
    renderer: Renderer::ChatTranscript,
    parse_manifest: manifest::parse_chat_manifest,
    decode_item: decode_chat_item,
    decode_annotation: decode_chat_annotation,
    decode_payload: decode_chat_payload,
    empty_annotation: empty_chat_annotation,
    validate: validate_chat,
}];

pub fn spec_for(task_type: TaskType) -> &'static TaskSpec {
    TASK_REGISTRY
        .iter()
        .find(|spec| spec.task_type == task_type)
        .unwrap_or_else(|| unreachable!("task type {:?} missing from registry", task_type))
}

pub fn spec_for_tag(tag: &str) -> Option<&'static TaskSpec> {
    TASK_REGISTRY.iter().find(|spec| spec.tag == tag)
}

pub fn known_tags() -> Vec<&'static str> {
    TASK_REGISTRY.iter().map(|spec| spec.tag).collect()
}

// ─── chat ───────────────────────────────────────────────────────────

fn decode_chat_item(line: &str) -> serde_json::Result<ItemRecord> {
    serde_json::from_str::<ChatItem>(line).map(ItemRecord::Chat)
}

fn decode_chat_annotation(line: &str) -> serde_json::Result<ItemAnnotation> {
    serde_json::from_str::<ChatAnnotation>(line).map(ItemAnnotation::Chat)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    labels: std::collections::BTreeMap<usize, std::collections::BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    comment: Option<String>,
}

fn decode_chat_payload(item_id: &str, payload: serde_json::Value) -> Result<ItemAnnotation> {
    let payload: ChatPayload = serde_json::from_value(payload)
        .map_err(|e| LedgerError::InvalidAnnotation(e.to_string()))?;
    if let Some(id) = &payload.id {
        if id != item_id {
            return Err(LedgerError::InvalidAnnotation(format!(
                "payload id '{}' does not match item '{}'",
                id, item_id
            )));
        }
    }
    Ok(ItemAnnotation::Chat(ChatAnnotation {
        id: item_id.to_string(),
        labels: payload.labels,
        comment: payload.comment,
    }))
}

fn empty_chat_annotation(item: &ItemRecord) -> ItemAnnotation {
    ItemAnnotation::Chat(ChatAnnotation::new(item.id()))
}

fn validate_chat(project: &Project, item: &ItemRecord, annotation: &ItemAnnotation) -> Result<()> {
    let (ItemRecord::Chat(item), ItemAnnotation::Chat(annotation)) = (item, annotation);
    if annotation.id != item.id {
        return Err(LedgerError::InvalidAnnotation(format!(
            "annotation id '{}' does not match item '{}'",
            annotation.id, item.id
        )));
    }
    let options = project.chat_options().cloned().unwrap_or_default();

    for (turn, groups) in &annotation.labels {
        let message = item.conversation.get(*turn).ok_or_else(|| {
            LedgerError::InvalidAnnotation(format!(
                "turn {} out of range ({} turns)",
                turn,
                item.conversation.len()
            ))
        })?;
        if !options.annotates(&message.role) {
            return Err(LedgerError::InvalidAnnotation(format!(
                "turn {} has role '{}' which is not annotated",
                turn, message.role
            )));
        }
        for (slug, labels) in groups {
            let group = project.label_groups.get(slug).ok_or_else(|| {
                LedgerError::InvalidAnnotation(format!("unknown label group '{}'", slug))
            })?;
            if group.single_choice && labels.len() > 1 {
                return Err(LedgerError::InvalidAnnotation(format!(
                    "label group '{}' is single choice",
                    slug
                )));
            }
            let mut seen = BTreeSet::new();
            for label in labels {
                if !group.labels.contains(label) {
                    return Err(LedgerError::InvalidAnnotation(format!(
                        "label '{}' is not part of group '{}'",
                        label, slug
                    )));
                }
                if !seen.insert(label) {
                    return Err(LedgerError::InvalidAnnotation(format!(
                        "label '{}' repeated in group '{}'",
                        label, slug
                    )));
                }
            }
        }
    }
    Ok(())
}
