//! Per-annotator annotation records.
//!
//! On disk every record is a single JSON line of the form
//! `{"id": <item id>, ...annotation fields}`. The task type is not written
//! into the record; it is implied by the project the file belongs to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::TaskType;

/// Label assignments for one chat transcript.
///
/// `labels` maps a turn index to `{group slug: [labels]}`. Turns without
/// any selection are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAnnotation {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<usize, BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ChatAnnotation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Replace the selection of one label group on one turn.
    pub fn set_labels(&mut self, turn: usize, group: &str, labels: Vec<String>) {
        let turn_labels = self.labels.entry(turn).or_default();
        if labels.is_empty() {
            turn_labels.remove(group);
        } else {
            turn_labels.insert(group.to_string(), labels);
        }
        if turn_labels.is_empty() {
            self.labels.remove(&turn);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ItemAnnotation {
    Chat(ChatAnnotation),
}

impl ItemAnnotation {
    pub fn id(&self) -> &str {
        match self {
            Self::Chat(a) => &a.id,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Chat(_) => TaskType::Chat,
        }
    }

    /// The JSON object written as one line of an annotation file.
    pub fn to_record(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Chat(a) => serde_json::to_value(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_has_id_and_fields_only() {
        let mut ann = ChatAnnotation::new("item-7");
        ann.set_labels(1, "quality", vec!["good".into()]);
        let record = ItemAnnotation::Chat(ann).to_record().unwrap();
        assert_eq!(
            record,
            serde_json::json!({"id": "item-7", "labels": {"1": {"quality": ["good"]}}})
        );
    }

    #[test]
    fn test_clearing_last_label_drops_turn() {
        let mut ann = ChatAnnotation::new("x");
        ann.set_labels(0, "tone", vec!["calm".into()]);
        ann.set_labels(0, "tone", vec![]);
        assert!(ann.labels.is_empty());
    }
}
