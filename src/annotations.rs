//! Per-annotator annotation files.
//!
//! Every annotator owns a mirror of the source tree under
//! `<version>/annotation/<login>/`. The mirror file for
//! `source/a/part_000.jsonl` is `annotation/<login>/a/part_000.jsonl` and
//! holds one JSON line per annotated item of that chunk. Source files are
//! never opened for writing.
//!
//! Staging validates the annotation, rewrites the mirror file atomically
//! (temp file + rename) and marks it pending on the repository handle. It
//! never commits; that is the scheduler's job.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use label_ledger_core::annotation::ItemAnnotation;
use label_ledger_core::error::{LedgerError, Result};
use label_ledger_core::models::{Annotator, Item, Project};
use label_ledger_core::task;
use serde::Deserialize;

use crate::items::{for_each_record, jsonl_files};
use crate::repo_cache::RepositoryHandle;

#[derive(Deserialize)]
struct RecordId {
    id: String,
}

#[derive(Debug, Default)]
pub struct AnnotationStore;

impl AnnotationStore {
    pub fn new() -> Self {
        Self
    }

    /// The annotator's saved record for `item`, or `None` if there is none.
    pub fn load_annotation(
        &self,
        project: &Project,
        annotator: &Annotator,
        item: &Item,
    ) -> Result<Option<ItemAnnotation>> {
        let path = project.annotation_path(annotator, &item.reference);
        if !path.is_file() {
            return Ok(None);
        }
        let spec = task::spec_for(project.task_type);
        let mut found = None;
        for_each_record(&path, |lineno, text| {
            let id: RecordId = serde_json::from_str(text)
                .map_err(|e| LedgerError::parse(&path, lineno + 1, e.to_string()))?;
            if id.id == item.id() {
                let annotation = (spec.decode_annotation)(text)
                    .map_err(|e| LedgerError::parse(&path, lineno + 1, e.to_string()))?;
                found = Some(annotation);
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// A blank annotation for `item`, ready to be edited.
    pub fn empty_annotation(&self, project: &Project, item: &Item) -> ItemAnnotation {
        (task::spec_for(project.task_type).empty_annotation)(&item.record)
    }

    /// Decode a JSON payload from a client into the project's annotation type.
    pub fn annotation_from_payload(
        &self,
        project: &Project,
        item: &Item,
        payload: serde_json::Value,
    ) -> Result<ItemAnnotation> {
        (task::spec_for(project.task_type).decode_payload)(item.id(), payload)
    }

    /// Validate and write `annotation` to the annotator's mirror file, then
    /// mark the file pending on `handle`. Returns the repository-relative
    /// path that was written.
    pub async fn stage_annotation(
        &self,
        handle: &RepositoryHandle,
        project: &Project,
        annotator: &Annotator,
        item: &Item,
        annotation: &ItemAnnotation,
    ) -> Result<String> {
        if annotation.task_type() != project.task_type {
            return Err(LedgerError::InvalidAnnotation(format!(
                "{} annotation for a {} project",
                annotation.task_type(),
                project.task_type
            )));
        }
        (task::spec_for(project.task_type).validate)(project, &item.record, annotation)?;

        let path = project.annotation_path(annotator, &item.reference);
        let relative = handle.relative(&path).ok_or_else(|| {
            LedgerError::InvalidAnnotation(format!(
                "project {} does not live in {}",
                project.version,
                handle.url()
            ))
        })?;
        let record = annotation
            .to_record()
            .and_then(|value| serde_json::to_string(&value))
            .map_err(|e| LedgerError::InvalidAnnotation(e.to_string()))?;

        {
            let _guard = handle.lock_worktree().await;
            upsert_record(&path, annotation.id(), &record)?;
            handle.pending().mark(&relative, annotator);
        }

        tracing::debug!(
            annotator = annotator.login(),
            item = %item.reference,
            path = %relative,
            "staged annotation"
        );
        Ok(relative)
    }

    /// Ids of every item the annotator has a record for in this version.
    pub fn annotated_ids(&self, project: &Project, annotator: &Annotator) -> Result<BTreeSet<String>> {
        let root = project.annotation_root().join(annotator.login());
        let mut ids = BTreeSet::new();
        for rel in jsonl_files(&root)? {
            let path = root.join(&rel);
            for_each_record(&path, |lineno, text| {
                let id: RecordId = serde_json::from_str(text)
                    .map_err(|e| LedgerError::parse(&path, lineno + 1, e.to_string()))?;
                ids.insert(id.id);
                Ok(())
            })?;
        }
        Ok(ids)
    }

    /// Logins with an annotation directory in this version.
    pub fn annotators(&self, project: &Project) -> Result<Vec<Annotator>> {
        let root = project.annotation_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut annotators = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(annotator) = Annotator::new(&entry.file_name().to_string_lossy()) {
                annotators.push(annotator);
            }
        }
        annotators.sort_by(|a, b| a.login().cmp(b.login()));
        Ok(annotators)
    }
}

/// Replace the line whose `id` matches, or append, then swap the file in.
fn upsert_record(path: &Path, id: &str, record: &str) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut lines = Vec::new();
    let mut replaced = false;
    for line in existing.lines() {
        let same = serde_json::from_str::<RecordId>(line.trim())
            .map(|r| r.id == id)
            .unwrap_or(false);
        if same {
            if !replaced {
                lines.push(record);
                replaced = true;
            }
        } else if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    if !replaced {
        lines.push(record);
    }

    let dir = path
        .parent()
        .ok_or_else(|| LedgerError::NotFound(format!("parent of {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let tmp = temp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        for line in &lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo_url::RepoLocation;
    use label_ledger_core::annotation::ChatAnnotation;
    use label_ledger_core::manifest::{parse_manifest, ManifestContext};
    use label_ledger_core::models::{ChatItem, ChatMessage, ItemRecord, ItemRef};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        handle: RepositoryHandle,
        project: Project,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let handle = RepositoryHandle::new(
            RepoLocation::parse(&root.to_string_lossy()).unwrap(),
            root.clone(),
            "main".to_string(),
        );
        let ctx = ManifestContext {
            repository: handle.url().to_string(),
            version: "v1".into(),
            version_dir: root.join("v1"),
        };
        let yaml = b"name: Demo\ntask_type: chat\nlabel_groups:\n  tone:\n    single_choice: true\n    labels: [polite, rude]\nchat_options:\n  annotate_roles: [assistant]\n";
        let project = parse_manifest(&ctx, yaml).unwrap();
        Fixture {
            _dir: dir,
            handle,
            project,
        }
    }

    fn item(id: &str, line: usize) -> Item {
        Item {
            reference: ItemRef::new("chunk/part_000.jsonl", line).unwrap(),
            record: ItemRecord::Chat(ChatItem {
                id: id.to_string(),
                conversation: vec![
                    ChatMessage {
                        role: "user".into(),
                        content: "hi".into(),
                    },
                    ChatMessage {
                        role: "assistant".into(),
                        content: "hello".into(),
                    },
                ],
            }),
        }
    }

    fn labelled(id: &str, label: &str) -> ItemAnnotation {
        let mut a = ChatAnnotation::new(id);
        a.set_labels(1, "tone", vec![label.to_string()]);
        ItemAnnotation::Chat(a)
    }

    #[test]
    fn test_unsaved_item_has_no_annotation() {
        let f = fixture();
        let store = AnnotationStore::new();
        let alice = Annotator::new("alice").unwrap();
        let it = item("c1", 0);
        assert!(store.load_annotation(&f.project, &alice, &it).unwrap().is_none());
        let empty = store.empty_annotation(&f.project, &it);
        assert_eq!(empty.id(), "c1");
    }

    #[tokio::test]
    async fn test_stage_replaces_record_with_same_id() {
        let f = fixture();
        let store = AnnotationStore::new();
        let alice = Annotator::new("alice").unwrap();
        let (a, b) = (item("c1", 0), item("c2", 1));

        let rel = store
            .stage_annotation(&f.handle, &f.project, &alice, &a, &labelled("c1", "rude"))
            .await
            .unwrap();
        assert_eq!(rel, "v1/annotation/alice/chunk/part_000.jsonl");
        store
            .stage_annotation(&f.handle, &f.project, &alice, &b, &labelled("c2", "polite"))
            .await
            .unwrap();
        store
            .stage_annotation(&f.handle, &f.project, &alice, &a, &labelled("c1", "polite"))
            .await
            .unwrap();

        let path = f.project.annotation_path(&alice, &a.reference);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("hello"), "source text must not be copied");

        let loaded = store.load_annotation(&f.project, &alice, &a).unwrap().unwrap();
        assert_eq!(loaded, labelled("c1", "polite"));
        assert_eq!(f.handle.pending().len(), 1);
        assert_eq!(
            store.annotated_ids(&f.project, &alice).unwrap().into_iter().collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );
        assert_eq!(store.annotators(&f.project).unwrap(), vec![alice]);
    }

    #[tokio::test]
    async fn test_invalid_annotation_writes_nothing() {
        let f = fixture();
        let store = AnnotationStore::new();
        let alice = Annotator::new("alice").unwrap();
        let it = item("c1", 0);

        let mut bad = ChatAnnotation::new("c1");
        bad.set_labels(0, "tone", vec!["rude".into()]);
        let err = store
            .stage_annotation(&f.handle, &f.project, &alice, &it, &ItemAnnotation::Chat(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAnnotation(_)));
        assert!(!f.project.annotation_path(&alice, &it.reference).exists());
        assert!(f.handle.pending().is_empty());
    }

    #[test]
    fn test_payload_decoding() {
        let f = fixture();
        let store = AnnotationStore::new();
        let it = item("c1", 0);
        let payload = serde_json::json!({"labels": {"1": {"tone": ["rude"]}}, "comment": "terse"});
        let annotation = store.annotation_from_payload(&f.project, &it, payload).unwrap();
        assert_eq!(annotation.id(), "c1");
    }
}
