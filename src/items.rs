//! Item loading from chunked JSONL source files.
//!
//! Source rows live in `<version>/source/**/*.jsonl`, one JSON record per
//! physical line. Blank lines and lines starting with `#` or `//` are not
//! records but still count toward line numbers, so an [`ItemRef`] always
//! names the physical 0-based line.
//!
//! Files are streamed line by line; nothing reads a whole chunk into
//! memory. Decoded items are kept in a bounded LRU keyed by
//! (version, generation, reference) and the per-version id index is built
//! lazily on the first [`ItemReader::locate`]. Both are dropped when the
//! clone's generation advances. Annotation writes never touch them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use label_ledger_core::error::{LedgerError, Result};
use label_ledger_core::lru::LruCache;
use label_ledger_core::models::{Item, ItemRef, Project};
use label_ledger_core::task;
use parking_lot::Mutex;
use walkdir::WalkDir;

type ItemKey = (PathBuf, u64, ItemRef);
type IndexKey = (PathBuf, u64);

struct ReaderState {
    items: LruCache<ItemKey, Item>,
    indexes: HashMap<IndexKey, Arc<HashMap<String, ItemRef>>>,
    latest: HashMap<PathBuf, u64>,
}

impl ReaderState {
    /// Forget everything cached for `dir` under older generations.
    fn observe(&mut self, dir: &Path, generation: u64) {
        let latest = self.latest.entry(dir.to_path_buf()).or_insert(generation);
        if generation > *latest {
            *latest = generation;
            self.items
                .retain(|(d, g, _)| d.as_path() != dir || *g >= generation);
            self.indexes
                .retain(|(d, g), _| d.as_path() != dir || *g >= generation);
        }
    }
}

pub struct ItemReader {
    state: Mutex<ReaderState>,
}

impl ItemReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ReaderState {
                items: LruCache::new(capacity),
                indexes: HashMap::new(),
                latest: HashMap::new(),
            }),
        }
    }

    pub fn cached_items(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Resolve `item_ref` to its decoded record.
    pub fn load_item(&self, project: &Project, item_ref: &ItemRef) -> Result<Item> {
        let key = (project.version_dir.clone(), project.generation, item_ref.clone());
        {
            let mut state = self.state.lock();
            state.observe(&project.version_dir, project.generation);
            if let Some(item) = state.items.get(&key) {
                return Ok(item.clone());
            }
        }

        let path = project.source_path(item_ref);
        let file = open_source(&path, item_ref)?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut lineno = 0usize;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Err(LedgerError::NotFound(format!(
                    "item {} (file has {} lines)",
                    item_ref, lineno
                )));
            }
            if lineno == item_ref.line() {
                break;
            }
            lineno += 1;
        }

        let line = record_text(&buf).ok_or_else(|| {
            LedgerError::NotFound(format!("item {} (line is not a record)", item_ref))
        })?;
        let line = line.map_err(|e| LedgerError::parse(&path, lineno + 1, e.to_string()))?;
        let record = (task::spec_for(project.task_type).decode_item)(line)
            .map_err(|e| LedgerError::parse(&path, lineno + 1, e.to_string()))?;
        let item = Item {
            reference: item_ref.clone(),
            record,
        };

        let mut state = self.state.lock();
        state.items.insert(key, item.clone());
        Ok(item)
    }

    /// References of every record line, files sorted by path.
    pub fn list_items(&self, project: &Project) -> Result<Vec<ItemRef>> {
        let mut refs = Vec::new();
        for rel in jsonl_files(&project.source_dir())? {
            let path = project.source_dir().join(&rel);
            for_each_record(&path, |lineno, _| {
                refs.push(ItemRef::new(&rel, lineno)?);
                Ok(())
            })?;
        }
        Ok(refs)
    }

    /// Every record's reference and id, in file and line order.
    pub fn list_entries(&self, project: &Project) -> Result<Vec<(ItemRef, String)>> {
        let spec = task::spec_for(project.task_type);
        let mut entries = Vec::new();
        for rel in jsonl_files(&project.source_dir())? {
            let path = project.source_dir().join(&rel);
            for_each_record(&path, |lineno, text| {
                let record = (spec.decode_item)(text)
                    .map_err(|e| LedgerError::parse(&path, lineno + 1, e.to_string()))?;
                entries.push((ItemRef::new(&rel, lineno)?, record.id().to_string()));
                Ok(())
            })?;
        }
        Ok(entries)
    }

    /// Find the reference of the item with `item_id`.
    pub fn locate(&self, project: &Project, item_id: &str) -> Result<ItemRef> {
        let index = self.index(project)?;
        index
            .get(item_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("item id '{}' in {}", item_id, project.version)))
    }

    fn index(&self, project: &Project) -> Result<Arc<HashMap<String, ItemRef>>> {
        let key = (project.version_dir.clone(), project.generation);
        {
            let mut state = self.state.lock();
            state.observe(&project.version_dir, project.generation);
            if let Some(index) = state.indexes.get(&key) {
                return Ok(index.clone());
            }
        }

        let mut index = HashMap::new();
        for (item_ref, id) in self.list_entries(project)? {
            if let Some(first) = index.get(&id) {
                return Err(LedgerError::parse(
                    project.source_path(&item_ref),
                    item_ref.line() + 1,
                    format!("duplicate item id '{}' (first seen at {})", id, first),
                ));
            }
            index.insert(id, item_ref);
        }
        tracing::debug!(version = %project.version, items = index.len(), "built item id index");

        let index = Arc::new(index);
        self.state
            .lock()
            .indexes
            .insert(key, index.clone());
        Ok(index)
    }
}

fn open_source(path: &Path, item_ref: &ItemRef) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LedgerError::NotFound(format!("item {} (no such source file)", item_ref))
        } else {
            LedgerError::Io(e)
        }
    })
}

/// The record text of a raw line, or `None` for blank and comment lines.
fn record_text(raw: &[u8]) -> Option<std::result::Result<&str, std::str::Utf8Error>> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() || trimmed.starts_with(b"#") || trimmed.starts_with(b"//") {
        return None;
    }
    Some(std::str::from_utf8(trimmed))
}

/// Stream `path`, calling `f(lineno, text)` for every record line.
pub(crate) fn for_each_record(
    path: &Path,
    mut f: impl FnMut(usize, &str) -> Result<()>,
) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut lineno = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if let Some(text) = record_text(&buf) {
            let text = text.map_err(|e| LedgerError::parse(path, lineno + 1, e.to_string()))?;
            f(lineno, text)?;
        }
        lineno += 1;
    }
}

/// `/`-separated paths of every non-hidden `*.jsonl` file below `root`,
/// sorted. A missing root yields an empty list.
pub(crate) fn jsonl_files(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let include = build_globset(&["**/*.jsonl"])?;
    let exclude = build_globset(&["**/.*", "**/.*/**"])?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        if exclude.is_match(&rel_str) || !include.is_match(&rel_str) {
            continue;
        }
        files.push(rel_str);
    }
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let invalid = |e: globset::Error| {
        LedgerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    };
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(invalid)?);
    }
    builder.build().map_err(invalid)
}
