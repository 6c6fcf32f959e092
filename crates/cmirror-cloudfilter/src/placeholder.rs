//! Placeholder table: local metadata for every remote item in the sync root.
//!
//! The table itself is populated externally (from a remote listing) and
//! persisted as JSON. Each entry sits behind its own lock, so state
//! transitions on one placeholder never contend with another:
//!
//!   - the hydration engine records delivered extents (Ghost → Partial → Full)
//!   - the change bridge records uploads and renames
//!   - a remote revision bump invalidates an entry back to Ghost

use anyhow::{Context, Result};
use cmirror_core::{ByteRange, HydrationState, ItemId, PlaceholderId, Revision};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Local metadata for one remote item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderEntry {
    pub id: PlaceholderId,
    /// Remote identity in the content source
    pub item: ItemId,
    /// Size of the remote item in bytes
    pub size: u64,
    /// Remote revision the local content corresponds to
    pub revision: Option<Revision>,
    pub state: HydrationState,
    /// Hydrated byte ranges, sorted and non-overlapping
    #[serde(default)]
    pub extents: Vec<ByteRange>,
    /// BLAKE3 of the full local content, when known
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl PlaceholderEntry {
    /// A dehydrated placeholder for a remote item.
    pub fn ghost(id: PlaceholderId, item: ItemId, size: u64, revision: Option<Revision>) -> Self {
        PlaceholderEntry {
            id,
            item,
            size,
            revision,
            state: HydrationState::Ghost,
            extents: Vec::new(),
            content_hash: None,
        }
    }

    /// Record that `range` is now present locally. State only moves forward.
    pub fn record_extent(&mut self, range: ByteRange) {
        let range = range.clip(self.size);
        if !range.is_empty() {
            self.extents.push(range);
            self.extents.sort_by_key(|r| r.offset);
            let mut merged: Vec<ByteRange> = Vec::with_capacity(self.extents.len());
            for r in self.extents.drain(..) {
                match merged.last_mut() {
                    Some(last) if r.offset <= last.end() => {
                        let end = last.end().max(r.end());
                        last.length = end - last.offset;
                    }
                    _ => merged.push(r),
                }
            }
            self.extents = merged;
        }

        let next = if self.is_fully_covered() {
            HydrationState::Full
        } else if !self.extents.is_empty() {
            HydrationState::Partial
        } else {
            self.state
        };
        self.state = self.state.max(next);
    }

    /// True when every byte of the item is present locally.
    pub fn is_fully_covered(&self) -> bool {
        self.size == 0
            || matches!(self.extents.as_slice(), [only] if only.offset == 0 && only.end() >= self.size)
    }

    /// True when `range` (clipped to the item size) is present locally.
    pub fn covers(&self, range: ByteRange) -> bool {
        let range = range.clip(self.size);
        range.is_empty()
            || self
                .extents
                .iter()
                .any(|e| e.offset <= range.offset && e.end() >= range.end())
    }

    /// Drop all local content knowledge: the remote item changed.
    pub fn invalidate(&mut self, size: u64, revision: Option<Revision>) {
        self.size = size;
        self.revision = revision;
        self.state = HydrationState::Ghost;
        self.extents.clear();
        self.content_hash = None;
    }

    /// Local content was uploaded and is now the remote revision.
    pub fn mark_synced(&mut self, size: u64, revision: Revision, content_hash: String) {
        self.size = size;
        self.revision = Some(revision);
        self.extents = if size > 0 {
            vec![ByteRange::full(size)]
        } else {
            Vec::new()
        };
        self.state = HydrationState::Full;
        self.content_hash = Some(content_hash);
    }
}

/// Shared handle to one individually-locked entry.
pub type EntryHandle = Arc<Mutex<PlaceholderEntry>>;

/// All placeholders of the sync root.
#[derive(Default)]
pub struct PlaceholderTable {
    entries: RwLock<HashMap<PlaceholderId, EntryHandle>>,
}

impl PlaceholderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table from a JSON file. A missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading placeholder table: {}", path.display()))?;
        let entries: Vec<PlaceholderEntry> = serde_json::from_str(&content)
            .with_context(|| format!("parsing placeholder table: {}", path.display()))?;
        let table = Self::new();
        for entry in entries {
            table.insert(entry);
        }
        debug!(path = %path.display(), entries = table.len(), "placeholder table loaded");
        Ok(table)
    }

    /// Persist the table atomically (temp file + rename).
    pub fn flush(&self, path: &Path) -> Result<()> {
        let mut entries = self.snapshot_all();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_string_pretty(&entries).context("serializing placeholder table")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating table dir: {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing placeholder table tmp: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming placeholder table: {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, id: &PlaceholderId) -> Option<EntryHandle> {
        self.entries.read().get(id).cloned()
    }

    /// A copy of the entry's current state.
    pub fn snapshot(&self, id: &PlaceholderId) -> Option<PlaceholderEntry> {
        self.get(id).map(|e| e.lock().clone())
    }

    pub fn snapshot_all(&self) -> Vec<PlaceholderEntry> {
        let handles: Vec<EntryHandle> = self.entries.read().values().cloned().collect();
        handles.iter().map(|e| e.lock().clone()).collect()
    }

    /// Insert or replace an entry.
    pub fn insert(&self, entry: PlaceholderEntry) {
        let id = entry.id.clone();
        self.entries.write().insert(id, Arc::new(Mutex::new(entry)));
    }

    pub fn remove(&self, id: &PlaceholderId) -> Option<PlaceholderEntry> {
        self.entries.write().remove(id).map(|e| e.lock().clone())
    }

    /// Re-key an entry under a new id and remote item. Returns false if
    /// `from` is unknown.
    pub fn rename(&self, from: &PlaceholderId, to: PlaceholderId, item: ItemId) -> bool {
        let mut map = self.entries.write();
        let Some(handle) = map.remove(from) else {
            return false;
        };
        {
            let mut entry = handle.lock();
            entry.id = to.clone();
            entry.item = item;
        }
        map.insert(to, handle);
        true
    }

    /// Apply `f` to an entry under its lock.
    pub fn update<R>(&self, id: &PlaceholderId, f: impl FnOnce(&mut PlaceholderEntry) -> R) -> Option<R> {
        let handle = self.get(id)?;
        let mut entry = handle.lock();
        Some(f(&mut entry))
    }

    pub fn ids(&self) -> Vec<PlaceholderId> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
