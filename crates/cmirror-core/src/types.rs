use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Identity of a placeholder: its `/`-separated path relative to the sync root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceholderId(String);

impl PlaceholderId {
    pub fn new(rel_path: impl Into<String>) -> Self {
        PlaceholderId(rel_path.into().trim_start_matches('/').to_string())
    }

    /// Build an id from a path under `root`. Returns `None` for paths outside
    /// the root, the root itself, or paths containing `..`.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let rel = path.strip_prefix(root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(PlaceholderId(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute local path of this placeholder under `root`.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote identity of an item in the content store (object key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(key: impl Into<String>) -> Self {
        ItemId(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque remote revision (ETag, version id, or content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Revision(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque key the host assigns to one fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey(pub u64);

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A half-open byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        ByteRange { offset, length }
    }

    /// The whole extent of a file of `size` bytes.
    pub fn full(size: u64) -> Self {
        ByteRange {
            offset: 0,
            length: size,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Clip the range so it does not extend past `size`.
    pub fn clip(&self, size: u64) -> Self {
        let offset = self.offset.min(size);
        let end = self.end().min(size);
        ByteRange {
            offset,
            length: end - offset,
        }
    }
}

/// Hydration state of a placeholder. Ordered: `Ghost < Partial < Full`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HydrationState {
    /// No content present locally
    #[default]
    Ghost,
    /// Some byte ranges present locally
    Partial,
    /// Entire content present locally
    Full,
}

impl fmt::Display for HydrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HydrationState::Ghost => "ghost",
            HydrationState::Partial => "partial",
            HydrationState::Full => "full",
        };
        f.write_str(s)
    }
}

/// Kind of local filesystem change reported by the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// `path` was renamed from `from`
    Renamed { from: PathBuf },
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed { .. } => "renamed",
        }
    }
}

/// A local change, consumed exactly once by the change bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: SystemTime,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        ChangeEvent {
            path: path.into(),
            kind,
            timestamp: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_id_from_path() {
        let root = Path::new("/mirror");
        let id = PlaceholderId::from_path(root, Path::new("/mirror/docs/report.pdf")).unwrap();
        assert_eq!(id.as_str(), "docs/report.pdf");
        assert_eq!(id.to_path(root), PathBuf::from("/mirror/docs/report.pdf"));
    }

    #[test]
    fn placeholder_id_rejects_outside_root() {
        let root = Path::new("/mirror");
        assert!(PlaceholderId::from_path(root, Path::new("/elsewhere/a.txt")).is_none());
        assert!(PlaceholderId::from_path(root, Path::new("/mirror")).is_none());
        assert!(PlaceholderId::from_path(root, Path::new("/mirror/../etc/passwd")).is_none());
    }

    #[test]
    fn byte_range_clip() {
        let r = ByteRange::new(10, 100);
        assert_eq!(r.clip(50), ByteRange::new(10, 40));
        assert_eq!(r.clip(5), ByteRange::new(5, 0));
        assert!(r.clip(5).is_empty());
        assert_eq!(r.clip(1000), r);
    }

    #[test]
    fn hydration_state_ordering() {
        assert!(HydrationState::Ghost < HydrationState::Partial);
        assert!(HydrationState::Partial < HydrationState::Full);
        assert_eq!(HydrationState::default(), HydrationState::Ghost);
    }

    #[test]
    fn transfer_key_display() {
        assert_eq!(TransferKey(0x2a).to_string(), "0x000000000000002a");
    }
}
