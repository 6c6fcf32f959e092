//! Content source: transport-independent access to remote items.

use async_trait::async_trait;
use bytes::Bytes;
use cmirror_core::{ItemId, Revision};
use opendal::{ErrorKind, Operator};
use thiserror::Error;
use tracing::debug;

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("remote item not found: {0}")]
    NotFound(String),

    /// Transient: the caller may retry
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unavailable(_))
    }
}

impl From<opendal::Error> for FetchError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => FetchError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied => FetchError::PermissionDenied(e.to_string()),
            _ => FetchError::Unavailable(e.to_string()),
        }
    }
}

/// Size and revision of a remote item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStat {
    pub size: u64,
    /// `None` when the backend exposes neither an ETag nor a version id
    pub revision: Option<Revision>,
}

/// Read, write, and stat items in the remote store.
///
/// Implementations must not cache: every call reaches the remote store or
/// its own transport.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Read up to `length` bytes of `item` starting at `offset`.
    /// Returns fewer bytes only at end of item.
    async fn read(&self, item: &ItemId, offset: u64, length: u64) -> Result<Bytes, FetchError>;

    /// Replace the content of `item`, returning its new revision.
    async fn write(&self, item: &ItemId, data: Bytes) -> Result<Revision, FetchError>;

    async fn stat(&self, item: &ItemId) -> Result<ItemStat, FetchError>;

    /// Remove `item`. Deleting a missing item succeeds.
    async fn delete(&self, item: &ItemId) -> Result<(), FetchError>;

    /// Move `from` to `to`, returning the revision of `to`.
    async fn rename(&self, from: &ItemId, to: &ItemId) -> Result<Revision, FetchError>;
}

/// [`ContentSource`] backed by any OpenDAL service.
#[derive(Clone)]
pub struct OpendalSource {
    op: Operator,
}

impl OpendalSource {
    pub fn new(op: Operator) -> Self {
        OpendalSource { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn revision_of(meta: &opendal::Metadata, data: Option<&[u8]>) -> Option<Revision> {
        meta.etag()
            .or_else(|| meta.version())
            .map(Revision::new)
            .or_else(|| data.map(|d| Revision::new(format!("b3:{}", blake3::hash(d).to_hex()))))
    }
}

#[async_trait]
impl ContentSource for OpendalSource {
    async fn read(&self, item: &ItemId, offset: u64, length: u64) -> Result<Bytes, FetchError> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(length);
        match self.op.read_with(item.as_str()).range(offset..end).await {
            Ok(buf) => {
                let bytes = buf.to_bytes();
                debug!(item = %item, offset, len = bytes.len(), "remote read");
                Ok(bytes)
            }
            // Reading at or past the end of the object
            Err(e) if e.kind() == ErrorKind::RangeNotSatisfied => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, item: &ItemId, data: Bytes) -> Result<Revision, FetchError> {
        let len = data.len();
        self.op.write(item.as_str(), data.clone()).await?;
        let meta = self.op.stat(item.as_str()).await?;
        let revision = Self::revision_of(&meta, Some(&data)).unwrap_or_else(|| {
            Revision::new(format!("b3:{}", blake3::hash(&data).to_hex()))
        });
        debug!(item = %item, bytes = len, revision = %revision, "remote write");
        Ok(revision)
    }

    async fn stat(&self, item: &ItemId) -> Result<ItemStat, FetchError> {
        let meta = self.op.stat(item.as_str()).await?;
        Ok(ItemStat {
            size: meta.content_length(),
            revision: Self::revision_of(&meta, None),
        })
    }

    async fn delete(&self, item: &ItemId) -> Result<(), FetchError> {
        match self.op.delete(item.as_str()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, from: &ItemId, to: &ItemId) -> Result<Revision, FetchError> {
        if self.op.info().full_capability().rename {
            self.op.rename(from.as_str(), to.as_str()).await?;
            let meta = self.op.stat(to.as_str()).await?;
            if let Some(rev) = Self::revision_of(&meta, None) {
                return Ok(rev);
            }
            let data = self.op.read(to.as_str()).await?.to_bytes();
            return Ok(Revision::new(format!("b3:{}", blake3::hash(&data).to_hex())));
        }

        // Backends without native rename: copy the content, then drop the source.
        let data = self.op.read(from.as_str()).await?.to_bytes();
        let revision = self.write(to, data).await?;
        self.delete(from).await?;
        Ok(revision)
    }
}
