//! Host boundary: what the engine reports back to the placeholder subsystem.
//!
//! On Windows the host is the Cloud Files minifilter (`CfExecute` with
//! TRANSFER_DATA / ACK_DATA / REPORT_PROGRESS). [`LocalDirHost`] is the
//! portable host: it writes transferred bytes straight into the placeholder
//! file under the sync root.

use async_trait::async_trait;
use cmirror_core::{PlaceholderId, TransferKey};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Why a transfer failed, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    PermissionDenied,
    /// Remote store stayed unavailable for the whole retry budget
    Unavailable,
    /// Another transfer is already hydrating the placeholder
    AlreadyInProgress,
    /// Placeholder unknown or request malformed
    InvalidRequest,
    /// Remote item ended before the requested range
    ShortRead,
    /// Writing into the placeholder failed
    HostWrite,
    /// The sync root is disconnecting
    ShuttingDown,
    /// Session dropped without reporting
    Aborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::NotFound => "not_found",
            FailureReason::PermissionDenied => "permission_denied",
            FailureReason::Unavailable => "unavailable",
            FailureReason::AlreadyInProgress => "already_in_progress",
            FailureReason::InvalidRequest => "invalid_request",
            FailureReason::ShortRead => "short_read",
            FailureReason::HostWrite => "host_write",
            FailureReason::ShuttingDown => "shutting_down",
            FailureReason::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Terminal status of a transfer. Exactly one is reported per transfer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Cancelled,
    Failed(FailureReason),
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Completed)
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::Cancelled => "cancelled",
            CompletionStatus::Failed(_) => "failed",
        }
    }

    /// The error a blocked reader observes, `None` on success.
    pub fn io_error_kind(&self) -> Option<std::io::ErrorKind> {
        use std::io::ErrorKind;
        match self {
            CompletionStatus::Completed => None,
            CompletionStatus::Cancelled => Some(ErrorKind::Interrupted),
            CompletionStatus::Failed(FailureReason::NotFound) => Some(ErrorKind::NotFound),
            CompletionStatus::Failed(FailureReason::PermissionDenied) => {
                Some(ErrorKind::PermissionDenied)
            }
            CompletionStatus::Failed(FailureReason::Unavailable) => Some(ErrorKind::TimedOut),
            CompletionStatus::Failed(FailureReason::AlreadyInProgress) => {
                Some(ErrorKind::WouldBlock)
            }
            CompletionStatus::Failed(_) => Some(ErrorKind::Other),
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("placeholder write failed for {placeholder}: {source}")]
    Write {
        placeholder: PlaceholderId,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer {0} rejected by host")]
    Rejected(TransferKey),
}

/// The placeholder subsystem the engine streams into.
#[async_trait]
pub trait TransferHost: Send + Sync {
    /// Write `data` into the placeholder at `offset`.
    async fn transfer_data(
        &self,
        key: TransferKey,
        placeholder: &PlaceholderId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), HostError>;

    /// Cumulative progress for a transfer.
    fn report_progress(&self, key: TransferKey, total: u64, completed: u64);

    /// Terminal status; always the last call for `key`.
    fn complete(&self, key: TransferKey, status: CompletionStatus);
}

/// Host that materializes placeholders as regular files under `root`.
///
/// Only the first write of a transfer may create the file. Later writes open
/// it in place, so a file removed mid-transfer fails the session with
/// [`FailureReason::HostWrite`] instead of coming back as a partial copy.
pub struct LocalDirHost {
    root: PathBuf,
    /// Transfers that have opened their file at least once
    opened: Mutex<HashSet<TransferKey>>,
}

impl LocalDirHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirHost {
            root: root.into(),
            opened: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl TransferHost for LocalDirHost {
    async fn transfer_data(
        &self,
        key: TransferKey,
        placeholder: &PlaceholderId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), HostError> {
        let path = placeholder.to_path(&self.root);
        let first = !self.opened.lock().contains(&key);
        let write = async {
            if first {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(first)
                .truncate(false)
                .open(&path)
                .await?;
            self.opened.lock().insert(key);
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await
        };
        write.await.map_err(|source| HostError::Write {
            placeholder: placeholder.clone(),
            source,
        })
    }

    fn report_progress(&self, key: TransferKey, total: u64, completed: u64) {
        debug!(key = %key, completed, total, "hydration progress");
    }

    fn complete(&self, key: TransferKey, status: CompletionStatus) {
        self.opened.lock().remove(&key);
        if status.is_success() {
            info!(key = %key, "hydration complete");
        } else {
            warn!(key = %key, status = %status, "hydration did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_host_writes_at_offset() {
        let tmp = tempfile::TempDir::new().unwrap();
        let host = LocalDirHost::new(tmp.path());
        let id = PlaceholderId::new("nested/dir/file.bin");

        host.transfer_data(TransferKey(1), &id, 4, b"5678")
            .await
            .unwrap();
        host.transfer_data(TransferKey(1), &id, 0, b"1234")
            .await
            .unwrap();

        let written = std::fs::read(tmp.path().join("nested/dir/file.bin")).unwrap();
        assert_eq!(written, b"12345678");
    }

    #[tokio::test]
    async fn removed_file_is_not_recreated_mid_transfer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let host = LocalDirHost::new(tmp.path());
        let id = PlaceholderId::new("notes.txt");
        let path = tmp.path().join("notes.txt");

        host.transfer_data(TransferKey(1), &id, 0, b"abcd")
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = host
            .transfer_data(TransferKey(1), &id, 4, b"efgh")
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Write { .. }));
        assert!(!path.exists());

        // A new transfer for the same placeholder starts from scratch.
        host.complete(TransferKey(1), CompletionStatus::Failed(FailureReason::HostWrite));
        host.transfer_data(TransferKey(2), &id, 0, b"wxyz")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"wxyz");
    }

    #[test]
    fn failure_maps_to_reader_error() {
        assert_eq!(CompletionStatus::Completed.io_error_kind(), None);
        assert_eq!(
            CompletionStatus::Failed(FailureReason::NotFound).io_error_kind(),
            Some(std::io::ErrorKind::NotFound)
        );
        assert_eq!(
            CompletionStatus::Cancelled.to_string(),
            "cancelled".to_string()
        );
        assert_eq!(
            CompletionStatus::Failed(FailureReason::ShortRead).to_string(),
            "failed(short_read)"
        );
    }
}
