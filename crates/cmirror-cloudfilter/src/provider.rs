//! Sync root connection: binds the local root to a callback table.
//!
//! Lifecycle:
//! - `ConnectionManager::connect()` registers the root with the host and
//!   returns the process's single [`ConnectionHandle`]
//! - the host delivers fetch/cancel events through the handle while it is live
//! - `ConnectionManager::disconnect()` stops deliveries, drains every
//!   transfer, then unregisters the root
//!
//! A failed connect is fatal to the caller. A failed disconnect is logged and
//! returned, but the handle is gone either way.

use cmirror_core::{MirrorError, TransferKey};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::hydration::{FetchRequest, SyncCallbacks};

/// Directory under the sync root holding provider bookkeeping.
pub const STATE_DIR: &str = ".cloudmirror";

const LOCK_FILE: &str = "connection.lock";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("sync root {root} is already connected ({holder})")]
    AlreadyConnected { root: PathBuf, holder: String },

    #[error("registration rejected for {root}: {reason}")]
    Rejected { root: PathBuf, reason: String },
}

impl From<ConnectError> for MirrorError {
    fn from(e: ConnectError) -> Self {
        MirrorError::Connection(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DisconnectError {
    #[error("unregistering {root}: {reason}")]
    Unregister { root: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sync root is not connected")]
pub struct NotConnected;

/// Flags requested from the host at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Callbacks carry the requesting process
    pub require_process_info: bool,
    /// Callbacks carry the full placeholder path
    pub require_full_path: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            require_process_info: true,
            require_full_path: true,
        }
    }
}

impl From<&cmirror_core::config::RootConfig> for ConnectOptions {
    fn from(cfg: &cmirror_core::config::RootConfig) -> Self {
        Self {
            require_process_info: cfg.require_process_info,
            require_full_path: cfg.require_full_path,
        }
    }
}

/// Key the host assigns to a registered root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(pub u64);

/// Root registration boundary.
pub trait RootRegistrar: Send + Sync {
    fn register(&self, root: &Path, options: &ConnectOptions) -> Result<ConnectionKey, ConnectError>;

    fn unregister(&self, root: &Path, key: ConnectionKey) -> Result<(), DisconnectError>;
}

/// Registrar that claims a root with an exclusive lock file, so a second
/// provider (in this or another process) cannot connect the same root.
#[derive(Debug, Default)]
pub struct LockFileRegistrar {
    next_key: AtomicU64,
}

impl LockFileRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(LOCK_FILE)
    }
}

impl RootRegistrar for LockFileRegistrar {
    fn register(&self, root: &Path, options: &ConnectOptions) -> Result<ConnectionKey, ConnectError> {
        let rejected = |reason: String| ConnectError::Rejected {
            root: root.to_path_buf(),
            reason,
        };

        std::fs::create_dir_all(root).map_err(|e| rejected(format!("creating root: {e}")))?;
        if !root.is_dir() {
            return Err(rejected("not a directory".into()));
        }
        let state_dir = root.join(STATE_DIR);
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| rejected(format!("creating {}: {e}", state_dir.display())))?;

        let lock_path = Self::lock_path(root);
        let mut lock = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&lock_path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".into());
                return Err(ConnectError::AlreadyConnected {
                    root: root.to_path_buf(),
                    holder: format!("{holder}; remove {} if stale", lock_path.display()),
                });
            }
            Err(e) => return Err(rejected(format!("creating lock file: {e}"))),
        };
        writeln!(
            lock,
            "pid={} process_info={} full_path={}",
            std::process::id(),
            options.require_process_info,
            options.require_full_path
        )
        .map_err(|e| rejected(format!("writing lock file: {e}")))?;

        Ok(ConnectionKey(self.next_key.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn unregister(&self, root: &Path, _key: ConnectionKey) -> Result<(), DisconnectError> {
        match std::fs::remove_file(Self::lock_path(root)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DisconnectError::Unregister {
                root: root.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

/// The live binding between the sync root and its callback table.
pub struct ConnectionHandle {
    root: PathBuf,
    key: ConnectionKey,
    options: ConnectOptions,
    callbacks: Arc<dyn SyncCallbacks>,
    live: AtomicBool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("root", &self.root)
            .field("key", &self.key)
            .field("options", &self.options)
            .field("live", &self.is_connected())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn options(&self) -> ConnectOptions {
        self.options
    }

    pub fn is_connected(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Deliver a FETCH_DATA event from the host.
    pub fn deliver_fetch(&self, request: FetchRequest) -> Result<(), NotConnected> {
        if !self.is_connected() {
            return Err(NotConnected);
        }
        self.callbacks.fetch_data(request);
        Ok(())
    }

    /// Deliver a CANCEL_FETCH_DATA event from the host.
    pub fn deliver_cancel(&self, key: TransferKey) -> Result<(), NotConnected> {
        if !self.is_connected() {
            return Err(NotConnected);
        }
        self.callbacks.cancel_fetch_data(key);
        Ok(())
    }
}

/// Owns the connect/disconnect lifecycle. One root per manager.
pub struct ConnectionManager {
    registrar: Arc<dyn RootRegistrar>,
    connected: Mutex<Option<PathBuf>>,
}

impl ConnectionManager {
    pub fn new(registrar: Arc<dyn RootRegistrar>) -> Self {
        ConnectionManager {
            registrar,
            connected: Mutex::new(None),
        }
    }

    /// Register `root` and bind `callbacks` to it.
    pub fn connect(
        &self,
        root: &Path,
        callbacks: Arc<dyn SyncCallbacks>,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectError> {
        let mut connected = self.connected.lock();
        if let Some(existing) = connected.as_ref() {
            return Err(ConnectError::AlreadyConnected {
                root: root.to_path_buf(),
                holder: format!("this process, root {}", existing.display()),
            });
        }

        info!(root = %root.display(), ?options, "connecting sync root");
        let key = self.registrar.register(root, &options).map_err(|e| {
            error!(root = %root.display(), "could not connect to sync root: {e}");
            e
        })?;

        *connected = Some(root.to_path_buf());
        info!(root = %root.display(), key = key.0, "sync root connected");
        Ok(ConnectionHandle {
            root: root.to_path_buf(),
            key,
            options,
            callbacks,
            live: AtomicBool::new(true),
        })
    }

    /// Stop callbacks, drain transfers, unregister the root.
    ///
    /// Best-effort: failures are logged and returned, never retried.
    pub async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), DisconnectError> {
        info!(root = %handle.root.display(), "shutting down sync root connection");
        handle.live.store(false, Ordering::Release);

        handle.callbacks.drain().await;
        debug!("callbacks drained");

        let result = self.registrar.unregister(&handle.root, handle.key);
        *self.connected.lock() = None;
        match &result {
            Ok(()) => info!(root = %handle.root.display(), "sync root disconnected"),
            Err(e) => warn!("could not disconnect the sync root: {e}"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingCallbacks {
        fetches: AtomicUsize,
        cancels: AtomicUsize,
        drained: AtomicBool,
    }

    #[async_trait]
    impl SyncCallbacks for CountingCallbacks {
        fn fetch_data(&self, _request: FetchRequest) {
            self.fetches.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel_fetch_data(&self, _key: TransferKey) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        async fn drain(&self) {
            self.drained.store(true, Ordering::SeqCst);
        }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            key: TransferKey(1),
            placeholder: cmirror_core::PlaceholderId::new("a.txt"),
            range: cmirror_core::ByteRange::new(0, 1),
        }
    }

    #[tokio::test]
    async fn connect_deliver_disconnect() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let manager = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
        let callbacks = Arc::new(CountingCallbacks::default());

        let handle = manager
            .connect(&root, callbacks.clone(), ConnectOptions::default())
            .unwrap();
        assert!(LockFileRegistrar::lock_path(&root).exists());

        handle.deliver_fetch(request()).unwrap();
        handle.deliver_cancel(TransferKey(1)).unwrap();
        assert_eq!(callbacks.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.cancels.load(Ordering::SeqCst), 1);

        manager.disconnect(handle).await.unwrap();
        assert!(callbacks.drained.load(Ordering::SeqCst));
        assert!(!LockFileRegistrar::lock_path(&root).exists());

        // Root can be connected again after a clean disconnect
        let again = manager
            .connect(&root, callbacks, ConnectOptions::default())
            .unwrap();
        manager.disconnect(again).await.unwrap();
    }

    #[test]
    fn second_connect_in_process_is_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let manager = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
        let _handle = manager
            .connect(
                tmp.path(),
                Arc::new(CountingCallbacks::default()),
                ConnectOptions::default(),
            )
            .unwrap();

        let err = manager
            .connect(
                &tmp.path().join("other"),
                Arc::new(CountingCallbacks::default()),
                ConnectOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectError::AlreadyConnected { .. }));
    }

    #[test]
    fn root_held_by_another_provider_is_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
        let second = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));

        let _handle = first
            .connect(
                tmp.path(),
                Arc::new(CountingCallbacks::default()),
                ConnectOptions::default(),
            )
            .unwrap();
        let err = second
            .connect(
                tmp.path(),
                Arc::new(CountingCallbacks::default()),
                ConnectOptions::default(),
            )
            .unwrap_err();
        match err {
            ConnectError::AlreadyConnected { holder, .. } => {
                assert!(holder.contains(&format!("pid={}", std::process::id())))
            }
            other => panic!("expected AlreadyConnected, got {other:?}"),
        }
        assert!(MirrorError::from(ConnectError::Rejected {
            root: tmp.path().to_path_buf(),
            reason: "x".into()
        })
        .is_fatal());
    }

    #[test]
    fn root_that_is_a_file_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("plain.txt");
        std::fs::write(&file, b"not a dir").unwrap();
        let manager = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
        let err = manager
            .connect(
                &file,
                Arc::new(CountingCallbacks::default()),
                ConnectOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ConnectError::Rejected { .. }));
    }

    #[tokio::test]
    async fn deliveries_after_disconnect_are_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let manager = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
        let callbacks = Arc::new(CountingCallbacks::default());
        let handle = manager
            .connect(tmp.path(), callbacks.clone(), ConnectOptions::default())
            .unwrap();

        // The window after disconnect has started
        handle.live.store(false, Ordering::Release);
        assert_eq!(handle.deliver_fetch(request()), Err(NotConnected));
        assert_eq!(handle.deliver_cancel(TransferKey(1)), Err(NotConnected));
        assert_eq!(callbacks.fetches.load(Ordering::SeqCst), 0);

        manager.disconnect(handle).await.unwrap();
    }
}
