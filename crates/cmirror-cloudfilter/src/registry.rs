//! Transfer session registry: the single source of truth for "is this
//! transfer still wanted".
//!
//! Sessions are keyed by the host's transfer key and indexed by placeholder.
//! At most one session per placeholder is active; a second `begin` for the
//! same placeholder fails with [`RegistryError::AlreadyInProgress`] and leaves
//! the first session untouched.
//!
//! A placeholder can also be leased by the change bridge while it reads and
//! uploads the local file. A lease waits for any active session to end, and
//! `begin` rejects new sessions until the lease is dropped, so hydration
//! writes and uploads of the same file never overlap.
//!
//! All methods take `&self` and are safe to call from the fetch-delivery and
//! cancel-delivery threads concurrently.

use cmirror_core::{ByteRange, PlaceholderId, TransferKey};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("transfer {active} already in progress for {placeholder}")]
    AlreadyInProgress {
        placeholder: PlaceholderId,
        active: TransferKey,
    },

    #[error("transfer key {0} is already registered")]
    DuplicateKey(TransferKey),

    #[error("{0} is leased by a local change")]
    Leased(PlaceholderId),

    #[error("registry closed: sync root is disconnecting")]
    Closed,
}

/// Bookkeeping for one in-flight fetch.
#[derive(Debug)]
pub struct TransferSession {
    pub key: TransferKey,
    pub placeholder: PlaceholderId,
    /// Range requested by the host
    pub range: ByteRange,
    pub started: Instant,
    delivered: AtomicU64,
    cancel: CancellationToken,
}

impl TransferSession {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Add `n` delivered bytes, returning the new total.
    pub fn add_delivered(&self, n: u64) -> u64 {
        self.delivered.fetch_add(n, Ordering::AcqRel) + n
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub type SessionHandle = Arc<TransferSession>;

#[derive(Default)]
struct Inner {
    sessions: HashMap<TransferKey, SessionHandle>,
    by_placeholder: HashMap<PlaceholderId, TransferKey>,
    leased: HashSet<PlaceholderId>,
    closed: bool,
}

#[derive(Default)]
pub struct TransferRegistry {
    inner: Mutex<Inner>,
    /// Notified whenever a session ends or a lease is released
    settled: Notify,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `placeholder`.
    pub fn begin(
        &self,
        key: TransferKey,
        placeholder: PlaceholderId,
        range: ByteRange,
    ) -> Result<SessionHandle, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if let Some(&active) = inner.by_placeholder.get(&placeholder) {
            return Err(RegistryError::AlreadyInProgress {
                placeholder,
                active,
            });
        }
        if inner.leased.contains(&placeholder) {
            return Err(RegistryError::Leased(placeholder));
        }
        if inner.sessions.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }

        let session = Arc::new(TransferSession {
            key,
            placeholder: placeholder.clone(),
            range,
            started: Instant::now(),
            delivered: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        inner.by_placeholder.insert(placeholder, key);
        inner.sessions.insert(key, session.clone());
        debug!(key = %key, placeholder = %session.placeholder, "transfer session registered");
        Ok(session)
    }

    pub fn lookup(&self, key: TransferKey) -> Option<SessionHandle> {
        self.inner.lock().sessions.get(&key).cloned()
    }

    /// The active session hydrating `placeholder`, if any.
    pub fn active_for(&self, placeholder: &PlaceholderId) -> Option<SessionHandle> {
        let inner = self.inner.lock();
        let key = inner.by_placeholder.get(placeholder)?;
        inner.sessions.get(key).cloned()
    }

    /// Flag a session as cancelled. The streaming loop observes the flag at
    /// its next chunk boundary. Returns false for unknown keys.
    pub fn cancel(&self, key: TransferKey) -> bool {
        match self.lookup(key) {
            Some(session) => {
                session.cancel.cancel();
                debug!(key = %key, "transfer session cancel requested");
                true
            }
            None => false,
        }
    }

    /// Remove a session. Wakes anyone waiting for its placeholder to settle.
    pub fn end(&self, key: TransferKey) -> Option<SessionHandle> {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.sessions.remove(&key);
            if let Some(session) = &removed {
                if inner.by_placeholder.get(&session.placeholder) == Some(&key) {
                    inner.by_placeholder.remove(&session.placeholder);
                }
            }
            removed
        };
        if removed.is_some() {
            self.settled.notify_waiters();
        }
        removed
    }

    /// Refuse new sessions and cancel every live one. Returns how many were
    /// cancelled.
    pub fn close(&self) -> usize {
        let sessions: Vec<SessionHandle> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.sessions.values().cloned().collect()
        };
        for session in &sessions {
            session.cancel.cancel();
        }
        sessions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no session is active for `placeholder`.
    pub async fn wait_settled(&self, placeholder: &PlaceholderId) {
        self.wait_until(|inner| !inner.by_placeholder.contains_key(placeholder))
            .await
    }

    /// Wait until no session is active at all.
    pub async fn wait_idle(&self) {
        self.wait_until(|inner| inner.sessions.is_empty()).await
    }

    /// Wait until `placeholder` has no active session and no other lease,
    /// then lease it.
    pub async fn lease(&self, placeholder: &PlaceholderId) -> ContentLease<'_> {
        self.acquire_lease(placeholder, false).await
    }

    /// Like [`lease`](Self::lease), but cancels whatever session is active
    /// for `placeholder` instead of letting it finish.
    pub async fn lease_cancelling(&self, placeholder: &PlaceholderId) -> ContentLease<'_> {
        self.acquire_lease(placeholder, true).await
    }

    pub fn is_leased(&self, placeholder: &PlaceholderId) -> bool {
        self.inner.lock().leased.contains(placeholder)
    }

    async fn acquire_lease(&self, placeholder: &PlaceholderId, cancel: bool) -> ContentLease<'_> {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                let active = inner
                    .by_placeholder
                    .get(placeholder)
                    .and_then(|key| inner.sessions.get(key))
                    .cloned();
                match active {
                    None if !inner.leased.contains(placeholder) => {
                        inner.leased.insert(placeholder.clone());
                        debug!(placeholder = %placeholder, "placeholder leased");
                        return ContentLease {
                            registry: self,
                            placeholder: placeholder.clone(),
                        };
                    }
                    Some(session) if cancel => session.cancel.cancel(),
                    _ => {}
                }
            }
            notified.await;
        }
    }

    async fn wait_until(&self, done: impl Fn(&Inner) -> bool) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            // Register before checking so an `end` in between is not missed.
            notified.as_mut().enable();
            if done(&self.inner.lock()) {
                return;
            }
            notified.await;
        }
    }
}

/// Holds off new transfers for one placeholder until dropped.
#[must_use = "the lease is released when dropped"]
pub struct ContentLease<'a> {
    registry: &'a TransferRegistry,
    placeholder: PlaceholderId,
}

impl ContentLease<'_> {
    pub fn placeholder(&self) -> &PlaceholderId {
        &self.placeholder
    }
}

impl Drop for ContentLease<'_> {
    fn drop(&mut self) {
        self.registry.inner.lock().leased.remove(&self.placeholder);
        self.registry.settled.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pid(s: &str) -> PlaceholderId {
        PlaceholderId::new(s)
    }

    #[test]
    fn second_begin_for_same_placeholder_is_rejected() {
        let reg = TransferRegistry::new();
        let first = reg
            .begin(TransferKey(1), pid("a.bin"), ByteRange::new(0, 10))
            .unwrap();
        first.add_delivered(4);

        let err = reg
            .begin(TransferKey(2), pid("a.bin"), ByteRange::new(0, 10))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyInProgress {
                placeholder: pid("a.bin"),
                active: TransferKey(1)
            }
        );

        // First session undisturbed
        let still = reg.lookup(TransferKey(1)).unwrap();
        assert_eq!(still.delivered(), 4);
        assert!(!still.is_cancelled());
        assert!(reg.lookup(TransferKey(2)).is_none());
    }

    #[test]
    fn distinct_placeholders_run_side_by_side() {
        let reg = TransferRegistry::new();
        reg.begin(TransferKey(1), pid("a"), ByteRange::new(0, 1))
            .unwrap();
        reg.begin(TransferKey(2), pid("b"), ByteRange::new(0, 1))
            .unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn cancel_sets_flag_and_end_removes() {
        let reg = TransferRegistry::new();
        let s = reg
            .begin(TransferKey(7), pid("a"), ByteRange::new(0, 1))
            .unwrap();
        assert!(reg.cancel(TransferKey(7)));
        assert!(s.is_cancelled());
        assert!(!reg.cancel(TransferKey(8)));

        assert!(reg.end(TransferKey(7)).is_some());
        assert!(reg.active_for(&pid("a")).is_none());
        assert!(reg.end(TransferKey(7)).is_none());

        // Placeholder is free again
        reg.begin(TransferKey(9), pid("a"), ByteRange::new(0, 1))
            .unwrap();
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let reg = TransferRegistry::new();
        reg.begin(TransferKey(1), pid("a"), ByteRange::new(0, 1))
            .unwrap();
        assert_eq!(
            reg.begin(TransferKey(1), pid("b"), ByteRange::new(0, 1))
                .unwrap_err(),
            RegistryError::DuplicateKey(TransferKey(1))
        );
    }

    #[test]
    fn close_cancels_all_and_refuses_new() {
        let reg = TransferRegistry::new();
        let a = reg
            .begin(TransferKey(1), pid("a"), ByteRange::new(0, 1))
            .unwrap();
        let b = reg
            .begin(TransferKey(2), pid("b"), ByteRange::new(0, 1))
            .unwrap();
        assert_eq!(reg.close(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert_eq!(
            reg.begin(TransferKey(3), pid("c"), ByteRange::new(0, 1))
                .unwrap_err(),
            RegistryError::Closed
        );
    }

    #[tokio::test]
    async fn wait_settled_returns_after_end() {
        let reg = Arc::new(TransferRegistry::new());
        reg.begin(TransferKey(1), pid("a"), ByteRange::new(0, 1))
            .unwrap();

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.wait_settled(&pid("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        reg.end(TransferKey(1));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_settled_is_immediate_when_idle() {
        let reg = TransferRegistry::new();
        tokio::time::timeout(Duration::from_millis(100), reg.wait_settled(&pid("x")))
            .await
            .expect("no session, no wait");
        reg.wait_idle().await;
    }

    #[test]
    fn lease_blocks_begin_until_dropped() {
        let reg = TransferRegistry::new();
        let lease = tokio_test::block_on(reg.lease(&pid("doc.txt")));
        assert!(reg.is_leased(&pid("doc.txt")));
        assert_eq!(
            reg.begin(TransferKey(1), pid("doc.txt"), ByteRange::new(0, 1))
                .unwrap_err(),
            RegistryError::Leased(pid("doc.txt"))
        );
        // Other placeholders are unaffected.
        reg.begin(TransferKey(2), pid("other.txt"), ByteRange::new(0, 1))
            .unwrap();

        drop(lease);
        assert!(!reg.is_leased(&pid("doc.txt")));
        reg.begin(TransferKey(3), pid("doc.txt"), ByteRange::new(0, 1))
            .unwrap();
    }

    #[tokio::test]
    async fn lease_waits_for_active_session() {
        let reg = Arc::new(TransferRegistry::new());
        let session = reg
            .begin(TransferKey(1), pid("a"), ByteRange::new(0, 1))
            .unwrap();

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move {
                let _lease = reg.lease(&pid("a")).await;
                let _ = tx.send(());
                // Hold the lease until the test has looked at it.
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "lease taken while session active");
        assert!(!session.is_cancelled());

        reg.end(TransferKey(1));
        tokio::time::timeout(Duration::from_secs(1), &mut rx)
            .await
            .expect("lease after end")
            .unwrap();
        assert!(reg.is_leased(&pid("a")));
        waiter.await.unwrap();
        assert!(!reg.is_leased(&pid("a")));
    }

    #[tokio::test]
    async fn lease_cancelling_cancels_active_session() {
        let reg = Arc::new(TransferRegistry::new());
        let session = reg
            .begin(TransferKey(1), pid("a"), ByteRange::new(0, 1))
            .unwrap();

        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move {
                let _lease = reg.lease_cancelling(&pid("a")).await;
            })
        };
        tokio::time::timeout(Duration::from_secs(1), session.cancellation().cancelled())
            .await
            .expect("session cancelled by lease");
        assert!(!waiter.is_finished());

        reg.end(TransferKey(1));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("lease after end")
            .unwrap();
    }

    #[test]
    fn concurrent_begin_admits_exactly_one() {
        let reg = Arc::new(TransferRegistry::new());
        let handles: Vec<_> = (0..16u64)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    reg.begin(TransferKey(i), pid("contended"), ByteRange::new(0, 1))
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
