//! Change propagation bridge: applies local changes to the content source.
//!
//! Events for the same path are applied in delivery order: each path keeps
//! a "done" token for its latest piece of work, and new work for that path
//! waits on it first. A rename waits on both of its paths. Work for
//! unrelated paths runs concurrently.
//!
//!   - `Created` / `Modified` → upload the local file, then mark the entry
//!     synced (size, revision, content hash, `Full`)
//!   - `Deleted` → delete the remote item, then drop the entry
//!   - `Renamed` → rename the remote item, then re-key the entry
//!
//! Every change holds a lease on the placeholders it touches (see
//! [`TransferRegistry::lease`]). Taking the lease waits until an active
//! hydration has reported its completion, and no new hydration can begin
//! until the change is done, so uploads never read a file mid-transfer.
//!
//! Event paths may arrive in canonical form (the watcher resolves symlinks
//! in the root); both the configured and the canonical root are accepted.

use bytes::Bytes;
use cmirror_cloudfilter::{PlaceholderEntry, PlaceholderTable, TransferRegistry};
use cmirror_core::config::SyncConfig;
use cmirror_core::{ChangeEvent, ChangeKind, HydrationState, ItemId, PlaceholderId, Revision};
use cmirror_storage::{with_retry, ContentSource, FetchError, RetryPolicy};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Why a change was not propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Content hash matches what the remote already has
    Unchanged,
    /// Local file holds only part of the remote content
    NotHydrated,
    Directory,
    /// File disappeared before it could be read
    Vanished,
    /// Nothing in the table corresponds to the path
    Untracked,
    OutsideRoot,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Unchanged => "unchanged",
            SkipReason::NotHydrated => "not_hydrated",
            SkipReason::Directory => "directory",
            SkipReason::Vanished => "vanished",
            SkipReason::Untracked => "untracked",
            SkipReason::OutsideRoot => "outside_root",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Uploaded { bytes: u64, revision: Revision },
    /// Number of remote items removed
    Deleted(usize),
    /// Number of remote items moved
    Renamed(usize),
    Skipped(SkipReason),
    Failed(FetchError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Uploaded { .. } => "uploaded",
            Outcome::Deleted(_) => "deleted",
            Outcome::Renamed(_) => "renamed",
            Outcome::Skipped(_) => "skipped",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// A change and what became of it.
#[derive(Debug, Clone)]
pub struct Propagated {
    pub event: ChangeEvent,
    pub outcome: Outcome,
}

/// Observer invoked once per applied change
pub type PropagatedFn = Arc<dyn Fn(&Propagated) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Budget for each upstream write, delete and rename
    pub retry: RetryPolicy,
}

impl BridgeConfig {
    pub fn from_sync(cfg: &SyncConfig) -> Self {
        Self {
            retry: RetryPolicy {
                attempts: cfg.max_attempts.max(1),
                ..RetryPolicy::default()
            },
        }
    }
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct BridgeInner {
    root: PathBuf,
    /// `root` with symlinks resolved, when that differs
    canonical_root: Option<PathBuf>,
    source: Arc<dyn ContentSource>,
    table: Arc<PlaceholderTable>,
    registry: Arc<TransferRegistry>,
    config: BridgeConfig,
    observer: Option<PropagatedFn>,
    counters: Counters,
}

/// Consumes local changes and pushes them upstream.
#[derive(Clone)]
pub struct ChangeBridge {
    inner: Arc<BridgeInner>,
}

impl ChangeBridge {
    pub fn new(
        root: impl Into<PathBuf>,
        source: Arc<dyn ContentSource>,
        table: Arc<PlaceholderTable>,
        registry: Arc<TransferRegistry>,
        config: BridgeConfig,
    ) -> Self {
        let root = root.into();
        let canonical_root = std::fs::canonicalize(&root)
            .ok()
            .filter(|canonical| *canonical != root);
        ChangeBridge {
            inner: Arc::new(BridgeInner {
                root,
                canonical_root,
                source,
                table,
                registry,
                config,
                observer: None,
                counters: Counters::default(),
            }),
        }
    }

    /// Call `f` for every change once it has been applied.
    ///
    /// Must be called before the bridge is cloned or run.
    pub fn with_observer(mut self, f: impl Fn(&Propagated) + Send + Sync + 'static) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.observer = Some(Arc::new(f));
        } else {
            warn!("bridge already shared, observer ignored");
        }
        self
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.inner.counters;
        BridgeStats {
            applied: c.applied.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Apply changes from `events` until it ends or `shutdown` fires, then
    /// wait for work already started.
    pub async fn run<S>(&self, events: S, shutdown: CancellationToken) -> BridgeStats
    where
        S: Stream<Item = ChangeEvent> + Send,
    {
        let tasks = TaskTracker::new();
        let mut tails: HashMap<PathBuf, CancellationToken> = HashMap::new();
        futures::pin_mut!(events);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            tails.retain(|_, done| !done.is_cancelled());

            let mut paths = vec![event.path.clone()];
            if let ChangeKind::Renamed { from } = &event.kind {
                paths.push(from.clone());
            }
            let waits: Vec<CancellationToken> =
                paths.iter().filter_map(|p| tails.get(p).cloned()).collect();
            let done = CancellationToken::new();
            for path in paths {
                tails.insert(path, done.clone());
            }

            let inner = self.inner.clone();
            tasks.spawn(async move {
                // Signals successors even if this work panics.
                let _done = done.drop_guard();
                for prev in waits {
                    prev.cancelled().await;
                }
                inner.propagate(event).await;
            });
        }

        tasks.close();
        if !tasks.is_empty() {
            debug!(pending = tasks.len(), "waiting for in-flight propagation");
        }
        tasks.wait().await;
        self.stats()
    }

    /// Apply one change directly, bypassing per-path ordering.
    pub async fn apply(&self, event: ChangeEvent) -> Outcome {
        self.inner.apply(&event).await
    }
}

impl BridgeInner {
    async fn propagate(&self, event: ChangeEvent) {
        let outcome = self.apply(&event).await;
        let counter = match &outcome {
            Outcome::Skipped(reason) => {
                debug!(path = %event.path.display(), kind = event.kind.label(), %reason, "change skipped");
                &self.counters.skipped
            }
            Outcome::Failed(e) => {
                error!(path = %event.path.display(), kind = event.kind.label(), "change propagation failed: {e}");
                &self.counters.failed
            }
            _ => {
                info!(path = %event.path.display(), kind = event.kind.label(), outcome = outcome.label(), "change propagated");
                &self.counters.applied
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer(&Propagated { event, outcome });
        }
    }

    fn placeholder_id(&self, path: &Path) -> Option<PlaceholderId> {
        PlaceholderId::from_path(&self.root, path).or_else(|| {
            self.canonical_root
                .as_deref()
                .and_then(|root| PlaceholderId::from_path(root, path))
        })
    }

    async fn apply(&self, event: &ChangeEvent) -> Outcome {
        let Some(id) = self.placeholder_id(&event.path) else {
            return Outcome::Skipped(SkipReason::OutsideRoot);
        };
        match &event.kind {
            ChangeKind::Created | ChangeKind::Modified => self.upload(&id).await,
            ChangeKind::Deleted => self.delete(&id).await,
            ChangeKind::Renamed { from } => match self.placeholder_id(from) {
                Some(from_id) => self.rename(&from_id, &id).await,
                // Moved in from outside the root: a new file.
                None => self.upload(&id).await,
            },
        }
    }

    async fn upload(&self, id: &PlaceholderId) -> Outcome {
        if let Some(session) = self.registry.active_for(id) {
            debug!(placeholder = %id, key = %session.key, "deferring change until hydration settles");
        }
        let _lease = self.registry.lease(id).await;

        let path = id.to_path(&self.root);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Outcome::Skipped(SkipReason::Directory),
            Ok(_) => {}
            Err(_) => return Outcome::Skipped(SkipReason::Vanished),
        }

        let entry = self.table.snapshot(id);
        if let Some(e) = &entry {
            if e.state != HydrationState::Full {
                return Outcome::Skipped(SkipReason::NotHydrated);
            }
        }

        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(_) => return Outcome::Skipped(SkipReason::Vanished),
        };
        let hash = blake3::hash(&data).to_hex().to_string();
        if entry.as_ref().and_then(|e| e.content_hash.as_deref()) == Some(hash.as_str()) {
            return Outcome::Skipped(SkipReason::Unchanged);
        }

        let item = entry
            .as_ref()
            .map(|e| e.item.clone())
            .unwrap_or_else(|| ItemId::new(id.as_str()));
        let source = self.source.as_ref();
        let revision = match with_retry(&self.config.retry, "write", |_| {
            source.write(&item, data.clone())
        })
        .await
        {
            Ok(rev) => rev,
            Err(e) => return Outcome::Failed(e),
        };

        let size = data.len() as u64;
        let synced = self.table.update(id, |e| {
            e.item = item.clone();
            e.mark_synced(size, revision.clone(), hash.clone());
        });
        if synced.is_none() {
            let mut e = PlaceholderEntry::ghost(id.clone(), item, size, None);
            e.mark_synced(size, revision.clone(), hash);
            self.table.insert(e);
        }
        Outcome::Uploaded {
            bytes: size,
            revision,
        }
    }

    /// The tracked entries at or below `id`, for files and directories alike.
    fn entries_under(&self, id: &PlaceholderId) -> Vec<PlaceholderEntry> {
        if let Some(entry) = self.table.snapshot(id) {
            return vec![entry];
        }
        let prefix = format!("{}/", id.as_str());
        self.table
            .snapshot_all()
            .into_iter()
            .filter(|e| e.id.as_str().starts_with(&prefix))
            .collect()
    }

    async fn delete(&self, id: &PlaceholderId) -> Outcome {
        let targets = self.entries_under(id);
        if targets.is_empty() {
            return Outcome::Skipped(SkipReason::Untracked);
        }

        let source = self.source.as_ref();
        let mut removed = 0;
        for entry in targets {
            // The local file is gone; its hydration has nothing to write into.
            let _lease = self.registry.lease_cancelling(&entry.id).await;
            let item = &entry.item;
            match with_retry(&self.config.retry, "delete", |_| source.delete(item)).await {
                Ok(()) | Err(FetchError::NotFound(_)) => {}
                Err(e) => return Outcome::Failed(e),
            }
            self.table.remove(&entry.id);
            removed += 1;
        }
        Outcome::Deleted(removed)
    }

    async fn rename(&self, from: &PlaceholderId, to: &PlaceholderId) -> Outcome {
        let targets = self.entries_under(from);
        if targets.is_empty() {
            return self.upload(to).await;
        }

        let source = self.source.as_ref();
        let mut moved = 0;
        for entry in targets {
            let suffix = &entry.id.as_str()[from.as_str().len()..];
            let new_id = PlaceholderId::new(format!("{}{suffix}", to.as_str()));
            let new_item = ItemId::new(new_id.as_str());
            let lease = self.registry.lease(&entry.id).await;

            let old_item = &entry.item;
            let target = &new_item;
            let revision = match with_retry(&self.config.retry, "rename", |_| {
                source.rename(old_item, target)
            })
            .await
            {
                Ok(rev) => rev,
                Err(FetchError::NotFound(_)) => {
                    // Remote copy is gone; publish what we have locally.
                    warn!(from = %entry.id, to = %new_id, "rename source missing remotely, uploading instead");
                    self.table.remove(&entry.id);
                    drop(lease);
                    if let Outcome::Failed(e) = self.upload(&new_id).await {
                        return Outcome::Failed(e);
                    }
                    moved += 1;
                    continue;
                }
                Err(e) => return Outcome::Failed(e),
            };

            self.table.rename(&entry.id, new_id.clone(), new_item);
            self.table.update(&new_id, |e| e.revision = Some(revision));
            moved += 1;
        }
        Outcome::Renamed(moved)
    }
}
