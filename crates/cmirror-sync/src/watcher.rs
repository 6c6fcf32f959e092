//! Local change watcher.
//!
//! [`watch_root`] subscribes to filesystem events under the sync root and
//! yields debounced [`ChangeEvent`]s until its `CancellationToken` fires.
//! Events under the state directory and paths matching an exclude pattern
//! are dropped before they reach the bridge.

use cmirror_cloudfilter::STATE_DIR;
use cmirror_core::config::SyncConfig;
use cmirror_core::{ChangeEvent, ChangeKind};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to create watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    WatchPath {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("invalid exclude pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Quiet period before buffered events are released
    pub debounce: Duration,
    /// Glob patterns matched against the root-relative path and each of its
    /// components
    pub exclude_patterns: Vec<String>,
    /// Capacity of the outgoing event channel
    pub buffer: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            exclude_patterns: Vec::new(),
            buffer: 1024,
        }
    }
}

impl WatchOptions {
    pub fn from_sync(cfg: &SyncConfig) -> Self {
        Self {
            debounce: Duration::from_millis(cfg.debounce_ms),
            exclude_patterns: cfg.exclude_patterns.clone(),
            ..Self::default()
        }
    }
}

/// Decides which paths under the root are propagated.
#[derive(Debug)]
pub struct PathFilter {
    root: PathBuf,
    excludes: Vec<glob::Pattern>,
}

impl PathFilter {
    pub fn new(root: impl Into<PathBuf>, patterns: &[String]) -> Result<Self, WatcherError> {
        let excludes = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|source| WatcherError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(PathFilter {
            root: root.into(),
            excludes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return true;
        };
        let names: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        match names.first() {
            None => return true,
            Some(&first) if first == STATE_DIR => return true,
            _ => {}
        }
        let joined = names.join("/");
        self.excludes
            .iter()
            .any(|p| p.matches(&joined) || names.iter().any(|n| p.matches(n)))
    }

    /// Drop ignored paths. A rename across the filter boundary degrades to
    /// the half that is still visible.
    pub fn admit(&self, change: ChangeEvent) -> Option<ChangeEvent> {
        let ChangeEvent {
            path,
            kind,
            timestamp,
        } = change;
        match kind {
            ChangeKind::Renamed { from } => {
                match (self.is_ignored(&from), self.is_ignored(&path)) {
                    (false, false) => Some(ChangeEvent {
                        path,
                        kind: ChangeKind::Renamed { from },
                        timestamp,
                    }),
                    (true, false) => Some(ChangeEvent {
                        path,
                        kind: ChangeKind::Created,
                        timestamp,
                    }),
                    (false, true) => Some(ChangeEvent {
                        path: from,
                        kind: ChangeKind::Deleted,
                        timestamp,
                    }),
                    (true, true) => None,
                }
            }
            kind => (!self.is_ignored(&path)).then_some(ChangeEvent {
                path,
                kind,
                timestamp,
            }),
        }
    }
}

/// Map a raw notify event onto a change, if it is one we propagate.
pub fn translate(event: &Event) -> Option<ChangeEvent> {
    let path = event.paths.first()?.clone();
    let kind = match &event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let to = event.paths.get(1)?.clone();
            return Some(ChangeEvent::new(to, ChangeKind::Renamed { from: path }));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        // Unpaired rename: whichever side we are on is decided by existence.
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                ChangeKind::Created
            } else {
                ChangeKind::Deleted
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Deleted,
        _ => return None,
    };
    Some(ChangeEvent::new(path, kind))
}

/// Buffers changes until the watcher has been quiet for the debounce window,
/// coalescing repeated changes to the same path.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Vec<ChangeEvent>,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        self.last = Some(now);

        if let ChangeKind::Renamed { from } = &event.kind {
            // A paired rename supersedes its delete/create halves.
            self.remove_latest(from, |k| matches!(k, ChangeKind::Deleted));
            self.remove_latest(&event.path, |k| matches!(k, ChangeKind::Created));
            self.pending.push(event);
            return;
        }

        let latest = self.pending.iter().rposition(|e| {
            e.path == event.path
                || matches!(&e.kind, ChangeKind::Renamed { from } if from == &event.path)
        });
        match latest {
            Some(idx)
                if self.pending[idx].path == event.path
                    && !matches!(self.pending[idx].kind, ChangeKind::Renamed { .. }) =>
            {
                let prev = &mut self.pending[idx];
                prev.kind = coalesce(&prev.kind, &event.kind);
                prev.timestamp = event.timestamp;
            }
            _ => self.pending.push(event),
        }
    }

    fn remove_latest(&mut self, path: &Path, kind: impl Fn(&ChangeKind) -> bool) {
        if let Some(idx) = self.pending.iter().rposition(|e| e.path == path) {
            if kind(&self.pending[idx].kind) {
                self.pending.remove(idx);
            }
        }
    }

    /// When the buffered changes are due, if any are buffered.
    pub fn deadline(&self, window: Duration) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        self.last.map(|t| t + window)
    }

    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        self.last = None;
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn coalesce(prev: &ChangeKind, next: &ChangeKind) -> ChangeKind {
    match (prev, next) {
        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
        (ChangeKind::Created, _) => ChangeKind::Created,
        // Deleted then re-created: the file was replaced.
        _ => ChangeKind::Modified,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Watch `root` recursively. The returned stream ends once `shutdown` is
/// cancelled; buffered changes not yet released are dropped.
///
/// Must be called within a Tokio runtime.
pub fn watch_root(
    root: &Path,
    options: WatchOptions,
    shutdown: CancellationToken,
) -> Result<ReceiverStream<ChangeEvent>, WatcherError> {
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let filter = PathFilter::new(root.clone(), &options.exclude_patterns)?;

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .map_err(WatcherError::Create)?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|source| WatcherError::WatchPath {
            path: root.clone(),
            source,
        })?;

    let (tx, rx) = mpsc::channel(options.buffer.max(1));
    let debounce = options.debounce;

    tokio::spawn(async move {
        // Dropping the watcher stops notify's delivery thread.
        let _watcher = watcher;
        let mut debouncer = Debouncer::default();
        info!(root = %filter.root().display(), "watching sync root");

        loop {
            let deadline = debouncer.deadline(debounce);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => {
                        if let Some(change) = translate(&event).and_then(|c| filter.admit(c)) {
                            trace!(path = %change.path.display(), kind = change.kind.label(), "change observed");
                            debouncer.push(change, Instant::now());
                        }
                    }
                    Some(Err(e)) => warn!("watcher error: {e}"),
                    None => break,
                },
                _ = until(deadline) => {
                    for change in debouncer.drain() {
                        if tx.send(change).await.is_err() {
                            debug!("change receiver dropped, stopping watcher");
                            return;
                        }
                    }
                }
            }
        }

        if !debouncer.is_empty() {
            debug!(dropped = debouncer.len(), "watcher stopped with buffered changes");
        } else {
            debug!("watcher stopped");
        }
    });

    Ok(ReceiverStream::new(rx))
}
