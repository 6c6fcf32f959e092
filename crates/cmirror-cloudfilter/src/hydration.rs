//! Hydration engine: responds to FETCH_DATA / CANCEL_FETCH_DATA callbacks.
//!
//! When an application opens a dehydrated placeholder, the host calls
//! [`SyncCallbacks::fetch_data`]. The engine:
//!
//! 1. Registers a transfer session (rejecting a second concurrent fetch for
//!    the same placeholder with an immediate failure completion)
//! 2. Stats the remote item; a changed revision invalidates the placeholder
//! 3. Streams the requested range in bounded chunks: check cancellation,
//!    read from the content source (retrying transient errors), check
//!    cancellation again, write into the placeholder at the chunk offset,
//!    report cumulative progress
//! 4. Reports exactly one completion status, then removes the session
//!
//! Per transfer:
//!
//! ```text
//! Requested ──▶ Streaming ──┬──▶ Completed
//!                           ├──▶ Cancelled   (cancel callback or disconnect)
//!                           └──▶ Failed      (NotFound / PermissionDenied /
//!                                             Unavailable after retries)
//! ```
//!
//! Callbacks never block: streaming runs on a task per transfer, so chunk
//! writes within one transfer stay offset-ordered while transfers for
//! different placeholders proceed independently.

use async_trait::async_trait;
use cmirror_core::config::HydrationConfig;
use cmirror_core::{ByteRange, PlaceholderId, TransferKey};
use cmirror_storage::{with_retry, ContentSource, FetchError, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::host::{CompletionStatus, FailureReason, TransferHost};
use crate::placeholder::PlaceholderTable;
use crate::registry::{RegistryError, SessionHandle, TransferRegistry};

/// A fetch request delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: TransferKey,
    pub placeholder: PlaceholderId,
    /// Required byte range
    pub range: ByteRange,
}

/// The callback table bound to a sync root.
///
/// `fetch_data` and `cancel_fetch_data` may be invoked concurrently from any
/// thread and must return without waiting on I/O.
#[async_trait]
pub trait SyncCallbacks: Send + Sync {
    fn fetch_data(&self, request: FetchRequest);

    fn cancel_fetch_data(&self, key: TransferKey);

    /// Cancel all transfers and wait until each has reported completion.
    async fn drain(&self);
}

#[derive(Debug, Error)]
pub enum FetchRejected {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("unknown placeholder: {0}")]
    UnknownPlaceholder(PlaceholderId),
}

impl FetchRejected {
    fn reason(&self) -> FailureReason {
        match self {
            FetchRejected::Registry(RegistryError::AlreadyInProgress { .. }) => {
                FailureReason::AlreadyInProgress
            }
            FetchRejected::Registry(RegistryError::Leased(_)) => FailureReason::AlreadyInProgress,
            FetchRejected::Registry(RegistryError::Closed) => FailureReason::ShuttingDown,
            FetchRejected::Registry(RegistryError::DuplicateKey(_)) => FailureReason::InvalidRequest,
            FetchRejected::UnknownPlaceholder(_) => FailureReason::InvalidRequest,
        }
    }
}

/// Summary of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub key: TransferKey,
    pub placeholder: PlaceholderId,
    pub status: CompletionStatus,
    /// Bytes written into the placeholder
    pub bytes: u64,
    /// Chunks written into the placeholder
    pub chunks: u32,
    /// Remote read calls, including retried ones
    pub read_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per remote read
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    /// Transfers streaming at the same time
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_hydration(&HydrationConfig::default())
    }
}

impl EngineConfig {
    pub fn from_hydration(cfg: &HydrationConfig) -> Self {
        let max_concurrent = if cfg.max_concurrent_transfers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            cfg.max_concurrent_transfers
        };
        Self {
            chunk_size: cfg.effective_chunk_size(),
            retry: RetryPolicy::from_hydration(cfg),
            max_concurrent,
        }
    }
}

/// Why the streaming loop stopped early.
enum Stop {
    Cancelled,
    Failed(FailureReason),
}

impl From<FetchError> for Stop {
    fn from(e: FetchError) -> Self {
        Stop::Failed(match e {
            FetchError::NotFound(_) => FailureReason::NotFound,
            FetchError::PermissionDenied(_) => FailureReason::PermissionDenied,
            FetchError::Unavailable(_) => FailureReason::Unavailable,
        })
    }
}

/// Owns a registered session until its completion is reported.
///
/// `finish` ends the session and reports its status; if the guard is dropped
/// without `finish` (task aborted or panicked), `Drop` does the same with
/// [`FailureReason::Aborted`], so every session reports exactly once.
struct ActiveTransfer {
    session: SessionHandle,
    registry: Arc<TransferRegistry>,
    host: Arc<dyn TransferHost>,
    finished: bool,
}

impl ActiveTransfer {
    fn finish(mut self, status: CompletionStatus) {
        self.finished = true;
        self.release(status);
    }

    /// Completion goes out before the session is removed, so nothing
    /// waiting on the placeholder resumes ahead of the report.
    fn release(&self, status: CompletionStatus) {
        self.host.complete(self.session.key, status);
        self.registry.end(self.session.key);
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.session.key, "transfer dropped before completion");
            self.release(CompletionStatus::Failed(FailureReason::Aborted));
        }
    }
}

struct EngineInner {
    source: Arc<dyn ContentSource>,
    host: Arc<dyn TransferHost>,
    registry: Arc<TransferRegistry>,
    table: Arc<PlaceholderTable>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    runtime: Handle,
}

/// The hydration engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HydrationEngine {
    inner: Arc<EngineInner>,
}

impl HydrationEngine {
    /// Create an engine that spawns transfers on the current Tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn new(
        source: Arc<dyn ContentSource>,
        host: Arc<dyn TransferHost>,
        table: Arc<PlaceholderTable>,
        config: EngineConfig,
    ) -> Self {
        Self::with_runtime(source, host, table, config, Handle::current())
    }

    /// Create an engine that spawns transfers on `runtime`, for hosts that
    /// deliver callbacks from threads outside any runtime.
    pub fn with_runtime(
        source: Arc<dyn ContentSource>,
        host: Arc<dyn TransferHost>,
        table: Arc<PlaceholderTable>,
        config: EngineConfig,
        runtime: Handle,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        HydrationEngine {
            inner: Arc::new(EngineInner {
                source,
                host,
                registry: Arc::new(TransferRegistry::new()),
                table,
                config,
                permits,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                runtime,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.inner.registry
    }

    pub fn table(&self) -> &Arc<PlaceholderTable> {
        &self.inner.table
    }

    /// Register a transfer and start streaming it.
    ///
    /// A rejected request has already received its failure completion when
    /// this returns `Err`.
    pub fn start(&self, request: FetchRequest) -> Result<JoinHandle<TransferReport>, FetchRejected> {
        let inner = &self.inner;
        let admitted = if inner.shutdown.is_cancelled() {
            Err(FetchRejected::Registry(RegistryError::Closed))
        } else if inner.table.get(&request.placeholder).is_none() {
            Err(FetchRejected::UnknownPlaceholder(request.placeholder.clone()))
        } else {
            inner
                .registry
                .begin(request.key, request.placeholder.clone(), request.range)
                .map_err(FetchRejected::from)
        };

        let session = match admitted {
            Ok(session) => session,
            Err(rejected) => {
                warn!(key = %request.key, placeholder = %request.placeholder, "fetch rejected: {rejected}");
                inner
                    .host
                    .complete(request.key, CompletionStatus::Failed(rejected.reason()));
                return Err(rejected);
            }
        };

        info!(
            key = %request.key,
            placeholder = %request.placeholder,
            offset = request.range.offset,
            length = request.range.length,
            "hydration requested"
        );

        let transfer = ActiveTransfer {
            session,
            registry: inner.registry.clone(),
            host: inner.host.clone(),
            finished: false,
        };
        let engine = self.inner.clone();
        Ok(inner
            .tasks
            .spawn_on(async move { engine.run(transfer).await }, &inner.runtime))
    }

    /// Flag a transfer as cancelled. Returns false for unknown keys.
    pub fn cancel(&self, key: TransferKey) -> bool {
        let found = self.inner.registry.cancel(key);
        if !found {
            debug!(key = %key, "cancel for unknown or finished transfer");
        }
        found
    }

    /// Cancel every transfer, refuse new ones, and wait until all have
    /// reported completion.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let cancelled = inner.registry.close();
        inner.tasks.close();
        if cancelled > 0 {
            info!(cancelled, "draining in-flight transfers");
        }
        inner.tasks.wait().await;
        debug!("hydration engine drained");
    }
}

#[async_trait]
impl SyncCallbacks for HydrationEngine {
    fn fetch_data(&self, request: FetchRequest) {
        // Rejections are reported to the host inside `start`.
        let _ = self.start(request);
    }

    fn cancel_fetch_data(&self, key: TransferKey) {
        self.cancel(key);
    }

    async fn drain(&self) {
        self.shutdown().await;
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, transfer: ActiveTransfer) -> TransferReport {
        let session = transfer.session.clone();
        let read_attempts = AtomicU32::new(0);
        let mut chunks = 0u32;

        let outcome = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => self.stream(&session, &read_attempts, &mut chunks).await,
            Err(_) => Err(Stop::Cancelled),
        };

        let status = match outcome {
            Ok(()) => CompletionStatus::Completed,
            Err(Stop::Cancelled) => CompletionStatus::Cancelled,
            Err(Stop::Failed(reason)) => CompletionStatus::Failed(reason),
        };

        let report = TransferReport {
            key: session.key,
            placeholder: session.placeholder.clone(),
            status,
            bytes: session.delivered(),
            chunks,
            read_attempts: read_attempts.load(Ordering::Relaxed),
        };
        match status {
            CompletionStatus::Completed => info!(
                key = %report.key,
                placeholder = %report.placeholder,
                bytes = report.bytes,
                chunks = report.chunks,
                elapsed_ms = session.started.elapsed().as_millis() as u64,
                "hydration complete"
            ),
            CompletionStatus::Cancelled => info!(
                key = %report.key,
                placeholder = %report.placeholder,
                bytes = report.bytes,
                "hydration cancelled"
            ),
            CompletionStatus::Failed(reason) => error!(
                key = %report.key,
                placeholder = %report.placeholder,
                bytes = report.bytes,
                %reason,
                "hydration failed"
            ),
        }

        transfer.finish(status);
        report
    }

    fn should_stop(&self, session: &SessionHandle) -> bool {
        session.is_cancelled() || self.shutdown.is_cancelled()
    }

    async fn stream(
        &self,
        session: &SessionHandle,
        read_attempts: &AtomicU32,
        chunks: &mut u32,
    ) -> Result<(), Stop> {
        let Some(entry) = self.table.get(&session.placeholder) else {
            return Err(Stop::Failed(FailureReason::InvalidRequest));
        };
        let item = entry.lock().item.clone();

        if self.should_stop(session) {
            return Err(Stop::Cancelled);
        }

        // A changed remote item makes any local content stale.
        let stat = with_retry(&self.config.retry, "stat", |_| self.source.stat(&item)).await?;
        let size = {
            let mut e = entry.lock();
            let revision_changed = matches!(
                (&e.revision, &stat.revision),
                (Some(local), Some(remote)) if local != remote
            );
            if revision_changed || e.size != stat.size {
                info!(
                    placeholder = %e.id,
                    old_size = e.size,
                    new_size = stat.size,
                    "remote item changed, invalidating placeholder"
                );
                e.invalidate(stat.size, stat.revision.clone());
            } else if e.revision.is_none() {
                e.revision = stat.revision.clone();
            }
            e.size
        };

        let range = session.range.clip(size);
        if range.is_empty() {
            entry.lock().record_extent(range);
            return Ok(());
        }

        // Only a sequential pass over the whole item can vouch for its hash.
        let mut hasher = (range.offset == 0 && range.length == size).then(blake3::Hasher::new);
        let source = self.source.as_ref();
        let item_ref = &item;
        let mut offset = range.offset;

        while offset < range.end() {
            if self.should_stop(session) {
                return Err(Stop::Cancelled);
            }

            let len = self.config.chunk_size.min(range.end() - offset);
            let chunk_offset = offset;
            let mut data = with_retry(&self.config.retry, "read", move |_| {
                read_attempts.fetch_add(1, Ordering::Relaxed);
                source.read(item_ref, chunk_offset, len)
            })
            .await?;

            // A cancel that landed during the read drops the chunk unwritten.
            if self.should_stop(session) {
                debug!(key = %session.key, offset = chunk_offset, "discarding chunk read before cancel");
                return Err(Stop::Cancelled);
            }

            if data.is_empty() {
                warn!(placeholder = %session.placeholder, offset, "remote item ended early");
                return Err(Stop::Failed(FailureReason::ShortRead));
            }
            if data.len() as u64 > len {
                data.truncate(len as usize);
            }
            let n = data.len() as u64;

            if let Err(e) = self
                .host
                .transfer_data(session.key, &session.placeholder, offset, &data)
                .await
            {
                error!(key = %session.key, "placeholder write failed: {e}");
                return Err(Stop::Failed(FailureReason::HostWrite));
            }

            if let Some(h) = hasher.as_mut() {
                h.update(&data);
            }
            offset += n;
            *chunks += 1;
            let delivered = session.add_delivered(n);
            entry.lock().record_extent(ByteRange::new(chunk_offset, n));
            debug!(key = %session.key, offset = chunk_offset, len = n, delivered, "chunk transferred");
            self.host
                .report_progress(session.key, range.length, delivered);
        }

        if let Some(h) = hasher {
            entry.lock().content_hash = Some(h.finalize().to_hex().to_string());
        }
        Ok(())
    }
}
