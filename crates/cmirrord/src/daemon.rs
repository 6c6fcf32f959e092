//! Daemon lifecycle: open the mirror, connect the sync root, serve hydration
//! and local changes until a signal arrives, then drain and disconnect

use anyhow::{anyhow, bail, Context, Result};
use cmirror_cloudfilter::{
    ConnectOptions, ConnectionHandle, ConnectionManager, EngineConfig, FetchRequest,
    HydrationEngine, LocalDirHost, LockFileRegistrar, PlaceholderTable, TransferHost,
    TransferReport,
};
use cmirror_core::config::MirrorConfig;
use cmirror_core::{ByteRange, HydrationState, MirrorError, PlaceholderId, TransferKey};
use cmirror_storage::OpendalSource;
use cmirror_sync::{watch_root, BridgeConfig, BridgeStats, ChangeBridge, WatchOptions};
use prometheus_client::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{HealthState, MeteredHost, MirrorMetrics};

/// Storage, sync root and placeholder table, opened from config.
struct Mirror {
    /// Sync root with symlinks resolved
    root: PathBuf,
    table_path: PathBuf,
    operator: opendal::Operator,
    source: Arc<OpendalSource>,
    table: Arc<PlaceholderTable>,
}

impl Mirror {
    async fn open(config: &MirrorConfig) -> Result<Self> {
        let configured = config.root.local_path();
        tokio::fs::create_dir_all(&configured)
            .await
            .with_context(|| format!("creating sync root {}", configured.display()))?;
        // Watcher events carry resolved paths.
        let root = tokio::fs::canonicalize(&configured)
            .await
            .with_context(|| format!("resolving sync root {}", configured.display()))?;
        if root != configured {
            debug!(configured = %configured.display(), root = %root.display(), "sync root resolved");
        }

        let operator = cmirror_storage::build_from_core_config(&config.storage)
            .context("building storage operator")?;
        match cmirror_storage::check_health(&operator).await {
            Ok(()) => info!(backend = ?config.storage.backend, "storage: connected"),
            // Reads are retried per chunk, so an unreachable store is not fatal here.
            Err(e) => warn!(backend = ?config.storage.backend, "storage: {e}"),
        }

        let table_path = config.root.table_path();
        let table = PlaceholderTable::load(&table_path)
            .with_context(|| format!("loading placeholder table {}", table_path.display()))?;
        info!(
            placeholders = table.len(),
            table = %table_path.display(),
            "placeholder table loaded"
        );

        Ok(Mirror {
            root,
            table_path,
            source: Arc::new(OpendalSource::new(operator.clone())),
            operator,
            table: Arc::new(table),
        })
    }

    fn engine(&self, host: Arc<dyn TransferHost>, config: &MirrorConfig) -> HydrationEngine {
        HydrationEngine::new(
            self.source.clone(),
            host,
            self.table.clone(),
            EngineConfig::from_hydration(&config.hydration),
        )
    }

    fn connect(
        &self,
        manager: &ConnectionManager,
        engine: &HydrationEngine,
        config: &MirrorConfig,
    ) -> Result<ConnectionHandle> {
        manager
            .connect(
                &self.root,
                Arc::new(engine.clone()),
                ConnectOptions::from(&config.root),
            )
            .map_err(|e| anyhow!(MirrorError::from(e)))
    }

    fn flush(&self) -> Result<()> {
        self.table
            .flush(&self.table_path)
            .with_context(|| format!("flushing placeholder table {}", self.table_path.display()))
    }
}

/// A connected sync root and the tasks serving it.
struct Daemon {
    mirror: Mirror,
    manager: ConnectionManager,
    handle: ConnectionHandle,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    bridge_task: Option<JoinHandle<BridgeStats>>,
    metrics_task: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Open the mirror and claim the sync root. The metrics endpoint only
    /// comes up once the root is connected.
    async fn start(config: &MirrorConfig) -> Result<Self> {
        let mirror = Mirror::open(config).await?;

        let mut registry = Registry::default();
        let metrics = MirrorMetrics::new(&mut registry);
        let registry = Arc::new(registry);
        let connected = Arc::new(AtomicBool::new(false));

        // Everything that can fail on bad config runs before the root is claimed.
        let pinned = pinned_requests(&mirror.table, &config.root.pinned)?;

        let shutdown = CancellationToken::new();
        let events = if config.sync.watch {
            let events = watch_root(
                &mirror.root,
                WatchOptions::from_sync(&config.sync),
                shutdown.child_token(),
            )
            .context("starting local watcher")?;
            Some(events)
        } else {
            info!("sync.watch disabled: local changes are not propagated");
            None
        };

        // ── Sync root ────────────────────────────────────────────────────
        let host = Arc::new(MeteredHost::new(
            LocalDirHost::new(&mirror.root),
            metrics.clone(),
        ));
        let engine = mirror.engine(host, config);
        let manager = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
        let handle = match mirror.connect(&manager, &engine, config) {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };
        connected.store(true, Ordering::Release);

        // ── Metrics ──────────────────────────────────────────────────────
        let metrics_task = config.daemon.metrics_addr.clone().map(|addr| {
            let state = HealthState {
                registry: registry.clone(),
                operator: mirror.operator.clone(),
                connected: connected.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = crate::metrics::serve(addr, state).await {
                    error!("metrics server failed: {e}");
                }
            })
        });

        if !pinned.is_empty() {
            info!(count = pinned.len(), "hydrating pinned placeholders");
        }
        for request in pinned {
            debug!(placeholder = %request.placeholder, key = %request.key, "pinned fetch");
            if handle.deliver_fetch(request).is_err() {
                break;
            }
        }

        // ── Change bridge ────────────────────────────────────────────────
        let bridge_task = events.map(|events| {
            let bridge = ChangeBridge::new(
                &mirror.root,
                mirror.source.clone(),
                mirror.table.clone(),
                engine.registry().clone(),
                BridgeConfig::from_sync(&config.sync),
            )
            .with_observer(move |propagated| metrics.record_change(propagated));
            let token = shutdown.clone();
            tokio::spawn(async move { bridge.run(events, token).await })
        });

        Ok(Daemon {
            mirror,
            manager,
            handle,
            connected,
            shutdown,
            bridge_task,
            metrics_task,
        })
    }

    /// Drain transfers and changes, disconnect, and persist the table.
    async fn stop(self) -> Result<()> {
        info!("shutting down");
        self.shutdown.cancel();
        self.connected.store(false, Ordering::Release);

        // Failures are logged by the manager; the table is flushed regardless.
        let _ = self.manager.disconnect(self.handle).await;

        if let Some(task) = self.bridge_task {
            match task.await {
                Ok(stats) => info!(
                    applied = stats.applied,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    "change bridge stopped"
                ),
                Err(e) => warn!("change bridge task failed: {e}"),
            }
        }
        if let Some(task) = self.metrics_task {
            task.abort();
        }

        self.mirror.flush()
    }
}

pub async fn run(config: MirrorConfig) -> Result<()> {
    info!("daemon starting");
    let daemon = Daemon::start(&config).await?;

    notify_ready();
    info!(root = %daemon.mirror.root.display(), "cloudmirror ready");

    let signal = shutdown_signal().await;
    daemon.stop().await?;
    signal?;
    info!("daemon stopped");
    Ok(())
}

/// Hydrate one placeholder in full, then disconnect.
pub async fn hydrate(config: MirrorConfig, path: PathBuf) -> Result<()> {
    let mirror = Mirror::open(&config).await?;
    let id = resolve_placeholder(&mirror.root, &path)
        .or_else(|_| resolve_placeholder(&config.root.local_path(), &path))?;
    let entry = mirror
        .table
        .snapshot(&id)
        .ok_or_else(|| anyhow!("{} is not a placeholder in this sync root", id))?;

    let engine = mirror.engine(Arc::new(LocalDirHost::new(&mirror.root)), &config);
    let manager = ConnectionManager::new(Arc::new(LockFileRegistrar::new()));
    let handle = mirror.connect(&manager, &engine, &config)?;

    let request = FetchRequest {
        key: new_transfer_key(),
        placeholder: id.clone(),
        range: ByteRange::full(entry.size),
    };
    let outcome = await_transfer(&engine, &handle, request).await;

    let _ = manager.disconnect(handle).await;
    mirror.flush()?;

    let report = outcome?;
    if !report.status.is_success() {
        bail!("hydration of {id} {}", report.status);
    }
    info!(
        placeholder = %id,
        bytes = report.bytes,
        chunks = report.chunks,
        "placeholder hydrated"
    );
    Ok(())
}

async fn await_transfer(
    engine: &HydrationEngine,
    handle: &ConnectionHandle,
    request: FetchRequest,
) -> Result<TransferReport> {
    if !handle.is_connected() {
        bail!("sync root is not connected");
    }
    let task = engine.start(request)?;
    task.await.context("hydration task failed")
}

/// Map a CLI path (absolute, or relative to the root) to its placeholder.
fn resolve_placeholder(root: &Path, path: &Path) -> Result<PlaceholderId> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    PlaceholderId::from_path(root, &absolute).ok_or_else(|| {
        anyhow!(
            "{} is not under the sync root {}",
            absolute.display(),
            root.display()
        )
    })
}

/// Full-range fetches for every pinned entry not yet hydrated.
fn pinned_requests(table: &PlaceholderTable, patterns: &[String]) -> Result<Vec<FetchRequest>> {
    let patterns = patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).with_context(|| format!("invalid root.pinned pattern {p:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if patterns.is_empty() {
        return Ok(Vec::new());
    }

    let mut entries = table.snapshot_all();
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(entries
        .into_iter()
        .filter(|e| e.state != HydrationState::Full)
        .filter(|e| patterns.iter().any(|p| p.matches(e.id.as_str())))
        .map(|e| FetchRequest {
            key: new_transfer_key(),
            placeholder: e.id,
            range: ByteRange::full(e.size),
        })
        .collect())
}

fn new_transfer_key() -> TransferKey {
    TransferKey(uuid::Uuid::new_v4().as_u64_pair().0)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("received ctrl-c");
    }
    Ok(())
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op without $NOTIFY_SOCKET
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmirror_cloudfilter::PlaceholderEntry;
    use cmirror_core::config::StorageBackend;
    use cmirror_core::{ItemId, Revision};
    use tempfile::TempDir;

    fn ghost(id: &str, size: u64) -> PlaceholderEntry {
        PlaceholderEntry::ghost(
            PlaceholderId::new(id),
            ItemId::new(id),
            size,
            Some(Revision::new("r1")),
        )
    }

    /// A config whose remote is an fs backend rooted at `remote`.
    fn fs_config(local: &Path, remote: &Path) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.storage.backend = StorageBackend::Fs;
        config.storage.remote_root = remote.display().to_string();
        config.root.path = local.to_path_buf();
        config.hydration.chunk_size = 4;
        config.hydration.retry_backoff_ms = 1;
        config
    }

    #[test]
    fn resolve_accepts_relative_and_absolute_paths() {
        let root = Path::new("/srv/mirror");
        assert_eq!(
            resolve_placeholder(root, Path::new("docs/a.txt")).unwrap(),
            PlaceholderId::new("docs/a.txt")
        );
        assert_eq!(
            resolve_placeholder(root, Path::new("/srv/mirror/docs/a.txt")).unwrap(),
            PlaceholderId::new("docs/a.txt")
        );
        assert!(resolve_placeholder(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn pinned_requests_cover_unhydrated_matches() {
        let table = PlaceholderTable::new();
        table.insert(ghost("docs/a.txt", 10));
        table.insert(ghost("docs/b.txt", 20));
        table.insert(ghost("media/c.mp4", 30));
        let mut full = ghost("docs/done.txt", 5);
        full.record_extent(ByteRange::full(5));
        table.insert(full);

        let requests = pinned_requests(&table, &["docs/*".to_string()]).unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.placeholder.as_str()).collect();
        assert_eq!(ids, vec!["docs/a.txt", "docs/b.txt"]);
        assert_eq!(requests[1].range, ByteRange::full(20));
        assert_ne!(requests[0].key, requests[1].key);

        assert!(pinned_requests(&table, &[]).unwrap().is_empty());
        assert!(pinned_requests(&table, &["[".to_string()]).is_err());
    }

    #[tokio::test]
    async fn hydrate_materializes_placeholder_and_persists_state() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("docs")).unwrap();
        std::fs::write(remote.path().join("docs/a.txt"), b"hello placeholder").unwrap();

        let config = fs_config(local.path(), remote.path());
        let table = PlaceholderTable::new();
        table.insert(PlaceholderEntry::ghost(
            PlaceholderId::new("docs/a.txt"),
            ItemId::new("docs/a.txt"),
            17,
            None,
        ));
        table.flush(&config.root.table_path()).unwrap();

        hydrate(config.clone(), PathBuf::from("docs/a.txt"))
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(local.path().join("docs/a.txt")).unwrap(),
            b"hello placeholder"
        );
        let reloaded = PlaceholderTable::load(&config.root.table_path()).unwrap();
        let entry = reloaded.snapshot(&PlaceholderId::new("docs/a.txt")).unwrap();
        assert_eq!(entry.state, HydrationState::Full);
        assert!(entry.content_hash.is_some());
    }

    #[tokio::test]
    async fn hydrate_fails_for_missing_remote_item() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let config = fs_config(local.path(), remote.path());
        let table = PlaceholderTable::new();
        table.insert(ghost("gone.bin", 8));
        table.flush(&config.root.table_path()).unwrap();

        let err = hydrate(config, PathBuf::from("gone.bin")).await.unwrap_err();
        assert!(err.to_string().contains("not_found"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_root_opens_resolved() {
        let tmp = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir_all(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mirror = Mirror::open(&fs_config(&link, remote.path())).await.unwrap();
        assert_eq!(mirror.root, std::fs::canonicalize(&real).unwrap());

        // Paths given under the link still name the placeholder.
        std::fs::write(remote.path().join("a.txt"), b"linked").unwrap();
        let table = PlaceholderTable::new();
        table.insert(ghost("a.txt", 6));
        table.flush(&mirror.table_path).unwrap();
        hydrate(fs_config(&link, remote.path()), link.join("a.txt"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(real.join("a.txt")).unwrap(), b"linked");
    }

    #[tokio::test]
    async fn failed_connect_serves_no_metrics() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let mut config = fs_config(local.path(), remote.path());
        config.sync.watch = false;
        config.daemon.metrics_addr = None;
        let first = Daemon::start(&config).await.unwrap();
        assert!(first.connected.load(Ordering::Acquire));

        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        config.daemon.metrics_addr = Some(addr.to_string());
        let Err(err) = Daemon::start(&config).await else {
            panic!("second daemon claimed a connected root");
        };
        assert!(err.to_string().contains("already connected"), "{err}");

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(std::net::TcpStream::connect(addr).is_err());

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn hydrate_rejects_unknown_path() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let config = fs_config(local.path(), remote.path());

        let err = hydrate(config, PathBuf::from("nope.txt")).await.unwrap_err();
        assert!(err.to_string().contains("not a placeholder"), "{err}");
    }
}
