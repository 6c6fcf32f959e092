use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Largest chunk the hydration engine will request in one remote read.
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Top-level daemon configuration (loaded from cloudmirror.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub root: RootConfig,
    pub hydration: HydrationConfig,
    pub sync: SyncConfig,
}

impl MirrorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config: MirrorConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::MirrorError> {
        if self.hydration.chunk_size == 0 {
            return Err(crate::MirrorError::Config(
                "hydration.chunk_size must be greater than zero".into(),
            ));
        }
        if self.hydration.read_attempts == 0 {
            return Err(crate::MirrorError::Config(
                "hydration.read_attempts must be at least 1".into(),
            ));
        }
        if self.root.path.as_os_str().is_empty() {
            return Err(crate::MirrorError::Config("root.path is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint (default: 127.0.0.1:9110)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Which OpenDAL service backs the content source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Fs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Root directory (fs backend) or key prefix (s3 backend) of the remote tree
    pub remote_root: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
    /// Environment variable holding the access key id
    pub access_key_env: String,
    /// Environment variable holding the secret access key
    pub secret_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Local directory mirrored from the remote store
    pub path: PathBuf,
    /// Placeholder table file (default: `<path>/.cloudmirror/placeholders.json`)
    pub table: Option<PathBuf>,
    /// Ask the host to include the requesting process in callbacks
    pub require_process_info: bool,
    /// Ask the host to include full paths in callbacks
    pub require_full_path: bool,
    /// Glob patterns (relative to the root) hydrated in full at startup
    pub pinned: Vec<String>,
}

impl RootConfig {
    /// The sync root with a leading `~/` expanded.
    pub fn local_path(&self) -> PathBuf {
        expand_tilde(&self.path)
    }

    pub fn table_path(&self) -> PathBuf {
        match &self.table {
            Some(table) => expand_tilde(table),
            None => self.local_path().join(".cloudmirror").join("placeholders.json"),
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationConfig {
    /// Bytes requested per remote read (capped at 1 MiB)
    pub chunk_size: u64,
    /// Total attempts per chunk read before the transfer fails
    pub read_attempts: u32,
    /// A remote read taking longer than this counts as unavailable
    pub read_timeout_ms: u64,
    /// Base delay between attempts, doubled after each failure
    pub retry_backoff_ms: u64,
    /// Concurrent streaming transfers (0 = cpu_count)
    pub max_concurrent_transfers: usize,
}

impl HydrationConfig {
    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Watch the sync root and propagate local changes upstream
    pub watch: bool,
    /// Coalesce watcher events arriving within this window
    pub debounce_ms: u64,
    /// Glob patterns (relative to the root) never propagated
    pub exclude_patterns: Vec<String>,
    /// Total attempts per upstream write/delete/rename
    pub max_attempts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9110".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "cloudmirror".into(),
            remote_root: "/".into(),
            enforce_tls: false,
            access_key_env: "AWS_ACCESS_KEY_ID".into(),
            secret_key_env: "AWS_SECRET_ACCESS_KEY".into(),
        }
    }
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/CloudMirror"),
            table: None,
            require_process_info: true,
            require_full_path: true,
            pinned: Vec::new(),
        }
    }
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            read_attempts: 3,
            read_timeout_ms: 30_000,
            retry_backoff_ms: 200,
            max_concurrent_transfers: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch: true,
            debounce_ms: 250,
            exclude_patterns: Vec::new(),
            max_attempts: 3,
        }
    }
}
