//! OpenDAL Operator factory for cloudmirror content sources

use anyhow::{Context, Result};
use cmirror_core::config::StorageBackend;
use opendal::Operator;

/// Minimal config needed to build an operator
/// (full config lives in cmirror-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub remote_root: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for the configured backend.
///
/// No RetryLayer is installed: the hydration engine owns the retry budget
/// and must observe each transient failure.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    let op = match cfg.backend {
        StorageBackend::S3 => {
            // Path-style addressing is the default; required by MinIO and other self-hosted stores.
            let builder = opendal::services::S3::default()
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .root(&cfg.remote_root)
                .access_key_id(&cfg.access_key_id)
                .secret_access_key(&cfg.secret_access_key);
            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        StorageBackend::Fs => {
            let builder = opendal::services::Fs::default().root(&cfg.remote_root);
            Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        StorageBackend::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
    };

    Ok(op)
}

/// Build an operator from cmirror-core config, reading S3 credentials from
/// the configured environment variables.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(storage: &cmirror_core::config::StorageConfig) -> Result<Operator> {
    let (access_key_id, secret_access_key) = if storage.backend == StorageBackend::S3 {
        if storage.endpoint.starts_with("http://") {
            if storage.enforce_tls {
                anyhow::bail!(
                    "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                     Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                    storage.endpoint
                );
            }
            tracing::warn!(
                endpoint = %storage.endpoint,
                "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
            );
        }
        let access = std::env::var(&storage.access_key_env)
            .with_context(|| format!("S3 credentials not set: export {}", storage.access_key_env))?;
        let secret = std::env::var(&storage.secret_key_env)
            .with_context(|| format!("{} not set", storage.secret_key_env))?;
        (access, secret)
    } else {
        (String::new(), String::new())
    };

    build_operator(&StorageConfig {
        backend: storage.backend,
        endpoint: storage.endpoint.clone(),
        region: storage.region.clone(),
        bucket: storage.bucket.clone(),
        remote_root: storage.remote_root.clone(),
        access_key_id,
        secret_access_key,
    })
}
