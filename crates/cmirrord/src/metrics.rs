//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness check (always 200 if process is running)
//!   GET /readyz   Readiness check (200 if the root is connected and
//!                 storage is reachable)

use anyhow::Result;
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use cmirror_cloudfilter::{CompletionStatus, HostError, TransferHost};
use cmirror_core::{PlaceholderId, TransferKey};
use cmirror_sync::Propagated;
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Labels = Vec<(String, String)>;

#[derive(Clone)]
pub struct MirrorMetrics {
    hydrations: Family<Labels, Counter>,
    hydrated_bytes: Counter,
    changes: Family<Labels, Counter>,
}

impl MirrorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let hydrations = Family::default();
        let hydrated_bytes = Counter::default();
        let changes = Family::default();

        registry.register(
            "cmirror_hydrations",
            "Hydration transfers by terminal status",
            hydrations.clone(),
        );
        registry.register(
            "cmirror_hydrated_bytes",
            "Bytes written into placeholders",
            hydrated_bytes.clone(),
        );
        registry.register(
            "cmirror_changes",
            "Local changes handled by the change bridge",
            changes.clone(),
        );

        MirrorMetrics {
            hydrations,
            hydrated_bytes,
            changes,
        }
    }

    pub fn record_completion(&self, status: CompletionStatus) {
        let mut labels = vec![("status".to_string(), status.label().to_string())];
        if let CompletionStatus::Failed(reason) = status {
            labels.push(("reason".to_string(), reason.to_string()));
        }
        self.hydrations.get_or_create(&labels).inc();
    }

    pub fn record_bytes(&self, n: u64) {
        self.hydrated_bytes.inc_by(n);
    }

    pub fn record_change(&self, propagated: &Propagated) {
        let labels = vec![
            ("kind".to_string(), propagated.event.kind.label().to_string()),
            ("outcome".to_string(), propagated.outcome.label().to_string()),
        ];
        self.changes.get_or_create(&labels).inc();
    }
}

/// Host decorator that counts hydrated bytes and completions.
pub struct MeteredHost<H> {
    inner: H,
    metrics: MirrorMetrics,
}

impl<H> MeteredHost<H> {
    pub fn new(inner: H, metrics: MirrorMetrics) -> Self {
        MeteredHost { inner, metrics }
    }
}

#[async_trait]
impl<H: TransferHost> TransferHost for MeteredHost<H> {
    async fn transfer_data(
        &self,
        key: TransferKey,
        placeholder: &PlaceholderId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), HostError> {
        self.inner
            .transfer_data(key, placeholder, offset, data)
            .await?;
        self.metrics.record_bytes(data.len() as u64);
        Ok(())
    }

    fn report_progress(&self, key: TransferKey, total: u64, completed: u64) {
        self.inner.report_progress(key, total, completed);
    }

    fn complete(&self, key: TransferKey, status: CompletionStatus) {
        self.metrics.record_completion(status);
        self.inner.complete(key, status);
    }
}

/// Shared health state updated by the daemon
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub operator: opendal::Operator,
    /// Set while the sync root is connected
    pub connected: Arc<AtomicBool>,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9110")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    encode(&mut body, registry)?;
    Ok(body)
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.connected.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "sync root not connected");
    }
    match cmirror_storage::check_health(&state.operator).await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable"),
    }
}
