//! Metrics & health endpoints (SPEC_FULL §4.15, spec §6): a Prometheus
//! registry exposed over `axum`, with the metrics surface on its own
//! bind address separate from the `/healthz`/`/readyz` probes — the
//! same split `--metrics-bind-address` / `--health-probe-bind-address`
//! draws in the CLI.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

pub struct Metrics {
    registry: Registry,
    pub reconciliation_duration_seconds: HistogramVec,
    pub reconcile_errors_total: IntCounterVec,
    pub update_instructions_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let reconciliation_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("navecd_reconciliation_duration_seconds", "Duration of a full project reconcile pass, in seconds"),
            &["project", "url"],
        )
        .expect("static histogram definition is always valid");
        let reconcile_errors_total = IntCounterVec::new(
            prometheus::Opts::new("navecd_reconcile_errors_total", "Reconcile passes that ended in an error, by reason"),
            &["project", "reason"],
        )
        .expect("static counter definition is always valid");
        let update_instructions_total = IntCounterVec::new(
            prometheus::Opts::new("navecd_update_instructions_total", "Update instructions discovered by the version scanner"),
            &["project"],
        )
        .expect("static counter definition is always valid");

        registry.register(Box::new(reconciliation_duration_seconds.clone())).expect("first registration of a fresh registry never fails");
        registry.register(Box::new(reconcile_errors_total.clone())).expect("first registration of a fresh registry never fails");
        registry.register(Box::new(update_instructions_total.clone())).expect("first registration of a fresh registry never fails");

        Metrics { registry, reconciliation_duration_seconds, reconcile_errors_total, update_instructions_total }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let families = metrics.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        warn!(%err, "failed to encode metrics");
    }
    ([(CONTENT_TYPE, encoder.format_type().to_string())], buffer)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz() -> &'static str {
    "ok"
}

pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(metrics)
}

pub fn health_router() -> Router {
    Router::new().route("/healthz", get(healthz)).route("/readyz", get(readyz))
}

pub async fn serve_metrics(bind_address: &str, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, metrics_router(metrics)).await
}

pub async fn serve_health(bind_address: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, health_router()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_gathers_all_three_families() {
        let metrics = Metrics::new();
        metrics.reconciliation_duration_seconds.with_label_values(&["demo", "https://example.com/repo.git"]).observe(1.5);
        metrics.reconcile_errors_total.with_label_values(&["demo", "FetchFailed"]).inc();
        metrics.update_instructions_total.with_label_values(&["demo"]).inc_by(3);

        let families = metrics.registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"navecd_reconciliation_duration_seconds".to_string()));
        assert!(names.contains(&"navecd_reconcile_errors_total".to_string()));
        assert!(names.contains(&"navecd_update_instructions_total".to_string()));
    }
}
