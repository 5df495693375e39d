//! Scrape endpoint: `/metrics` for Prometheus plus `/healthz` liveness.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::buildinfo;

#[derive(Clone)]
struct AppState {
    engine: &'static str,
    metrics: Option<PrometheusHandle>,
}

/// Health check payload: build info plus the enabled compute engine. The
/// status is always "healthy": this is a liveness probe with no external
/// dependencies to verify.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_name: &'static str,
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    rust_version: &'static str,
    engine: &'static str,
    os: &'static str,
    architecture: &'static str,
    timestamp: DateTime<Utc>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service_name: "runnerset",
        version: buildinfo::VERSION,
        commit: buildinfo::COMMIT,
        build_time: buildinfo::BUILD_TIME,
        rust_version: buildinfo::RUSTC_VERSION,
        engine: state.engine,
        os: std::env::consts::OS,
        architecture: std::env::consts::ARCH,
        timestamp: Utc::now(),
    })
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}

/// Serves the endpoint until the token fires. Bind or serve failures are
/// logged, not fatal: losing the scrape surface must not take down the
/// scaler.
pub async fn serve(
    port: u16,
    engine: &'static str,
    metrics: Option<PrometheusHandle>,
    cancel: CancellationToken,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "failed to bind metrics endpoint");
            return;
        }
    };

    tracing::info!(%addr, "serving /metrics and /healthz");

    let app = router(AppState { engine, metrics });
    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::warn!(error = %e, "metrics endpoint terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_payload_shape() {
        let response = HealthResponse {
            status: "healthy",
            service_name: "runnerset",
            version: buildinfo::VERSION,
            commit: buildinfo::COMMIT,
            build_time: buildinfo::BUILD_TIME,
            rust_version: buildinfo::RUSTC_VERSION,
            engine: "docker",
            os: std::env::consts::OS,
            architecture: std::env::consts::ARCH,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["engine"], "docker");
        assert_eq!(json["version"], buildinfo::VERSION);
        assert!(json["commit"].is_string());
        assert!(json["build_time"].is_string());
        assert!(json["timestamp"].is_string());
    }
}
