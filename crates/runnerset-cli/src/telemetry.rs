//! Logging and metrics initialization.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::{LoggingConfig, TelemetryConfig};

/// Buckets for the runner startup-duration histogram, in seconds.
const STARTUP_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Initializes the global tracing subscriber from the logging config.
/// `RUST_LOG` still wins when set, so operators can drill into a single
/// module without editing config.
pub fn init_logging(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = cfg.level.to_lowercase();
        let directives = ["runnerset", "runnerset_engine", "runnerset_github", "runnerset_scaler"]
            .map(|target| format!("{target}={level}"))
            .join(",");
        tracing_subscriber::EnvFilter::new(directives)
    });

    let fmt_layer = match cfg.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .with_target(false)
            .json()
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Installs the Prometheus recorder and returns a render handle for the
/// scrape endpoint. Instruments are best-effort: a failed install is
/// logged, never fatal, and the process runs without metrics.
pub fn install_recorder() -> Option<PrometheusHandle> {
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(runnerset_scaler::METRIC_STARTUP_DURATION.to_string()),
        STARTUP_DURATION_BUCKETS,
    );

    let builder = match builder {
        Ok(builder) => builder,
        Err(e) => {
            tracing::warn!(error = %e, "failed to configure metrics recorder");
            return None;
        }
    };

    match builder.install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install metrics recorder");
            None
        }
    }
}

/// The OTLP push pipeline is owned by the collector deployment, not this
/// binary; the configured endpoint is surfaced in the logs so operators
/// can confirm what their environment points at.
pub fn log_telemetry_target(cfg: &TelemetryConfig) {
    if !cfg.enabled {
        return;
    }
    let endpoint = if cfg.endpoint.is_empty() {
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "unset".to_string())
    } else {
        cfg.endpoint.clone()
    };
    tracing::info!(endpoint = %endpoint, insecure = cfg.insecure, "otlp push configured");
}
