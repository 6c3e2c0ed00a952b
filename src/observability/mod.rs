//! Observability for mlserve.
//!
//! Provides logging setup, the Prometheus exporter and the metrics sink the
//! monitor pushes prediction outcomes into.

use crate::config::ObservabilityConfig;
use crate::error::{ErrorKind, Result, ServeError};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ServeError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ServeError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServeError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move {
            handle.render()
        }))
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| ServeError::Internal(format!("Metrics server failed: {}", e)))?;

    Ok(())
}

/// Load counters are labeled per version and appear on the first attempt.
fn register_metrics() {
    gauge!("models_loaded").set(0.0);
}

/// Record a load attempt.
pub fn record_model_load(version: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "model_loads_total",
        "model_version" => version.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Update the number of loaded models.
pub fn set_models_loaded(count: usize) {
    gauge!("models_loaded").set(count as f64);
}

/// Receives prediction outcomes from the monitor.
///
/// Optional: a monitor without a sink only keeps its in-memory statistics.
pub trait MetricsSink: Send + Sync {
    fn record_success(&self, version: &str, latency_secs: f64);

    fn record_error(&self, version: &str, kind: ErrorKind);

    fn set_throughput(&self, version: &str, per_sec: f64);
}

/// Publishes prediction metrics through the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record_success(&self, version: &str, latency_secs: f64) {
        counter!(
            "model_predictions_total",
            "model_version" => version.to_string(),
            "status" => "success"
        )
        .increment(1);
        histogram!(
            "model_prediction_latency_seconds",
            "model_version" => version.to_string()
        )
        .record(latency_secs);
    }

    fn record_error(&self, version: &str, kind: ErrorKind) {
        counter!(
            "model_predictions_total",
            "model_version" => version.to_string(),
            "status" => "error"
        )
        .increment(1);
        counter!(
            "model_prediction_errors_total",
            "model_version" => version.to_string(),
            "error_type" => kind.as_str()
        )
        .increment(1);
    }

    fn set_throughput(&self, version: &str, per_sec: f64) {
        gauge!(
            "model_throughput_predictions_per_second",
            "model_version" => version.to_string()
        )
        .set(per_sec);
    }
}
