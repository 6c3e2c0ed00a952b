//! mlserve - versioned model serving with per-version preprocessing and monitoring.
//!
//! mlserve loads model artifacts from a model directory, routes prediction
//! requests to the requested version, applies that version's feature
//! preprocessing and keeps bounded, time-windowed statistics per version.
//!
//! # Features
//!
//! - **Model Registry**: load, unload and hot-update versions; at most one live
//!   model per version, mutations serialized per version.
//! - **Artifact Loader**: format detection by extension and pluggable decoders
//!   producing direct-predict or tensor-forward models.
//! - **Feature Preprocessor**: standard and min-max scaling with shared fitted
//!   scalers, batch-local mean imputation.
//! - **Monitor**: bounded prediction and error history, sliding-window
//!   throughput, pluggable drift detection and Prometheus metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Transport (external) → PredictionService                │
//! ├──────────────────────────────────────────────────────────┤
//! │  ModelRegistry: version map | per-version locks          │
//! ├───────────────┬───────────────────┬──────────────────────┤
//! │ ArtifactLoader│ FeaturePreprocessor│ ModelMonitor → sink │
//! ├───────────────┴───────────────────┴──────────────────────┤
//! │  ModelStorage: <model_dir>/<version>/model.* + metadata  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use mlserve::compute::{FeatureBatch, ModelMonitor, ModelRegistry};
//! use mlserve::config::ServeConfig;
//! use mlserve::storage::LocalModelStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mlserve::Result<()> {
//!     let config = ServeConfig::development();
//!     let registry = ModelRegistry::new(
//!         Arc::new(LocalModelStorage::new(&config.storage.model_dir)),
//!         ModelMonitor::new(config.monitor.clone()),
//!     );
//!
//!     registry.load("v1").await?;
//!     let features = FeatureBatch::from_rows(vec![vec![1.0, 2.0, 3.0]])?;
//!     let outcome = registry.predict("v1", &features, "request-1").await?;
//!     println!("{:?}", outcome.predictions);
//!     Ok(())
//! }
//! ```

pub mod compute;
pub mod config;
pub mod error;
pub mod observability;
pub mod shutdown;
pub mod storage;

// Re-exports
pub use error::{Result, ServeError};

use compute::{ModelMonitor, ModelRegistry, PredictionService};
use config::ServeConfig;
use observability::PrometheusSink;
use shutdown::{ShutdownCoordinator, SignalHandler};
use std::sync::Arc;
use storage::LocalModelStorage;
use tracing::{error, info, warn};

/// Builds a registry over the configured model directory. The monitor pushes
/// to Prometheus when metrics are enabled.
pub fn build_registry(config: &ServeConfig) -> ModelRegistry {
    let mut monitor = ModelMonitor::new(config.monitor.clone());
    if config.observability.metrics_enabled {
        monitor = monitor.with_sink(Arc::new(PrometheusSink));
    }

    ModelRegistry::new(
        Arc::new(LocalModelStorage::new(&config.storage.model_dir)),
        monitor,
    )
}

/// Builds the prediction service with a fresh registry.
pub fn build_service(config: &ServeConfig) -> PredictionService {
    PredictionService::new(Arc::new(build_registry(config)), config.registry.clone())
}

/// Run the mlserve process with the given configuration.
///
/// Loads every stored version, serves metrics if enabled and returns after a
/// shutdown signal. The returned service is dropped on shutdown; transports
/// embedding mlserve use [`build_service`] directly.
pub async fn run(config: ServeConfig) -> Result<()> {
    observability::init(&config.observability)?;
    config.validate()?;

    info!(
        name = %config.server.name,
        environment = %config.server.environment,
        model_dir = %config.storage.model_dir.display(),
        "Starting mlserve"
    );

    let coordinator = ShutdownCoordinator::new();
    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        SignalHandler::new(signal_coordinator).run().await;
    });

    let metrics = if config.observability.metrics_enabled {
        info!("Starting metrics server on {}", config.observability.metrics_addr);
        let obs_config = config.observability.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let service = build_service(&config);
    let startup = tokio::time::timeout(config.registry.load_timeout, service.registry().load_all());

    match coordinator.run_until_shutdown(startup).await {
        Some(Ok(Ok(summary))) => {
            info!(loaded = ?summary.loaded, failed = ?summary.failed, "Registry ready");
        }
        Some(Ok(Err(e))) => {
            error!(error = %e, "Failed to list stored models, starting empty");
        }
        Some(Err(_)) => {
            warn!(
                timeout = ?config.registry.load_timeout,
                loaded = ?service.registry().loaded_versions().await,
                "Startup model load timed out, serving the versions loaded so far"
            );
        }
        None => {}
    }

    coordinator.wait_for_shutdown().await;
    info!("Shutting down mlserve gracefully...");

    if let Some(handle) = metrics {
        if !handle.is_finished() {
            handle.abort();
        }
    }

    info!(stats = ?service.stats(), "mlserve shutdown complete");
    Ok(())
}
