//! mlserve CLI - Main entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mlserve::compute::PredictionRequest;
use mlserve::config::ServeConfig;
use std::path::PathBuf;

/// mlserve - versioned model serving.
#[derive(Parser)]
#[command(name = "mlserve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "MLSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Model directory, overrides the configuration
    #[arg(short, long, env = "MLSERVE_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "MLSERVE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Load all stored models and run until interrupted
    Serve {
        /// Disable the Prometheus endpoint
        #[arg(long)]
        no_metrics: bool,
    },

    /// Run one prediction and print the response
    Predict {
        /// Features as JSON: one row `[1, 2]` or rows `[[1, 2], [3, 4]]`
        features: String,

        /// Model version (defaults to the configured default)
        #[arg(short = 'V', long)]
        model_version: Option<String>,
    },

    /// List stored versions and whether they load
    Versions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServeConfig::development(),
    };

    if let Some(model_dir) = cli.model_dir {
        config.storage.model_dir = model_dir;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    match cli.command {
        Commands::Serve { no_metrics } => {
            if no_metrics {
                config.observability.metrics_enabled = false;
            }
            mlserve::run(config).await?;
        }

        Commands::Predict {
            features,
            model_version,
        } => {
            config.observability.metrics_enabled = false;
            mlserve::observability::init(&config.observability)?;

            let features: serde_json::Value =
                serde_json::from_str(&features).context("features must be valid JSON")?;
            let version = model_version.unwrap_or_else(|| config.registry.default_version.clone());

            let service = mlserve::build_service(&config);
            service
                .registry()
                .load(&version)
                .await
                .with_context(|| format!("loading model version {}", version))?;

            let response = service
                .predict(PredictionRequest::new(features).with_version(&version))
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Versions => {
            config.observability.metrics_enabled = false;
            mlserve::observability::init(&config.observability)?;

            let service = mlserve::build_service(&config);
            service.registry().load_all().await?;
            println!("{}", serde_json::to_string_pretty(&service.list_versions().await)?);
        }
    }

    Ok(())
}
