// Prediction service: request validation and response shaping over the registry

use super::model::{FeatureBatch, ModelInfo, ModelMetadata, Prediction};
use super::monitor::DriftReport;
use super::registry::{ModelRegistry, ModelStatsReport};
use crate::config::RegistryConfig;
use crate::error::{ErrorKind, Result, ServeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Predict request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// One row of numbers, or a list of rows. `null` marks a missing value.
    pub features: Value,
    /// Version to use; the configured default when absent
    #[serde(default)]
    pub model_version: Option<String>,
}

impl PredictionRequest {
    pub fn new(features: Value) -> Self {
        Self {
            features,
            model_version: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.model_version = Some(version.to_string());
        self
    }
}

/// Predict response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub request_id: String,
    pub predictions: Vec<Prediction>,
    pub model_version: String,
    /// Seconds
    pub inference_time: f64,
    pub metadata: ModelMetadata,
}

/// Outcome of one item of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub success: bool,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PredictionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Batch predict response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionResponse {
    pub batch_id: String,
    pub results: Vec<BatchItemResult>,
    pub total_requests: usize,
    pub successful_requests: usize,
}

/// Service statistics
#[derive(Default)]
struct ServiceStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Requests that failed validation
    pub rejected_requests: u64,
}

/// Entry point for the transport layer.
pub struct PredictionService {
    registry: Arc<ModelRegistry>,
    config: RegistryConfig,
    stats: ServiceStats,
}

impl PredictionService {
    pub fn new(registry: Arc<ModelRegistry>, config: RegistryConfig) -> Self {
        Self {
            registry,
            config,
            stats: ServiceStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Predicts under a fresh request id.
    pub async fn predict(&self, request: PredictionRequest) -> Result<PredictionResponse> {
        self.predict_with_id(request, Uuid::new_v4().to_string()).await
    }

    async fn predict_with_id(
        &self,
        request: PredictionRequest,
        request_id: String,
    ) -> Result<PredictionResponse> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let features = match self.validate_features(&request.features) {
            Ok(features) => features,
            Err(e) => {
                self.stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request_id, error = %e, "Rejected prediction request");
                return Err(e);
            }
        };

        let version = request
            .model_version
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.config.default_version.clone());

        match self.registry.predict(&version, &features, &request_id).await {
            Ok(outcome) => {
                self.stats.successful_requests.fetch_add(1, Ordering::Relaxed);
                Ok(PredictionResponse {
                    request_id,
                    predictions: outcome.predictions,
                    model_version: outcome.version,
                    inference_time: outcome.inference_time,
                    metadata: outcome.metadata,
                })
            }
            Err(e) => {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn validate_features(&self, features: &Value) -> Result<FeatureBatch> {
        let batch = FeatureBatch::from_json(features)?;
        if batch.len() > self.config.max_batch_size {
            return Err(ServeError::Validation(format!(
                "batch of {} rows exceeds the maximum of {}",
                batch.len(),
                self.config.max_batch_size
            )));
        }
        Ok(batch)
    }

    /// Runs each request independently. Item failures are reported per item;
    /// only an empty or oversized batch fails as a whole.
    pub async fn batch_predict(
        &self,
        requests: Vec<PredictionRequest>,
    ) -> Result<BatchPredictionResponse> {
        if requests.is_empty() {
            return Err(ServeError::Validation("batch requests cannot be empty".to_string()));
        }
        if requests.len() > self.config.max_batch_size {
            return Err(ServeError::Validation(format!(
                "batch of {} requests exceeds the maximum of {}",
                requests.len(),
                self.config.max_batch_size
            )));
        }

        let batch_id = Uuid::new_v4().to_string();
        let total_requests = requests.len();
        let mut results = Vec::with_capacity(total_requests);

        for (i, request) in requests.into_iter().enumerate() {
            let request_id = format!("{}_{}", batch_id, i);
            let result = match self.predict_with_id(request, request_id.clone()).await {
                Ok(data) => BatchItemResult {
                    success: true,
                    request_id,
                    data: Some(data),
                    error: None,
                    error_kind: None,
                },
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Batch item failed");
                    BatchItemResult {
                        success: false,
                        request_id,
                        data: None,
                        error_kind: Some(e.root_cause().kind()),
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let successful_requests = results.iter().filter(|r| r.success).count();
        Ok(BatchPredictionResponse {
            batch_id,
            results,
            total_requests,
            successful_requests,
        })
    }

    /// Monitoring statistics for a version.
    pub async fn model_stats(&self, version: &str) -> ModelStatsReport {
        self.registry.get_model_stats(version).await
    }

    /// Drift check; `window` defaults to the configured drift window.
    pub fn check_drift(&self, version: &str, window: Option<usize>) -> DriftReport {
        let window = window.unwrap_or(self.registry.monitor().config().drift_window);
        self.registry.check_data_drift(version, window)
    }

    /// Every known version.
    pub async fn list_versions(&self) -> Vec<ModelInfo> {
        self.registry.list_models().await
    }

    pub fn stats(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            successful_requests: self.stats.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.stats.rejected_requests.load(Ordering::Relaxed),
        }
    }
}
