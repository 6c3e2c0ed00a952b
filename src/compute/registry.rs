// Model registry: owns loaded versions and runs the prediction pipeline

use super::loader::ArtifactLoader;
use super::model::{FeatureBatch, ModelEntry, ModelInfo, ModelMetadata, PredictionOutcome};
use super::monitor::{DriftReport, ModelMonitor, ModelStats};
use super::preprocess::FeaturePreprocessor;
use crate::error::{Result, ServeError};
use crate::observability;
use crate::storage::{ArtifactUpload, ModelStorage};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

/// Metadata known for a version, loaded or not.
#[derive(Debug, Clone)]
struct CatalogEntry {
    metadata: ModelMetadata,
    stale: bool,
}

/// Model registry
///
/// Mutations of a version (`load`, `unload`, `update`) are serialized by a
/// per-version lock, so different versions load independently. The model map
/// itself is only locked for lookups and swaps; inference runs on a shared
/// [`ModelEntry`] after the map lock is released.
pub struct ModelRegistry {
    /// Artifact and metadata source
    storage: Arc<dyn ModelStorage>,
    /// Format decoders and inference dispatch
    loader: Arc<ArtifactLoader>,
    /// Fitted scalers
    preprocessor: Arc<FeaturePreprocessor>,
    /// Prediction statistics
    monitor: Arc<ModelMonitor>,
    /// Loaded models by version
    models: Arc<RwLock<HashMap<String, Arc<ModelEntry>>>>,
    /// Known metadata by version; outlives unload
    catalog: Arc<RwLock<HashMap<String, CatalogEntry>>>,
    /// Per-version mutation locks
    version_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Statistics
    stats: Arc<RegistryStats>,
}

/// Registry statistics
#[derive(Default)]
pub struct RegistryStats {
    /// Successful loads
    pub loads: AtomicU64,
    /// Failed loads
    pub load_failures: AtomicU64,
    /// Versions removed by unload
    pub unloads: AtomicU64,
    /// Successful updates
    pub updates: AtomicU64,
}

/// Outcome of [`ModelRegistry::load_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
}

/// Stats for one version, with its load state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatsReport {
    pub version: String,
    pub stats: ModelStats,
    pub loaded: bool,
}

impl ModelRegistry {
    /// Creates a registry with the built-in decoders.
    pub fn new(storage: Arc<dyn ModelStorage>, monitor: ModelMonitor) -> Self {
        Self {
            storage,
            loader: Arc::new(ArtifactLoader::default()),
            preprocessor: Arc::new(FeaturePreprocessor::new()),
            monitor: Arc::new(monitor),
            models: Arc::new(RwLock::new(HashMap::new())),
            catalog: Arc::new(RwLock::new(HashMap::new())),
            version_locks: parking_lot::Mutex::new(HashMap::new()),
            stats: Arc::new(RegistryStats::default()),
        }
    }

    /// Replaces the artifact loader.
    pub fn with_loader(mut self, loader: ArtifactLoader) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn monitor(&self) -> &Arc<ModelMonitor> {
        &self.monitor
    }

    pub fn preprocessor(&self) -> &Arc<FeaturePreprocessor> {
        &self.preprocessor
    }

    fn version_lock(&self, version: &str) -> Arc<Mutex<()>> {
        let mut locks = self.version_locks.lock();
        Arc::clone(locks.entry(version.to_string()).or_default())
    }

    /// Drops the lock entry of a version that is neither loaded nor in the
    /// catalog, unless another caller still holds it.
    async fn release_version_lock(&self, version: &str, lock: Arc<Mutex<()>>) {
        let known = self.models.read().await.contains_key(version)
            || self.catalog.read().await.contains_key(version);
        drop(lock);
        if known {
            return;
        }

        let mut locks = self.version_locks.lock();
        if locks
            .get(version)
            .map_or(false, |l| Arc::strong_count(l) == 1)
        {
            locks.remove(version);
        }
    }

    #[cfg(test)]
    fn version_lock_count(&self) -> usize {
        self.version_locks.lock().len()
    }

    /// Loads a version from storage, replacing any loaded entry.
    ///
    /// On failure the previous entry, if any, stays installed.
    pub async fn load(&self, version: &str) -> Result<()> {
        let lock = self.version_lock(version);
        let result = {
            let _guard = lock.lock().await;
            self.load_locked(version).await
        };
        if result.is_err() {
            self.release_version_lock(version, lock).await;
        }
        result
    }

    async fn load_locked(&self, version: &str) -> Result<()> {
        match self.materialize(version).await {
            Ok(entry) => {
                let format = entry.format;
                let capability = entry.artifact.capability();
                let metadata = entry.metadata.clone();

                let loaded = {
                    let mut models = self.models.write().await;
                    models.insert(version.to_string(), Arc::new(entry));
                    models.len()
                };
                self.catalog.write().await.insert(
                    version.to_string(),
                    CatalogEntry {
                        metadata,
                        stale: false,
                    },
                );

                self.stats.loads.fetch_add(1, Ordering::Relaxed);
                observability::record_model_load(version, true);
                observability::set_models_loaded(loaded);
                info!(version, %format, ?capability, "Loaded model");
                Ok(())
            }
            Err(e) => {
                self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                observability::record_model_load(version, false);
                error!(version, error = %e, "Failed to load model");
                self.remember_metadata(version).await;
                Err(e)
            }
        }
    }

    async fn materialize(&self, version: &str) -> Result<ModelEntry> {
        let artifact_path = self.storage.artifact_path(version).await?;
        let metadata = self.load_metadata(version).await;
        let (artifact, format) = self.loader.load(&artifact_path).await?;

        Ok(ModelEntry {
            version: version.to_string(),
            artifact,
            format,
            metadata,
            loaded_at: Utc::now(),
        })
    }

    /// Reads a version's metadata. A missing or unreadable document leaves
    /// the model with default metadata and identity preprocessing.
    async fn load_metadata(&self, version: &str) -> ModelMetadata {
        let metadata = match self.storage.metadata_path(version).await {
            Ok(path) => read_metadata(&path, version).await,
            Err(e) => Err(e),
        };
        metadata.unwrap_or_else(|e| {
            error!(version, error = %e, "Failed to load model metadata, using defaults");
            ModelMetadata::default()
        })
    }

    /// Makes a version whose artifact failed to load visible in listings.
    async fn remember_metadata(&self, version: &str) {
        if self.catalog.read().await.contains_key(version) {
            return;
        }
        let Ok(path) = self.storage.metadata_path(version).await else {
            return;
        };
        if let Ok(metadata) = read_metadata(&path, version).await {
            self.catalog
                .write()
                .await
                .entry(version.to_string())
                .or_insert(CatalogEntry {
                    metadata,
                    stale: false,
                });
        }
    }

    /// Loads every version in storage. Failures are logged and skipped.
    pub async fn load_all(&self) -> Result<LoadSummary> {
        let versions = self.storage.list_versions().await?;
        let mut summary = LoadSummary::default();

        for version in versions {
            match self.load(&version).await {
                Ok(()) => summary.loaded.push(version),
                Err(e) => {
                    error!(version = %version, error = %e, "Skipping model version at startup");
                    summary.failed.push(version);
                }
            }
        }

        info!(
            loaded = summary.loaded.len(),
            failed = summary.failed.len(),
            "Finished loading models"
        );
        Ok(summary)
    }

    /// Removes a loaded version. Returns whether it was loaded.
    ///
    /// Metadata and monitoring history are kept.
    pub async fn unload(&self, version: &str) -> bool {
        let lock = self.version_lock(version);
        let (removed, loaded) = {
            let _guard = lock.lock().await;
            let mut models = self.models.write().await;
            let removed = models.remove(version).is_some();
            (removed, models.len())
        };

        if removed {
            self.stats.unloads.fetch_add(1, Ordering::Relaxed);
            observability::set_models_loaded(loaded);
            info!(version, "Unloaded model");
        }
        self.release_version_lock(version, lock).await;
        removed
    }

    /// Saves a new artifact and metadata, then reloads the version.
    ///
    /// If the save fails nothing changes. If the reload fails the previous
    /// in-memory entry keeps serving, the version is marked stale and the
    /// error is returned: storage then holds the new artifact while memory
    /// holds the old one.
    pub async fn update(
        &self,
        version: &str,
        artifact: ArtifactUpload,
        metadata: ModelMetadata,
    ) -> Result<()> {
        let lock = self.version_lock(version);
        let result = {
            let _guard = lock.lock().await;
            self.save_and_reload(version, &artifact, &metadata).await
        };
        if result.is_err() {
            self.release_version_lock(version, lock).await;
        }
        result
    }

    async fn save_and_reload(
        &self,
        version: &str,
        artifact: &ArtifactUpload,
        metadata: &ModelMetadata,
    ) -> Result<()> {
        if let Err(e) = self.storage.save_model(version, artifact, metadata).await {
            error!(version, error = %e, "Failed to save model update");
            return Err(e);
        }

        match self.load_locked(version).await {
            Ok(()) => {
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
                info!(version, format = %artifact.format, "Updated model");
                Ok(())
            }
            Err(e) => {
                if self.models.read().await.contains_key(version) {
                    if let Some(entry) = self.catalog.write().await.get_mut(version) {
                        entry.stale = true;
                    }
                }
                error!(
                    version,
                    error = %e,
                    "Model update saved but reload failed, previous model still serving"
                );
                Err(e)
            }
        }
    }

    /// Runs preprocessing and inference for `version`.
    ///
    /// The outcome is recorded by the monitor either way. Failures after
    /// lookup are returned as [`ServeError::PredictionFailure`].
    pub async fn predict(
        &self,
        version: &str,
        features: &FeatureBatch,
        request_id: &str,
    ) -> Result<PredictionOutcome> {
        let entry = self
            .models
            .read()
            .await
            .get(version)
            .cloned()
            .ok_or_else(|| ServeError::ModelNotLoaded(version.to_string()))?;

        let preprocessor = Arc::clone(&self.preprocessor);
        let loader = Arc::clone(&self.loader);
        let model = Arc::clone(&entry);
        let input = features.clone();

        let result = tokio::task::spawn_blocking(move || {
            let processed = preprocessor.process(&input, &model.metadata.preprocessing);
            let start = Instant::now();
            let predictions = loader.predict(&model.artifact, &processed)?;
            Ok::<_, ServeError>((predictions, start.elapsed().as_secs_f64()))
        })
        .await
        .unwrap_or_else(|e| Err(ServeError::from(e)));

        match result {
            Ok((predictions, inference_time)) => {
                self.monitor.record_prediction(
                    version,
                    features,
                    &predictions,
                    inference_time,
                    request_id,
                );
                Ok(PredictionOutcome {
                    predictions,
                    version: version.to_string(),
                    inference_time,
                    metadata: entry.metadata.clone(),
                })
            }
            Err(e) => {
                self.monitor.record_error(version, &e);
                error!(version, request_id, error = %e, "Prediction failed");
                Err(ServeError::prediction_failure(version, e))
            }
        }
    }

    /// Fits the scaler configured for a loaded version on `data`.
    pub async fn fit_preprocessor(&self, version: &str, data: &FeatureBatch) -> Result<()> {
        let entry = self
            .models
            .read()
            .await
            .get(version)
            .cloned()
            .ok_or_else(|| ServeError::ModelNotLoaded(version.to_string()))?;
        self.preprocessor
            .fit_preprocessor(data, &entry.metadata.preprocessing)
    }

    /// Drops a fitted scaler so the next batch refits it.
    pub fn reset_scaler(&self, key: &str) -> bool {
        self.preprocessor.reset_scaler(key)
    }

    /// Info for a known version.
    pub async fn get_model_info(&self, version: &str) -> Option<ModelInfo> {
        let models = self.models.read().await;
        let catalog = self.catalog.read().await;
        model_info(version, models.get(version), catalog.get(version))
    }

    /// Every known version, sorted, including unloaded ones.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let models = self.models.read().await;
        let catalog = self.catalog.read().await;

        let mut versions: Vec<&String> = catalog.keys().chain(models.keys()).collect();
        versions.sort();
        versions.dedup();

        versions
            .into_iter()
            .filter_map(|v| model_info(v, models.get(v), catalog.get(v)))
            .collect()
    }

    /// Whether a version is loaded.
    pub async fn is_loaded(&self, version: &str) -> bool {
        self.models.read().await.contains_key(version)
    }

    /// Loaded versions, sorted.
    pub async fn loaded_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.models.read().await.keys().cloned().collect();
        versions.sort();
        versions
    }

    /// Monitoring statistics. Unknown versions report zeros.
    pub async fn get_model_stats(&self, version: &str) -> ModelStatsReport {
        ModelStatsReport {
            version: version.to_string(),
            stats: self.monitor.get_model_stats(version),
            loaded: self.is_loaded(version).await,
        }
    }

    /// Drift check over the last `window_size` predictions of a version.
    pub fn check_data_drift(&self, version: &str, window_size: usize) -> DriftReport {
        self.monitor.check_data_drift(version, window_size)
    }

    /// Gets statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            loads: self.stats.loads.load(Ordering::Relaxed),
            load_failures: self.stats.load_failures.load(Ordering::Relaxed),
            unloads: self.stats.unloads.load(Ordering::Relaxed),
            updates: self.stats.updates.load(Ordering::Relaxed),
        }
    }
}

fn model_info(
    version: &str,
    entry: Option<&Arc<ModelEntry>>,
    known: Option<&CatalogEntry>,
) -> Option<ModelInfo> {
    let metadata = match (entry, known) {
        (_, Some(known)) => known.metadata.clone(),
        (Some(entry), None) => entry.metadata.clone(),
        (None, None) => return None,
    };

    Some(ModelInfo {
        version: version.to_string(),
        metadata,
        loaded: entry.is_some(),
        loaded_at: entry.map(|e| e.loaded_at),
        stale: known.map_or(false, |k| k.stale),
    })
}

async fn read_metadata(path: &Path, version: &str) -> Result<ModelMetadata> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ServeError::load_failure(version, format!("cannot read metadata: {}", e)))?;
    ModelMetadata::from_slice(&bytes)
        .map_err(|e| ServeError::load_failure(version, format!("invalid metadata: {}", e)))
}

/// Statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatsSnapshot {
    pub loads: u64,
    pub load_failures: u64,
    pub unloads: u64,
    pub updates: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ArtifactFormat;
    use crate::config::MonitorConfig;
    use crate::storage::LocalModelStorage;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_version(root: &Path, version: &str, artifact: serde_json::Value) {
        let dir = root.join(version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.pkl"), artifact.to_string()).unwrap();
        std::fs::write(dir.join("metadata.json"), json!({"owner": "tests"}).to_string()).unwrap();
    }

    fn linear(weight: f64) -> serde_json::Value {
        json!({"kind": "linear", "weights": [[weight, weight]], "bias": [0.0]})
    }

    fn registry(root: &Path) -> ModelRegistry {
        ModelRegistry::new(
            Arc::new(LocalModelStorage::new(root)),
            ModelMonitor::new(MonitorConfig::default()),
        )
    }

    fn features() -> FeatureBatch {
        FeatureBatch::from_rows(vec![vec![1.0, 2.0]]).unwrap()
    }

    #[tokio::test]
    async fn test_predict_unknown_version() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path());

        let err = registry.predict("v2", &features(), "r1").await.unwrap_err();
        assert!(matches!(err, ServeError::ModelNotLoaded(_)));
        assert_eq!(registry.get_model_stats("v2").await.stats.total_predictions, 0);
    }

    #[tokio::test]
    async fn test_load_and_predict() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());

        registry.load("v1").await.unwrap();
        let outcome = registry.predict("v1", &features(), "r1").await.unwrap();

        assert_eq!(outcome.version, "v1");
        assert_eq!(outcome.predictions.len(), 1);
        assert_eq!(outcome.predictions[0].values(), &[3.0]);
        assert!(outcome.inference_time >= 0.0);
        assert_eq!(outcome.metadata.get("owner"), Some(&json!("tests")));
        assert_eq!(registry.get_model_stats("v1").await.stats.total_predictions, 1);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_entry() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());
        registry.load("v1").await.unwrap();

        std::fs::write(dir.path().join("v1").join("model.pkl"), b"not json").unwrap();
        let err = registry.load("v1").await.unwrap_err();
        assert!(matches!(err, ServeError::LoadFailure { .. }));

        let outcome = registry.predict("v1", &features(), "r1").await.unwrap();
        assert_eq!(outcome.predictions[0].values(), &[3.0]);
        assert_eq!(registry.stats().load_failures, 1);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());
        registry.load("v1").await.unwrap();

        assert!(registry.unload("v1").await);
        assert!(!registry.unload("v1").await);
        assert!(!registry.unload("never").await);

        let info = registry.get_model_info("v1").await.unwrap();
        assert!(!info.loaded);
        assert!(info.loaded_at.is_none());
        assert_eq!(registry.stats().unloads, 1);
    }

    #[tokio::test]
    async fn test_unknown_versions_do_not_keep_locks() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());

        for i in 0..20 {
            assert!(!registry.unload(&format!("never-{}", i)).await);
            assert!(registry.load(&format!("missing-{}", i)).await.is_err());
        }
        assert_eq!(registry.version_lock_count(), 0);

        registry.load("v1").await.unwrap();
        assert_eq!(registry.version_lock_count(), 1);

        // Unloaded but still cataloged
        assert!(registry.unload("v1").await);
        assert_eq!(registry.version_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_model() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());
        registry.load("v1").await.unwrap();

        registry
            .update(
                "v1",
                ArtifactUpload::new(ArtifactFormat::Joblib, linear(2.0).to_string()),
                ModelMetadata::default().with_field("owner", "update"),
            )
            .await
            .unwrap();

        let outcome = registry.predict("v1", &features(), "r1").await.unwrap();
        assert_eq!(outcome.predictions[0].values(), &[6.0]);
        assert_eq!(outcome.metadata.get("owner"), Some(&json!("update")));
        assert_eq!(registry.stats().updates, 1);
    }

    #[tokio::test]
    async fn test_update_with_bad_artifact_marks_stale() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());
        registry.load("v1").await.unwrap();

        let result = registry
            .update(
                "v1",
                ArtifactUpload::new(ArtifactFormat::Pickle, b"garbage".to_vec()),
                ModelMetadata::default(),
            )
            .await;
        assert!(result.is_err());

        let info = registry.get_model_info("v1").await.unwrap();
        assert!(info.loaded);
        assert!(info.stale);
        let outcome = registry.predict("v1", &features(), "r1").await.unwrap();
        assert_eq!(outcome.predictions[0].values(), &[3.0]);
    }

    #[tokio::test]
    async fn test_load_without_metadata_uses_defaults() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        std::fs::remove_file(dir.path().join("v1").join("metadata.json")).unwrap();
        let registry = registry(dir.path());

        registry.load("v1").await.unwrap();

        let info = registry.get_model_info("v1").await.unwrap();
        assert!(info.loaded);
        assert_eq!(info.metadata, ModelMetadata::default());
        let batch = FeatureBatch::from_rows(vec![vec![1.0, 2.0]]).unwrap();
        registry.predict("v1", &batch, "r1").await.unwrap();
    }

    #[tokio::test]
    async fn test_inference_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        write_version(dir.path(), "v1", linear(1.0));
        let registry = registry(dir.path());
        registry.load("v1").await.unwrap();

        let wide = FeatureBatch::from_rows(vec![vec![1.0, 2.0, 3.0]]).unwrap();
        let err = registry.predict("v1", &wide, "r1").await.unwrap_err();
        assert!(matches!(err, ServeError::PredictionFailure { .. }));

        let stats = registry.get_model_stats("v1").await.stats;
        assert_eq!(stats.failed_predictions, 1);
        assert_eq!(stats.successful_predictions, 0);
        assert_eq!(stats.total_predictions, 0);

        let narrow = FeatureBatch::from_rows(vec![vec![1.0, 2.0]]).unwrap();
        registry.predict("v1", &narrow, "r2").await.unwrap();
        let stats = registry.get_model_stats("v1").await.stats;
        assert_eq!(stats.total_predictions, 1);
        assert_eq!(stats.failed_predictions, 1);
    }
}
