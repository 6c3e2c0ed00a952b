//! Common test utilities for integration tests.

#![allow(dead_code)]

pub mod fixtures;

use mlserve::compute::{ArtifactFormat, ModelMonitor, ModelRegistry, PredictionService};
use mlserve::config::{MonitorConfig, RegistryConfig};
use mlserve::storage::LocalModelStorage;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

// Re-export common types
pub use fixtures::*;

/// Test environment owning a temporary model directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub model_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let model_dir = temp_dir.path().join("models");
        std::fs::create_dir_all(&model_dir).expect("Failed to create model dir");

        Self {
            temp_dir,
            model_dir,
        }
    }

    /// Writes `<model_dir>/<version>/model.<ext>` and `metadata.json`.
    pub fn write_model(&self, version: &str, format: ArtifactFormat, artifact: &Value, metadata: &Value) {
        let dir = self.model_dir.join(version);
        std::fs::create_dir_all(&dir).expect("Failed to create version dir");
        std::fs::write(
            dir.join(format!("model.{}", format.extension())),
            artifact.to_string(),
        )
        .expect("Failed to write artifact");
        std::fs::write(dir.join("metadata.json"), metadata.to_string())
            .expect("Failed to write metadata");
    }

    /// Writes raw artifact bytes under an arbitrary file name.
    pub fn write_raw(&self, version: &str, file_name: &str, bytes: &[u8]) {
        let dir = self.model_dir.join(version);
        std::fs::create_dir_all(&dir).expect("Failed to create version dir");
        std::fs::write(dir.join(file_name), bytes).expect("Failed to write file");
    }

    pub fn storage(&self) -> Arc<LocalModelStorage> {
        Arc::new(LocalModelStorage::new(&self.model_dir))
    }

    pub fn registry(&self) -> ModelRegistry {
        self.registry_with(MonitorConfig::default())
    }

    pub fn registry_with(&self, monitor: MonitorConfig) -> ModelRegistry {
        ModelRegistry::new(self.storage(), ModelMonitor::new(monitor))
    }

    pub fn service(&self, registry: ModelRegistry) -> PredictionService {
        PredictionService::new(Arc::new(registry), RegistryConfig::default())
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
