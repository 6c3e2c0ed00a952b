//! Model serving for mlserve
//!
//! Provides the versioned model registry and its prediction pipeline:
//! - Artifact loading with pluggable per-format decoders
//! - Per-version feature preprocessing with shared fitted scalers
//! - Bounded per-version monitoring: history, throughput and drift
//! - The registry orchestrating load/unload/update and predict
//! - A prediction service shaping requests and responses for transports

pub mod estimators;
pub mod loader;
pub mod model;
pub mod monitor;
pub mod preprocess;
pub mod registry;
pub mod serving;

pub use estimators::{
    Activation, DenseLayer, DenseNetwork, EstimatorDecoder, EstimatorSpec, LinearModel, Link,
    NetworkDecoder,
};
pub use loader::{
    Artifact, ArtifactDecoder, ArtifactFormat, ArtifactLoader, Capability, ForwardModule,
    Predictor, Tensor,
};
pub use model::{
    Encoding, FeatureBatch, Imputation, ModelEntry, ModelInfo, ModelMetadata, Normalization,
    Prediction, PredictionOutcome, PreprocessingConfig,
};
pub use monitor::{
    BoundedHistory, CoefficientOfVariationDetector, DriftDetector, DriftReport, ErrorRecord,
    ModelMonitor, ModelStats, PredictionRecord, ThroughputWindow,
};
pub use preprocess::{FeaturePreprocessor, FittedScaler};
pub use registry::{LoadSummary, ModelRegistry, ModelStatsReport, RegistryStatsSnapshot};
pub use serving::{
    BatchItemResult, BatchPredictionResponse, PredictionRequest, PredictionResponse,
    PredictionService, ServiceStatsSnapshot,
};
