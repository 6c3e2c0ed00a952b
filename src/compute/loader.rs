// Artifact loading and format-specific decoding

use super::estimators::{EstimatorDecoder, NetworkDecoder};
use super::model::{FeatureBatch, Prediction};
use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// Artifact format, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Pickled estimator (`.pkl`)
    Pickle,
    /// Joblib dump (`.joblib`)
    Joblib,
    /// Network checkpoint (`.h5`)
    Checkpoint,
    /// Portable inference graph (`.onnx`)
    Onnx,
}

impl ArtifactFormat {
    /// All recognized formats.
    pub const ALL: [ArtifactFormat; 4] = [
        ArtifactFormat::Pickle,
        ArtifactFormat::Joblib,
        ArtifactFormat::Checkpoint,
        ArtifactFormat::Onnx,
    ];

    /// File extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Pickle => "pkl",
            ArtifactFormat::Joblib => "joblib",
            ArtifactFormat::Checkpoint => "h5",
            ArtifactFormat::Onnx => "onnx",
        }
    }

    /// Looks up a format by extension (case-insensitive, dot optional).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    /// Determines the format of an artifact path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(ext).ok_or_else(|| {
            ServeError::UnsupportedFormat(if ext.is_empty() {
                format!("{} has no extension", path.display())
            } else {
                format!(".{} ({})", ext, path.display())
            })
        })
    }
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Dense row-major tensor handed to network-style models.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking the element count against the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ServeError::InferenceFailure(format!(
                "tensor shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Converts a feature batch into a `[rows, width]` f32 tensor.
    pub fn from_batch(batch: &FeatureBatch) -> Self {
        Self {
            shape: vec![batch.len(), batch.width()],
            data: batch.flatten().into_iter().map(|v| v as f32).collect(),
        }
    }

    /// Splits the tensor into per-row outputs along the first axis.
    pub fn into_rows(self) -> Result<Vec<Vec<f64>>> {
        match self.shape.as_slice() {
            [_] => Ok(self.data.into_iter().map(|v| vec![v as f64]).collect()),
            [rows, ..] if *rows > 0 => {
                let stride = self.data.len() / rows;
                Ok(self
                    .data
                    .chunks(stride.max(1))
                    .map(|chunk| chunk.iter().map(|&v| v as f64).collect())
                    .collect())
            }
            _ => Err(ServeError::InferenceFailure(format!(
                "cannot split tensor of shape {:?} into rows",
                self.shape
            ))),
        }
    }
}

/// Estimator-style model with a direct `predict` call.
pub trait Predictor: Send + Sync {
    /// Predicts one output row per input row.
    fn predict(&self, features: &FeatureBatch) -> Result<Vec<Vec<f64>>>;
}

/// Network-style model with a tensor `forward` pass.
pub trait ForwardModule: Send + Sync {
    /// Runs the forward pass over a `[rows, width]` input.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;
}

/// Inference capability of a loaded artifact, fixed by its decoder.
#[derive(Clone)]
pub enum Artifact {
    DirectPredict(Arc<dyn Predictor>),
    TensorForward(Arc<dyn ForwardModule>),
}

/// Capability tag, for logs and listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DirectPredict,
    TensorForward,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Artifact").field(&self.capability()).finish()
    }
}

impl Artifact {
    /// Gets the capability tag.
    pub fn capability(&self) -> Capability {
        match self {
            Artifact::DirectPredict(_) => Capability::DirectPredict,
            Artifact::TensorForward(_) => Capability::TensorForward,
        }
    }
}

/// Decodes artifact bytes of one format into an [`Artifact`].
pub trait ArtifactDecoder: Send + Sync {
    /// Decoder name for diagnostics.
    fn name(&self) -> &str;

    /// Decodes the artifact.
    fn decode(&self, bytes: &[u8]) -> Result<Artifact>;
}

/// Loads artifacts from disk and runs inference on them.
#[derive(Clone)]
pub struct ArtifactLoader {
    decoders: HashMap<ArtifactFormat, Arc<dyn ArtifactDecoder>>,
}

impl Default for ArtifactLoader {
    fn default() -> Self {
        Self::with_builtin_decoders()
    }
}

impl ArtifactLoader {
    /// Creates a loader with no decoders: every format fails to load.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Creates a loader with the portable estimator and network decoders.
    ///
    /// `Onnx` has no built-in runtime and must be registered by the caller.
    pub fn with_builtin_decoders() -> Self {
        let estimator: Arc<dyn ArtifactDecoder> = Arc::new(EstimatorDecoder);
        Self::empty()
            .with_decoder(ArtifactFormat::Pickle, Arc::clone(&estimator))
            .with_decoder(ArtifactFormat::Joblib, estimator)
            .with_decoder(ArtifactFormat::Checkpoint, Arc::new(NetworkDecoder))
    }

    /// Registers a decoder, replacing any previous one for the format.
    pub fn with_decoder(mut self, format: ArtifactFormat, decoder: Arc<dyn ArtifactDecoder>) -> Self {
        self.decoders.insert(format, decoder);
        self
    }

    /// Checks whether a runtime is available for the format.
    pub fn supports(&self, format: ArtifactFormat) -> bool {
        self.decoders.contains_key(&format)
    }

    /// Loads the artifact at `path`.
    pub async fn load(&self, path: &Path) -> Result<(Artifact, ArtifactFormat)> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ServeError::ArtifactNotFound(path.display().to_string()));
        }

        let format = ArtifactFormat::from_path(path)?;

        let decoder = self.decoders.get(&format).cloned().ok_or_else(|| {
            ServeError::load_failure(
                path.display(),
                format!("no runtime available for .{} artifacts", format),
            )
        })?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServeError::load_failure(path.display(), e))?;

        debug!(path = %path.display(), %format, decoder = decoder.name(), size = bytes.len(), "Decoding artifact");

        let artifact = tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await?
            .map_err(|e| match e {
                e @ ServeError::LoadFailure { .. } => e,
                other => ServeError::load_failure(path.display(), other),
            })?;

        Ok((artifact, format))
    }

    /// Runs inference and normalizes the output to one prediction per row.
    ///
    /// Blocking; async callers run it on the blocking pool.
    pub fn predict(&self, artifact: &Artifact, features: &FeatureBatch) -> Result<Vec<Prediction>> {
        let rows = match artifact {
            Artifact::DirectPredict(model) => model.predict(features),
            Artifact::TensorForward(module) => {
                module.forward(&Tensor::from_batch(features)).and_then(Tensor::into_rows)
            }
        }
        .map_err(|e| match e {
            e @ ServeError::InferenceFailure(_) => e,
            other => ServeError::InferenceFailure(other.to_string()),
        })?;

        if rows.len() != features.len() {
            error!(expected = features.len(), got = rows.len(), "Model output row count mismatch");
            return Err(ServeError::InferenceFailure(format!(
                "model returned {} rows for {} inputs",
                rows.len(),
                features.len()
            )));
        }

        Ok(rows.into_iter().map(Prediction::from_row).collect())
    }
}
