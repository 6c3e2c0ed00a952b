// Model data types: feature batches, predictions, metadata and registry entries

use super::loader::{Artifact, ArtifactFormat};
use crate::error::{Result, ServeError};
use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A rectangular batch of numeric feature rows.
///
/// Missing values are stored as `NaN` and travel as JSON `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    rows: Vec<Vec<f64>>,
    width: usize,
}

impl FeatureBatch {
    /// Creates a batch from rows, rejecting empty or ragged input.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let width = match rows.first() {
            Some(first) => first.len(),
            None => return Err(ServeError::Validation("features cannot be empty".to_string())),
        };

        if width == 0 {
            return Err(ServeError::Validation("feature rows cannot be empty".to_string()));
        }

        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(ServeError::Validation(format!(
                "row {} has {} features, expected {}",
                i,
                row.len(),
                width
            )));
        }

        Ok(Self { rows, width })
    }

    /// Parses the transport shape: a single row of numbers or a list of rows.
    pub fn from_json(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| ServeError::Validation("features must be an array".to_string()))?;

        if items.is_empty() {
            return Err(ServeError::Validation("features cannot be empty".to_string()));
        }

        if items.iter().all(|v| v.is_array()) {
            let rows = items
                .iter()
                .enumerate()
                .map(|(i, row)| parse_row(row, i))
                .collect::<Result<Vec<_>>>()?;
            Self::from_rows(rows)
        } else if items.iter().any(|v| v.is_array()) {
            Err(ServeError::Validation(
                "features mix scalar values and rows".to_string(),
            ))
        } else {
            Self::from_rows(vec![parse_row(value, 0)?])
        }
    }

    /// Rows of the batch.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Always false; empty batches cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of features per row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Checks whether any value is missing.
    pub fn has_missing(&self) -> bool {
        self.rows.iter().flatten().any(|v| v.is_nan())
    }

    /// Values of column `index`, missing values included.
    pub fn column(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(move |row| row[index])
    }

    /// Row-major copy of all values.
    pub fn flatten(&self) -> Vec<f64> {
        self.rows.iter().flatten().copied().collect()
    }

    /// Consumes the batch into its rows.
    pub fn into_rows(self) -> Vec<Vec<f64>> {
        self.rows
    }

    /// JSON form, with missing values as `null`.
    pub fn to_json(&self) -> Value {
        Value::Array(
            self.rows
                .iter()
                .map(|row| Value::Array(row.iter().map(|&v| number_or_null(v)).collect()))
                .collect(),
        )
    }
}

fn parse_row(row: &Value, index: usize) -> Result<Vec<f64>> {
    let values = row
        .as_array()
        .ok_or_else(|| ServeError::Validation(format!("row {} is not an array", index)))?;

    values
        .iter()
        .map(|v| match v {
            Value::Null => Ok(f64::NAN),
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                ServeError::Validation(format!("row {} holds an unrepresentable number", index))
            }),
            Value::Array(_) => Err(ServeError::Validation(format!(
                "row {} is nested deeper than two levels",
                index
            ))),
            other => Err(ServeError::Validation(format!(
                "row {} holds a non-numeric value: {}",
                index, other
            ))),
        })
        .collect()
}

fn number_or_null(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl Serialize for FeatureBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in &self.rows {
            let row: Vec<Option<f64>> = row
                .iter()
                .map(|&v| if v.is_nan() { None } else { Some(v) })
                .collect();
            seq.serialize_element(&row)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for FeatureBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FeatureBatch::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// One prediction, normalized from whatever the model produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prediction {
    /// Single output value for the row.
    Scalar(f64),
    /// Several output values for the row.
    Vector(Vec<f64>),
}

impl Prediction {
    /// Normalizes one row of model output.
    pub fn from_row(mut row: Vec<f64>) -> Self {
        if row.len() == 1 {
            Prediction::Scalar(row.remove(0))
        } else {
            Prediction::Vector(row)
        }
    }

    /// Output values of this prediction.
    pub fn values(&self) -> &[f64] {
        match self {
            Prediction::Scalar(v) => std::slice::from_ref(v),
            Prediction::Vector(v) => v,
        }
    }
}

/// Feature scaling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    #[default]
    None,
    Standard,
    MinMax,
}

/// Categorical encoding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    None,
    /// Declared but not implemented: applied as the identity transform.
    OneHot,
}

/// Missing value strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Imputation {
    #[default]
    None,
    /// Column mean of the current batch.
    Mean,
}

/// Per-version preprocessing, read from the `preprocessing` metadata field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub normalization: Normalization,
    pub encoding: Encoding,
    pub imputation: Imputation,
    /// Key of the fitted scaler; versions sharing a key share parameters.
    pub scaler_key: String,
    /// Fit a missing scaler on the first batch it sees.
    pub fit_on_first_batch: bool,
    /// Target range for min-max scaling.
    pub feature_range: (f64, f64),
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::None,
            encoding: Encoding::None,
            imputation: Imputation::None,
            scaler_key: "default".to_string(),
            fit_on_first_batch: true,
            feature_range: (0.0, 1.0),
        }
    }
}

impl PreprocessingConfig {
    /// Checks whether every step is disabled.
    pub fn is_identity(&self) -> bool {
        self.normalization == Normalization::None
            && self.encoding == Encoding::None
            && self.imputation == Imputation::None
    }
}

/// Model metadata: a free-form JSON object plus the preprocessing section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ModelMetadata {
    /// Creates metadata with the given preprocessing section.
    pub fn new(preprocessing: PreprocessingConfig) -> Self {
        Self {
            preprocessing,
            fields: Map::new(),
        }
    }

    /// Adds an arbitrary field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Gets an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Parses metadata from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A loaded model version. Owned by the registry; shared read-only with
/// in-flight predictions.
pub struct ModelEntry {
    /// Version key
    pub version: String,
    /// Inference-capable artifact
    pub artifact: Artifact,
    /// Format the artifact was decoded from
    pub format: ArtifactFormat,
    /// Metadata
    pub metadata: ModelMetadata,
    /// Load time
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("version", &self.version)
            .field("capability", &self.artifact.capability())
            .field("format", &self.format)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Listing entry for a known version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub version: String,
    pub metadata: ModelMetadata,
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Storage holds an artifact that failed to reload over the entry in memory.
    pub stale: bool,
}

/// Result of a successful registry prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub predictions: Vec<Prediction>,
    pub version: String,
    /// Wall-clock inference time in seconds
    pub inference_time: f64,
    pub metadata: ModelMetadata,
}
