//! Error types for the mlserve model registry.
//!
//! This module provides a unified error type [`ServeError`] for all registry,
//! loader, preprocessing and serving operations, along with a convenient
//! [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Loading**: artifact lookup, format detection and decoding
//! - **Prediction**: missing models, preprocessing and inference failures
//! - **Validation**: malformed or empty feature batches
//! - **Configuration / Storage**: invalid settings, filesystem problems
//!
//! # Example
//!
//! ```rust
//! use mlserve::error::{Result, ServeError};
//!
//! fn require_rows(rows: usize) -> Result<()> {
//!     if rows == 0 {
//!         return Err(ServeError::Validation("features cannot be empty".into()));
//!     }
//!     Ok(())
//! }
//!
//! let err = require_rows(0).unwrap_err();
//! assert!(err.is_client_error());
//! assert_eq!(err.kind().as_str(), "validation");
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for mlserve operations.
#[derive(Error, Debug)]
pub enum ServeError {
    // Loading errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Unsupported artifact format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to load {target}: {reason}")]
    LoadFailure { target: String, reason: String },

    // Prediction errors
    #[error("Model version {0} not loaded")]
    ModelNotLoaded(String),

    #[error("Preprocessing failed: {0}")]
    PreprocessingFailure(String),

    #[error("Inference failed: {0}")]
    InferenceFailure(String),

    #[error("Prediction failed for model {version}: {source}")]
    PredictionFailure {
        version: String,
        #[source]
        source: Box<ServeError>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error classification used for metric labels and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ArtifactNotFound,
    UnsupportedFormat,
    LoadFailure,
    ModelNotLoaded,
    PreprocessingFailure,
    InferenceFailure,
    PredictionFailure,
    Validation,
    Storage,
    Config,
    Serialization,
    Io,
    Internal,
}

impl ErrorKind {
    /// Snake-case label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::LoadFailure => "load_failure",
            ErrorKind::ModelNotLoaded => "model_not_loaded",
            ErrorKind::PreprocessingFailure => "preprocessing_failure",
            ErrorKind::InferenceFailure => "inference_failure",
            ErrorKind::PredictionFailure => "prediction_failure",
            ErrorKind::Validation => "validation",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServeError {
    /// Build a load failure for `target` (a version or a path).
    pub fn load_failure(target: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        ServeError::LoadFailure {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a preprocessing or inference error for the caller of `predict`.
    pub fn prediction_failure(version: &str, source: ServeError) -> Self {
        ServeError::PredictionFailure {
            version: version.to_string(),
            source: Box::new(source),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServeError::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            ServeError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            ServeError::LoadFailure { .. } => ErrorKind::LoadFailure,
            ServeError::ModelNotLoaded(_) => ErrorKind::ModelNotLoaded,
            ServeError::PreprocessingFailure(_) => ErrorKind::PreprocessingFailure,
            ServeError::InferenceFailure(_) => ErrorKind::InferenceFailure,
            ServeError::PredictionFailure { .. } => ErrorKind::PredictionFailure,
            ServeError::Validation(_) => ErrorKind::Validation,
            ServeError::Storage(_) => ErrorKind::Storage,
            ServeError::Config(_) | ServeError::InvalidConfig { .. } => ErrorKind::Config,
            ServeError::Serialization(_) => ErrorKind::Serialization,
            ServeError::Io(_) => ErrorKind::Io,
            ServeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Innermost cause of a [`ServeError::PredictionFailure`], or `self`.
    pub fn root_cause(&self) -> &ServeError {
        match self {
            ServeError::PredictionFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if the caller caused the error (bad input or unknown version).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root_cause(),
            ServeError::Validation(_)
                | ServeError::ModelNotLoaded(_)
                | ServeError::UnsupportedFormat(_)
                | ServeError::ArtifactNotFound(_)
        )
    }

    /// Check if error is retryable. Always false: no operation retries internally.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<serde_json::Error> for ServeError {
    fn from(e: serde_json::Error) -> Self {
        ServeError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ServeError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServeError::Internal(format!("blocking task failed: {}", e))
    }
}

/// Result type alias for mlserve operations.
pub type Result<T> = std::result::Result<T, ServeError>;
