// Feature preprocessing: scaling, encoding and imputation

use super::model::{Encoding, FeatureBatch, Imputation, Normalization, PreprocessingConfig};
use crate::error::{Result, ServeError};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fitted scaling parameters, one value per feature column.
#[derive(Debug, Clone, PartialEq)]
pub enum FittedScaler {
    /// `(x - mean) / scale`
    Standard { mean: Vec<f64>, scale: Vec<f64> },
    /// `x * scale + offset`, mapping the observed range onto `range`
    MinMax {
        scale: Vec<f64>,
        offset: Vec<f64>,
        range: (f64, f64),
    },
}

impl FittedScaler {
    /// Fits a scaler of the given kind. Missing values are ignored.
    pub fn fit(kind: Normalization, data: &FeatureBatch, range: (f64, f64)) -> Result<Self> {
        let columns = (0..data.width())
            .map(|i| {
                let observed: Vec<f64> = data.column(i).filter(|v| !v.is_nan()).collect();
                if observed.is_empty() {
                    Err(ServeError::PreprocessingFailure(format!(
                        "column {} has no observed values",
                        i
                    )))
                } else {
                    Ok(observed)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        match kind {
            Normalization::Standard => {
                let mut mean = Vec::with_capacity(columns.len());
                let mut scale = Vec::with_capacity(columns.len());
                for column in &columns {
                    let n = column.len() as f64;
                    let m = column.iter().sum::<f64>() / n;
                    let var = column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
                    let std = var.sqrt();
                    mean.push(m);
                    // Constant columns are centered but not scaled
                    scale.push(if std <= f64::EPSILON * m.abs().max(1.0) { 1.0 } else { std });
                }
                Ok(FittedScaler::Standard { mean, scale })
            }
            Normalization::MinMax => {
                let (lo, hi) = range;
                if !(lo < hi) {
                    return Err(ServeError::PreprocessingFailure(format!(
                        "feature range ({}, {}) is empty",
                        lo, hi
                    )));
                }
                let mut scale = Vec::with_capacity(columns.len());
                let mut offset = Vec::with_capacity(columns.len());
                for column in &columns {
                    let min = column.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let span = if max - min == 0.0 { 1.0 } else { max - min };
                    let s = (hi - lo) / span;
                    scale.push(s);
                    offset.push(lo - min * s);
                }
                Ok(FittedScaler::MinMax {
                    scale,
                    offset,
                    range,
                })
            }
            Normalization::None => Err(ServeError::PreprocessingFailure(
                "no normalization configured".to_string(),
            )),
        }
    }

    /// Normalization this scaler implements.
    pub fn kind(&self) -> Normalization {
        match self {
            FittedScaler::Standard { .. } => Normalization::Standard,
            FittedScaler::MinMax { .. } => Normalization::MinMax,
        }
    }

    /// Number of columns the scaler was fitted on.
    pub fn width(&self) -> usize {
        match self {
            FittedScaler::Standard { mean, .. } => mean.len(),
            FittedScaler::MinMax { scale, .. } => scale.len(),
        }
    }

    /// Applies the scaler. Missing values stay missing.
    pub fn transform(&self, data: &FeatureBatch) -> Result<FeatureBatch> {
        if data.width() != self.width() {
            return Err(ServeError::PreprocessingFailure(format!(
                "scaler fitted on {} features, got {}",
                self.width(),
                data.width()
            )));
        }

        let rows = data
            .rows()
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, &x)| match self {
                        FittedScaler::Standard { mean, scale } => (x - mean[i]) / scale[i],
                        FittedScaler::MinMax { scale, offset, .. } => x * scale[i] + offset[i],
                    })
                    .collect()
            })
            .collect();

        FeatureBatch::from_rows(rows)
    }
}

/// Applies per-version preprocessing and owns the fitted scalers.
///
/// Scalers are keyed by `scaler_key`, not by version, so versions sharing a
/// key share parameters. They live until [`FeaturePreprocessor::reset_scaler`].
#[derive(Default)]
pub struct FeaturePreprocessor {
    scalers: RwLock<HashMap<String, Arc<FittedScaler>>>,
    fallbacks: AtomicU64,
}

impl FeaturePreprocessor {
    /// Creates a preprocessor with no fitted scalers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs normalization, then encoding, then imputation.
    ///
    /// A failing step is logged and skipped: its input is passed on unchanged.
    pub fn process(&self, features: &FeatureBatch, config: &PreprocessingConfig) -> FeatureBatch {
        if config.is_identity() {
            return features.clone();
        }

        let mut batch = features.clone();

        if config.normalization != Normalization::None {
            batch = self.lenient("normalization", config, batch, |b| self.normalize(b, config));
        }

        if config.encoding != Encoding::None {
            batch = self.lenient("encoding", config, batch, |b| encode(b, config.encoding));
        }

        if config.imputation == Imputation::Mean {
            batch = self.lenient("imputation", config, batch, impute_mean);
        }

        batch
    }

    fn lenient<F>(
        &self,
        step: &'static str,
        config: &PreprocessingConfig,
        batch: FeatureBatch,
        apply: F,
    ) -> FeatureBatch
    where
        F: FnOnce(&FeatureBatch) -> Result<FeatureBatch>,
    {
        match apply(&batch) {
            Ok(out) => out,
            Err(e) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    step,
                    scaler_key = %config.scaler_key,
                    error = %e,
                    "Preprocessing step failed, passing features through unchanged"
                );
                batch
            }
        }
    }

    fn normalize(&self, batch: &FeatureBatch, config: &PreprocessingConfig) -> Result<FeatureBatch> {
        let key = config.scaler_key.as_str();
        let existing = self.scalers.read().get(key).cloned();

        let scaler = match existing {
            Some(scaler) => scaler,
            None if !config.fit_on_first_batch => {
                return Err(ServeError::PreprocessingFailure(format!(
                    "scaler '{}' is not fitted",
                    key
                )));
            }
            None => {
                let mut scalers = self.scalers.write();
                match scalers.entry(key.to_string()) {
                    // Another request fitted it first
                    Entry::Occupied(e) => Arc::clone(e.get()),
                    Entry::Vacant(e) => {
                        let fitted = Arc::new(FittedScaler::fit(
                            config.normalization,
                            batch,
                            config.feature_range,
                        )?);
                        info!(scaler_key = key, kind = ?config.normalization, rows = batch.len(), "Fitted scaler on first batch");
                        Arc::clone(e.insert(fitted))
                    }
                }
            }
        };

        if scaler.kind() != config.normalization {
            return Err(ServeError::PreprocessingFailure(format!(
                "scaler '{}' was fitted for {:?}, config asks for {:?}",
                key,
                scaler.kind(),
                config.normalization
            )));
        }

        scaler.transform(batch)
    }

    /// Fits the configured scaler on `data`, replacing any existing one.
    ///
    /// A config without normalization has nothing to fit.
    pub fn fit_preprocessor(&self, data: &FeatureBatch, config: &PreprocessingConfig) -> Result<()> {
        if config.normalization == Normalization::None {
            return Ok(());
        }

        let fitted = FittedScaler::fit(config.normalization, data, config.feature_range)?;
        self.scalers
            .write()
            .insert(config.scaler_key.clone(), Arc::new(fitted));

        info!(scaler_key = %config.scaler_key, kind = ?config.normalization, rows = data.len(), "Fitted scaler");
        Ok(())
    }

    /// Removes a fitted scaler. Returns whether one existed.
    pub fn reset_scaler(&self, key: &str) -> bool {
        self.scalers.write().remove(key).is_some()
    }

    /// Gets a fitted scaler.
    pub fn scaler(&self, key: &str) -> Option<Arc<FittedScaler>> {
        self.scalers.read().get(key).cloned()
    }

    /// Number of steps that failed and fell back to their input.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

fn encode(batch: &FeatureBatch, encoding: Encoding) -> Result<FeatureBatch> {
    match encoding {
        Encoding::None => Ok(batch.clone()),
        Encoding::OneHot => {
            // Category vocabularies are not part of model metadata
            debug!("One-hot encoding is not implemented, features unchanged");
            Ok(batch.clone())
        }
    }
}

/// Replaces missing values with the column mean of this batch.
fn impute_mean(batch: &FeatureBatch) -> Result<FeatureBatch> {
    if !batch.has_missing() {
        return Ok(batch.clone());
    }

    let means: Vec<f64> = (0..batch.width())
        .map(|i| {
            let (sum, n) = batch
                .column(i)
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        })
        .collect();

    let rows = batch
        .rows()
        .iter()
        .map(|row| {
            row.iter()
                .zip(&means)
                .map(|(&v, &mean)| if v.is_nan() { mean } else { v })
                .collect()
        })
        .collect();

    FeatureBatch::from_rows(rows)
}
