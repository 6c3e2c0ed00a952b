// Test fixtures and data generators for integration tests

use mlserve::compute::FeatureBatch;
use mlserve::error::ErrorKind;
use mlserve::observability::MetricsSink;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Deterministic random data generator for reproducible tests
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform feature rows in `[low, high)`
    pub fn feature_rows(&mut self, rows: usize, width: usize, low: f64, high: f64) -> Vec<Vec<f64>> {
        (0..rows)
            .map(|_| (0..width).map(|_| self.rng.gen_range(low..high)).collect())
            .collect()
    }

    pub fn batch(&mut self, rows: usize, width: usize, low: f64, high: f64) -> FeatureBatch {
        FeatureBatch::from_rows(self.feature_rows(rows, width, low, high)).unwrap()
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

/// Linear estimator artifact with one output: `sum(w_i * x_i) + bias`
pub fn linear_artifact(weights: &[f64], bias: f64) -> Value {
    json!({ "kind": "linear", "weights": [weights], "bias": [bias] })
}

/// Network artifact passing `width` features through unchanged
pub fn identity_network(width: usize) -> Value {
    let weights: Vec<Vec<f32>> = (0..width)
        .map(|i| (0..width).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    json!({ "layers": [{ "weights": weights, "bias": vec![0.0f32; width] }] })
}

/// Two-class softmax network over two features
pub fn classifier_network() -> Value {
    json!({
        "layers": [
            { "weights": [[1.0, 0.0], [0.0, 1.0]], "bias": [0.0, 0.0], "activation": "relu" },
            { "weights": [[1.0, -1.0], [-1.0, 1.0]], "bias": [0.0, 0.0], "activation": "softmax" }
        ]
    })
}

/// Metadata with a preprocessing section and an owner field
pub fn metadata_with(preprocessing: Value) -> Value {
    json!({ "owner": "integration-tests", "preprocessing": preprocessing })
}

/// Metadata without preprocessing
pub fn plain_metadata() -> Value {
    json!({ "owner": "integration-tests" })
}

/// Metrics sink that keeps every call for assertions
#[derive(Default)]
pub struct RecordingSink {
    pub successes: Mutex<HashMap<String, usize>>,
    pub errors: Mutex<Vec<(String, ErrorKind)>>,
    pub throughput: Mutex<HashMap<String, f64>>,
}

impl MetricsSink for RecordingSink {
    fn record_success(&self, version: &str, _latency_secs: f64) {
        *self.successes.lock().entry(version.to_string()).or_insert(0) += 1;
    }

    fn record_error(&self, version: &str, kind: ErrorKind) {
        self.errors.lock().push((version.to_string(), kind));
    }

    fn set_throughput(&self, version: &str, per_sec: f64) {
        self.throughput.lock().insert(version.to_string(), per_sec);
    }
}
