// Per-version prediction monitoring: bounded history, throughput and drift

use super::model::{FeatureBatch, Prediction};
use crate::config::MonitorConfig;
use crate::error::{ErrorKind, ServeError};
use crate::observability::MetricsSink;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Fixed-capacity FIFO sequence. Pushing onto a full history evicts the
/// oldest entry in the same call.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    /// Creates an empty history. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item, returning the evicted one if the history was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        self.items.iter()
    }

    /// The last `n` items, oldest first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &T> + '_ {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }
}

/// Sliding log of event times used to estimate events per second.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<Instant>,
    window: Duration,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Records an event at `now` and purges samples outside the window.
    pub fn record_at(&mut self, now: Instant) {
        self.samples.push_back(now);
        self.purge(now);
    }

    /// Drops samples older than the window relative to `now`.
    pub fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Purges, then returns `count / (newest - oldest)`, or 0 with fewer
    /// than two samples or a zero span.
    pub fn throughput_at(&mut self, now: Instant) -> f64 {
        self.purge(now);
        self.rate()
    }

    fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / span
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A successful prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
    pub input_features: FeatureBatch,
    pub output_predictions: Vec<Prediction>,
    /// Seconds
    pub inference_time: f64,
}

/// A failed prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Statistics for one version, computed over retained records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    /// Retained successful predictions; failures are counted separately
    pub total_predictions: usize,
    pub successful_predictions: usize,
    pub failed_predictions: usize,
    /// Mean inference time in seconds over retained predictions
    pub average_latency: f64,
    /// Predictions per second over the throughput window
    pub throughput: f64,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Outcome of a drift check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub drift_detected: bool,
    pub confidence: f64,
    /// Per-feature statistic; empty when the check did not run
    #[serde(default)]
    pub feature_changes: Vec<f64>,
}

impl DriftReport {
    /// Report for a check that had too little data to run.
    pub fn no_drift() -> Self {
        Self::default()
    }
}

/// Statistic run over the most recent feature batches of a version.
pub trait DriftDetector: Send + Sync {
    fn name(&self) -> &str;

    /// `window` is ordered oldest first and is never empty.
    fn detect(&self, window: &[&FeatureBatch]) -> DriftReport;
}

/// Flags drift when any feature's coefficient of variation (std / |mean|)
/// over the window exceeds the threshold. Confidence is the mean ratio.
///
/// Rows of all batches are pooled. Batches narrower or wider than the most
/// recent one are skipped. A feature whose mean is near zero, or that has no
/// observed values, contributes a ratio of 0.
#[derive(Debug, Clone)]
pub struct CoefficientOfVariationDetector {
    threshold: f64,
}

impl CoefficientOfVariationDetector {
    const MEAN_EPSILON: f64 = 1e-12;

    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for CoefficientOfVariationDetector {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl DriftDetector for CoefficientOfVariationDetector {
    fn name(&self) -> &str {
        "coefficient_of_variation"
    }

    fn detect(&self, window: &[&FeatureBatch]) -> DriftReport {
        let Some(latest) = window.last() else {
            return DriftReport::no_drift();
        };
        let width = latest.width();

        let mut sums = vec![0.0; width];
        let mut counts = vec![0usize; width];
        let rows = || {
            window
                .iter()
                .copied()
                .filter(|b| b.width() == width)
                .flat_map(|b| b.rows())
        };

        for row in rows() {
            for (i, &v) in row.iter().enumerate() {
                if !v.is_nan() {
                    sums[i] += v;
                    counts[i] += 1;
                }
            }
        }

        let means: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .map(|(&s, &n)| if n == 0 { f64::NAN } else { s / n as f64 })
            .collect();

        let mut squares = vec![0.0; width];
        for row in rows() {
            for (i, &v) in row.iter().enumerate() {
                if !v.is_nan() {
                    squares[i] += (v - means[i]).powi(2);
                }
            }
        }

        let feature_changes: Vec<f64> = (0..width)
            .map(|i| {
                let mean = means[i];
                if counts[i] == 0 || mean.abs() < Self::MEAN_EPSILON {
                    return 0.0;
                }
                let std = (squares[i] / counts[i] as f64).sqrt();
                std / mean.abs()
            })
            .collect();

        let confidence = feature_changes.iter().sum::<f64>() / width as f64;
        let drift_detected = feature_changes.iter().any(|&r| r > self.threshold);

        DriftReport {
            drift_detected,
            confidence,
            feature_changes,
        }
    }
}

#[derive(Debug)]
struct VersionState {
    predictions: BoundedHistory<PredictionRecord>,
    errors: BoundedHistory<ErrorRecord>,
    throughput: ThroughputWindow,
}

/// Accumulates prediction outcomes per version.
///
/// State for a version is created on its first record and kept for the
/// lifetime of the monitor, independent of whether the model is loaded.
pub struct ModelMonitor {
    config: MonitorConfig,
    versions: RwLock<HashMap<String, Arc<Mutex<VersionState>>>>,
    detector: Arc<dyn DriftDetector>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl ModelMonitor {
    /// Creates a monitor using the coefficient-of-variation drift check and no
    /// metrics sink.
    pub fn new(config: MonitorConfig) -> Self {
        let detector = Arc::new(CoefficientOfVariationDetector::new(config.drift_threshold));
        Self {
            config,
            versions: RwLock::new(HashMap::new()),
            detector,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn DriftDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn state(&self, version: &str) -> Arc<Mutex<VersionState>> {
        if let Some(state) = self.versions.read().get(version) {
            return Arc::clone(state);
        }

        let mut versions = self.versions.write();
        let state = versions.entry(version.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(VersionState {
                predictions: BoundedHistory::new(self.config.history_capacity),
                errors: BoundedHistory::new(self.config.history_capacity),
                throughput: ThroughputWindow::new(self.config.throughput_window),
            }))
        });
        Arc::clone(state)
    }

    fn existing(&self, version: &str) -> Option<Arc<Mutex<VersionState>>> {
        self.versions.read().get(version).cloned()
    }

    fn with_state<R>(&self, version: &str, f: impl FnOnce(&VersionState) -> R) -> Option<R> {
        let state = self.existing(version)?;
        let guard = state.lock();
        Some(f(&guard))
    }

    /// Records a successful prediction and publishes the updated throughput.
    pub fn record_prediction(
        &self,
        version: &str,
        features: &FeatureBatch,
        predictions: &[Prediction],
        inference_time: f64,
        request_id: &str,
    ) {
        let record = PredictionRecord {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            version: version.to_string(),
            input_features: features.clone(),
            output_predictions: predictions.to_vec(),
            inference_time,
        };

        let throughput = {
            let state = self.state(version);
            let mut state = state.lock();
            state.predictions.push(record);
            state.throughput.record_at(Instant::now());
            state.throughput.rate()
        };

        if let Some(sink) = &self.sink {
            sink.record_success(version, inference_time);
            sink.set_throughput(version, throughput);
        }
    }

    /// Records a failed prediction.
    pub fn record_error(&self, version: &str, error: &ServeError) {
        let kind = error.root_cause().kind();
        let record = ErrorRecord {
            timestamp: Utc::now(),
            version: version.to_string(),
            kind,
            message: error.to_string(),
        };

        self.state(version).lock().errors.push(record);

        if let Some(sink) = &self.sink {
            sink.record_error(version, kind);
        }
    }

    /// Statistics for a version. Unknown versions report all zeros.
    pub fn get_model_stats(&self, version: &str) -> ModelStats {
        let Some(state) = self.existing(version) else {
            return ModelStats::default();
        };
        let mut state = state.lock();

        let successful = state.predictions.len();
        let failed = state.errors.len();
        let average_latency = if successful == 0 {
            0.0
        } else {
            state.predictions.iter().map(|p| p.inference_time).sum::<f64>() / successful as f64
        };

        ModelStats {
            total_predictions: successful,
            successful_predictions: successful,
            failed_predictions: failed,
            average_latency,
            throughput: state.throughput.throughput_at(Instant::now()),
            recent_errors: state
                .errors
                .latest(self.config.recent_errors)
                .cloned()
                .collect(),
        }
    }

    /// Runs the drift detector over the last `window_size` predictions.
    /// Reports no drift unless at least that many are retained.
    pub fn check_data_drift(&self, version: &str, window_size: usize) -> DriftReport {
        if window_size == 0 {
            return DriftReport::no_drift();
        }
        let Some(state) = self.existing(version) else {
            return DriftReport::no_drift();
        };
        let state = state.lock();
        if state.predictions.len() < window_size {
            return DriftReport::no_drift();
        }

        let window: Vec<&FeatureBatch> = state
            .predictions
            .latest(window_size)
            .map(|p| &p.input_features)
            .collect();
        let report = self.detector.detect(&window);

        if report.drift_detected {
            warn!(
                version,
                window_size,
                detector = self.detector.name(),
                confidence = report.confidence,
                "Data drift detected"
            );
        }
        report
    }

    /// Retained prediction records for a version.
    pub fn history_len(&self, version: &str) -> usize {
        self.with_state(version, |s| s.predictions.len())
            .unwrap_or(0)
    }

    /// Retained error records for a version.
    pub fn error_len(&self, version: &str) -> usize {
        self.with_state(version, |s| s.errors.len()).unwrap_or(0)
    }

    /// Up to `limit` most recent prediction records, oldest first.
    pub fn recent_predictions(&self, version: &str, limit: usize) -> Vec<PredictionRecord> {
        self.with_state(version, |s| s.predictions.latest(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Versions with any recorded activity.
    pub fn versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.versions.read().keys().cloned().collect();
        versions.sort();
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[f64]) -> FeatureBatch {
        FeatureBatch::from_rows(vec![values.to_vec()]).unwrap()
    }

    fn monitor() -> ModelMonitor {
        ModelMonitor::new(MonitorConfig::default())
    }

    #[test]
    fn test_bounded_history_evicts_oldest() {
        let mut history = BoundedHistory::new(3);
        assert_eq!(history.push(1), None);
        history.push(2);
        history.push(3);
        assert_eq!(history.push(4), Some(1));
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(history.latest(2).copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(history.latest(10).count(), 3);
    }

    #[test]
    fn test_throughput_window_purges_old_samples() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(60));

        window.record_at(start);
        assert_eq!(window.throughput_at(start), 0.0);

        window.record_at(start + Duration::from_secs(1));
        window.record_at(start + Duration::from_secs(2));
        // 3 samples over 2 seconds
        assert!((window.throughput_at(start + Duration::from_secs(2)) - 1.5).abs() < 1e-9);

        // Exactly 60s old is kept
        window.purge(start + Duration::from_secs(60));
        assert_eq!(window.len(), 3);

        let later = start + Duration::from_secs(61);
        window.purge(later);
        assert_eq!(window.len(), 2);

        assert_eq!(window.throughput_at(start + Duration::from_secs(200)), 0.0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_throughput_zero_span() {
        let now = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(60));
        window.record_at(now);
        window.record_at(now);
        assert_eq!(window.throughput_at(now), 0.0);
    }

    #[test]
    fn test_stats_for_unknown_version() {
        assert_eq!(monitor().get_model_stats("nope"), ModelStats::default());
    }

    #[test]
    fn test_record_prediction_and_error() {
        let monitor = monitor();
        let features = row(&[1.0, 2.0]);
        monitor.record_prediction("v1", &features, &[Prediction::Scalar(1.0)], 0.2, "a");
        monitor.record_prediction("v1", &features, &[Prediction::Scalar(1.0)], 0.4, "b");
        monitor.record_error("v1", &ServeError::InferenceFailure("boom".into()));

        let stats = monitor.get_model_stats("v1");
        assert_eq!(stats.successful_predictions, 2);
        assert_eq!(stats.failed_predictions, 1);
        assert_eq!(stats.total_predictions, 2);
        assert!((stats.average_latency - 0.3).abs() < 1e-9);
        assert_eq!(stats.recent_errors.len(), 1);
        assert_eq!(stats.recent_errors[0].kind, ErrorKind::InferenceFailure);
    }

    #[test]
    fn test_recent_errors_limited() {
        let monitor = monitor();
        for i in 0..25 {
            monitor.record_error("v1", &ServeError::InferenceFailure(format!("e{}", i)));
        }
        let stats = monitor.get_model_stats("v1");
        assert_eq!(stats.failed_predictions, 25);
        assert_eq!(stats.recent_errors.len(), 10);
        assert!(stats.recent_errors[9].message.contains("e24"));
        assert!(stats.recent_errors[0].message.contains("e15"));
    }

    #[test]
    fn test_history_capacity() {
        let monitor = monitor();
        for i in 0..1001 {
            monitor.record_prediction("v1", &row(&[i as f64]), &[], 0.0, &format!("r{}", i));
        }
        assert_eq!(monitor.history_len("v1"), 1000);
        let retained = monitor.recent_predictions("v1", 1000);
        assert_eq!(retained[0].request_id, "r1");
        assert!(retained.iter().all(|r| r.request_id != "r0"));
    }

    #[test]
    fn test_error_history_is_independent() {
        let monitor = ModelMonitor::new(MonitorConfig {
            history_capacity: 5,
            ..Default::default()
        });
        for _ in 0..8 {
            monitor.record_error("v1", &ServeError::InferenceFailure("x".into()));
        }
        assert_eq!(monitor.error_len("v1"), 5);
        assert_eq!(monitor.history_len("v1"), 0);
    }

    #[test]
    fn test_drift_requires_full_window() {
        let monitor = monitor();
        for v in [1.0, 100.0, 1.0] {
            monitor.record_prediction("v1", &row(&[v]), &[], 0.0, "r");
        }
        assert!(!monitor.check_data_drift("v1", 4).drift_detected);
        assert!(!monitor.check_data_drift("v1", 0).drift_detected);
        assert!(!monitor.check_data_drift("unknown", 1).drift_detected);
        assert!(monitor.check_data_drift("v1", 3).drift_detected);
    }

    #[test]
    fn test_drift_stable_features() {
        let monitor = monitor();
        for _ in 0..10 {
            monitor.record_prediction("v1", &row(&[5.0, 10.0]), &[], 0.0, "r");
        }
        let report = monitor.check_data_drift("v1", 10);
        assert!(!report.drift_detected);
        assert_eq!(report.feature_changes, vec![0.0, 0.0]);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_drift_zero_mean_is_no_signal() {
        let detector = CoefficientOfVariationDetector::default();
        let a = row(&[-1.0, 2.0]);
        let b = row(&[1.0, 2.0]);
        let report = detector.detect(&[&a, &b]);
        assert_eq!(report.feature_changes, vec![0.0, 0.0]);
        assert!(!report.drift_detected);
    }

    #[test]
    fn test_drift_confidence_is_mean_ratio() {
        let detector = CoefficientOfVariationDetector::new(0.5);
        // Column 0: mean 2, std 1 -> 0.5; column 1: constant -> 0
        let a = row(&[1.0, 4.0]);
        let b = row(&[3.0, 4.0]);
        let report = detector.detect(&[&a, &b]);
        assert_eq!(report.feature_changes, vec![0.5, 0.0]);
        assert!((report.confidence - 0.25).abs() < 1e-12);
        assert!(!report.drift_detected);
    }

    #[test]
    fn test_concurrent_recording_stays_bounded() {
        let monitor = Arc::new(ModelMonitor::new(MonitorConfig {
            history_capacity: 50,
            ..Default::default()
        }));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        monitor.record_prediction(
                            "v1",
                            &row(&[i as f64]),
                            &[],
                            0.001,
                            &format!("{}-{}", t, i),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(monitor.history_len("v1"), 50);
    }
}
