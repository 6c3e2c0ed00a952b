//! Monitoring integration tests: history bounds, metrics sink and drift.

mod common;

use common::*;
use mlserve::compute::{ArtifactFormat, FeatureBatch, ModelMonitor, ModelRegistry, Prediction};
use mlserve::config::MonitorConfig;
use mlserve::error::ErrorKind;
use mlserve::ServeError;
use serde_json::json;
use std::sync::Arc;

fn single(value: f64) -> FeatureBatch {
    FeatureBatch::from_rows(vec![vec![value]]).unwrap()
}

#[test]
fn test_history_evicts_oldest_after_capacity() {
    let monitor = ModelMonitor::new(MonitorConfig::default());

    for i in 0..1001 {
        monitor.record_prediction(
            "v1",
            &single(i as f64),
            &[Prediction::Scalar(i as f64)],
            0.001,
            &format!("req-{}", i),
        );
    }

    assert_eq!(monitor.history_len("v1"), 1000);
    let stats = monitor.get_model_stats("v1");
    assert_eq!(stats.successful_predictions, 1000);
    assert_eq!(stats.total_predictions, 1000);

    let latest = monitor.recent_predictions("v1", 1000);
    assert_eq!(latest.first().unwrap().request_id, "req-1");
    assert_eq!(latest.last().unwrap().request_id, "req-1000");
}

#[tokio::test]
async fn test_failed_predictions_are_recorded() {
    let env = TestEnv::new();
    // Two-feature model receiving one feature fails at inference
    env.write_model("v1", ArtifactFormat::Pickle, &linear_artifact(&[1.0, 1.0], 0.0), &plain_metadata());
    let sink = Arc::new(RecordingSink::default());
    let registry = ModelRegistry::new(
        env.storage(),
        ModelMonitor::new(MonitorConfig::default()).with_sink(sink.clone()),
    );
    registry.load("v1").await.unwrap();

    for _ in 0..12 {
        let err = registry.predict("v1", &single(1.0), "req").await.unwrap_err();
        assert!(matches!(err, ServeError::PredictionFailure { .. }));
        assert_eq!(err.root_cause().kind(), ErrorKind::InferenceFailure);
    }
    registry
        .predict("v1", &FeatureBatch::from_rows(vec![vec![1.0, 2.0]]).unwrap(), "ok")
        .await
        .unwrap();

    let stats = registry.get_model_stats("v1").await.stats;
    assert_eq!(stats.failed_predictions, 12);
    assert_eq!(stats.successful_predictions, 1);
    assert_eq!(stats.total_predictions, 1);
    assert_eq!(stats.recent_errors.len(), 10);
    assert!(stats
        .recent_errors
        .iter()
        .all(|e| e.kind == ErrorKind::InferenceFailure && e.version == "v1"));

    assert_eq!(sink.errors.lock().len(), 12);
    assert_eq!(sink.successes.lock().get("v1"), Some(&1));
    assert!(sink.throughput.lock().contains_key("v1"));
}

#[tokio::test]
async fn test_unknown_version_is_not_recorded() {
    let env = TestEnv::new();
    let registry = env.registry();

    let _ = registry.predict("ghost", &single(1.0), "req").await;

    let report = registry.get_model_stats("ghost").await;
    assert!(!report.loaded);
    assert_eq!(report.stats, Default::default());
    assert!(registry.monitor().versions().is_empty());
}

#[tokio::test]
async fn test_small_history_capacity() {
    let env = TestEnv::new();
    env.write_model("v1", ArtifactFormat::Pickle, &linear_artifact(&[1.0], 0.0), &plain_metadata());
    let registry = env.registry_with(MonitorConfig {
        history_capacity: 5,
        ..MonitorConfig::default()
    });
    registry.load("v1").await.unwrap();

    for i in 0..7 {
        registry.predict("v1", &single(i as f64), "req").await.unwrap();
    }

    let stats = registry.get_model_stats("v1").await.stats;
    assert_eq!(stats.successful_predictions, 5);
    assert!(stats.average_latency >= 0.0);
    assert!(stats.throughput.is_finite());
}

#[tokio::test]
async fn test_drift_detection_through_registry() {
    let env = TestEnv::new();
    env.write_model("stable", ArtifactFormat::Pickle, &linear_artifact(&[1.0, 1.0], 0.0), &plain_metadata());
    env.write_model("noisy", ArtifactFormat::Pickle, &linear_artifact(&[1.0, 1.0], 0.0), &plain_metadata());
    let registry = env.registry();
    registry.load_all().await.unwrap();

    let mut generator = TestDataGenerator::default();
    for _ in 0..20 {
        // Within 1% of 100: coefficient of variation far below 0.1
        let batch = generator.batch(4, 2, 99.5, 100.5);
        registry.predict("stable", &batch, "s").await.unwrap();

        let batch = generator.batch(4, 2, 1.0, 100.0);
        registry.predict("noisy", &batch, "n").await.unwrap();
    }

    // Not enough history for the window
    assert!(!registry.check_data_drift("stable", 50).drift_detected);

    let stable = registry.check_data_drift("stable", 20);
    assert!(!stable.drift_detected);
    assert!(stable.confidence < 0.1);
    assert_eq!(stable.feature_changes.len(), 2);

    let noisy = registry.check_data_drift("noisy", 20);
    assert!(noisy.drift_detected);
    assert!(noisy.confidence > 0.1);

    assert!(!registry.check_data_drift("noisy", 0).drift_detected);
    assert!(!registry.check_data_drift("missing", 10).drift_detected);
}

#[tokio::test]
async fn test_prediction_records_keep_request_ids() {
    let env = TestEnv::new();
    env.write_model("v1", ArtifactFormat::Pickle, &linear_artifact(&[2.0], 0.0), &plain_metadata());
    let registry = env.registry();
    registry.load("v1").await.unwrap();

    for i in 0..3 {
        registry
            .predict("v1", &single(i as f64), &format!("req-{}", i))
            .await
            .unwrap();
    }

    let records = registry.monitor().recent_predictions("v1", 2);
    let ids: Vec<&str> = records.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, vec!["req-1", "req-2"]);
    assert_eq!(records[1].output_predictions, vec![Prediction::Scalar(4.0)]);

    let serialized = serde_json::to_value(&records[1]).unwrap();
    assert_eq!(serialized["input_features"], json!([[2.0]]));
}
