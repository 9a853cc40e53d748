//! End-to-end engine tests
//!
//! Drives the full engine (registry, guard, pipeline, planner) against the
//! in-memory gateway and a manual clock:
//!
//! 1. **Register + ingest + query** - the simplest full pass
//! 2. **Label-schema rejection** - mismatched label sets never reach the store
//! 3. **Cardinality cap** - the fourth series of a cap-3 metric is rejected
//! 4. **Boundary conditions** - timestamp window and label limits
//! 5. **Registry laws** - register/get round-trip, duplicate conflict
//! 6. **Upsert idempotency** - same key twice leaves one row

use std::sync::Arc;

use tideline::clock::Clock;
use tideline::clock::ManualClock;
use tideline::engine::MetricEngine;
use tideline::error::Error;
use tideline::ingest::IncomingSample;
use tideline::query::QueryRequest;
use tideline::registry::RegisterRequest;
use tideline::storage::{MemoryMetricStore, MemoryObjectStore};
use tideline::types::{Labels, MetricKind};
use tideline::Config;

// 2023-11-14T22:13:20Z
const NOW: i64 = 1_700_000_000_000;

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    engine: MetricEngine,
    store: Arc<MemoryMetricStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(Config::default())
}

fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryMetricStore::new());
    let objects = Arc::new(MemoryObjectStore::with_bucket(&config.cold_tier.bucket));
    let clock = Arc::new(ManualClock::new(NOW));
    let engine = MetricEngine::builder()
        .with_config(config)
        .with_store(store.clone())
        .with_object_store(objects)
        .with_clock(clock.clone())
        .build()
        .expect("engine should build");
    Harness {
        engine,
        store,
        clock,
    }
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Scenario: simple ingest + query
// =============================================================================

#[tokio::test]
async fn test_simple_ingest_and_query() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("cpu", MetricKind::Gauge).with_labels(&["host"]))
        .await
        .unwrap();

    let report = h
        .engine
        .ingest(vec![IncomingSample::new(
            "cpu",
            0.5,
            NOW,
            labels(&[("host", "a")]),
        )])
        .await
        .unwrap();
    assert_eq!(report.accepted, 1);
    assert_eq!(report.rejected, 0);

    // The ingest response means "buffered", not "stored"
    assert_eq!(h.store.sample_count(), 0);
    h.engine.flush().await.unwrap();
    assert_eq!(h.store.sample_count(), 1);

    let response = h
        .engine
        .query(QueryRequest {
            metric_name: "cpu".to_string(),
            start_time: Some(NOW - 1_000),
            end_time: Some(NOW + 1_000),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(response.total_points, 1);
    assert_eq!(response.data[0].timestamp, NOW);
    assert_eq!(response.data[0].value, 0.5);
    assert_eq!(response.data[0].labels["host"], "a");
}

// =============================================================================
// Scenario: label-schema rejection
// =============================================================================

#[tokio::test]
async fn test_label_schema_rejection() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("cpu", MetricKind::Gauge).with_labels(&["host"]))
        .await
        .unwrap();

    let report = h
        .engine
        .ingest(vec![IncomingSample::new(
            "cpu",
            0.5,
            NOW,
            labels(&[("host", "a"), ("dc", "x")]),
        )])
        .await
        .unwrap();

    assert_eq!(report.accepted, 0);
    assert_eq!(report.rejected, 1);
    assert!(report.errors[0].reason.contains("dc"));

    h.engine.flush().await.unwrap();
    assert_eq!(h.store.sample_count(), 0);
}

// =============================================================================
// Scenario: cardinality cap
// =============================================================================

#[tokio::test]
async fn test_cardinality_cap() {
    let mut config = Config::default();
    config.cardinality.max_series_per_metric = 3;
    config.cardinality.probes_per_minute = 1_000;
    let h = harness_with(config);

    h.engine
        .registry()
        .register(RegisterRequest::new("m", MetricKind::Gauge).with_labels(&["k"]))
        .await
        .unwrap();

    for value in ["v1", "v2", "v3"] {
        let report = h
            .engine
            .ingest(vec![IncomingSample::new(
                "m",
                1.0,
                h.clock.now_ms(),
                labels(&[("k", value)]),
            )])
            .await
            .unwrap();
        assert_eq!(report.accepted, 1, "series {} should be accepted", value);
        h.engine.flush().await.unwrap();
        // Step past the estimate cache TTL so each check sees fresh counts
        h.clock.advance_ms(3_600_001);
    }

    let report = h
        .engine
        .ingest(vec![IncomingSample::new(
            "m",
            1.0,
            h.clock.now_ms(),
            labels(&[("k", "v4")]),
        )])
        .await
        .unwrap();
    assert_eq!(report.accepted, 0);
    assert_eq!(report.rejected, 1);
    assert!(report.errors[0]
        .reason
        .contains("reached maximum cardinality"));
}

// =============================================================================
// Boundary conditions
// =============================================================================

#[tokio::test]
async fn test_timestamp_window_boundaries() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("m", MetricKind::Gauge))
        .await
        .unwrap();

    let day = 86_400_000i64;
    let cases = [
        ("exactly +300s", NOW + 300_000, true),
        ("+301s", NOW + 301_000, false),
        ("exactly -365d", NOW - 365 * day, true),
        ("-365d -1s", NOW - 365 * day - 1_000, false),
    ];

    for (name, ts, should_accept) in cases {
        let report = h
            .engine
            .ingest(vec![IncomingSample::new("m", 1.0, ts, Labels::new())])
            .await
            .unwrap();
        assert_eq!(report.accepted == 1, should_accept, "case {}", name);
    }
}

#[tokio::test]
async fn test_label_count_boundary() {
    let h = harness();

    let ten: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
    let ten_refs: Vec<&str> = ten.iter().map(String::as_str).collect();
    assert!(h
        .engine
        .registry()
        .register(RegisterRequest::new("ten", MetricKind::Gauge).with_labels(&ten_refs))
        .await
        .is_ok());

    let eleven: Vec<String> = (0..11).map(|i| format!("k{}", i)).collect();
    let eleven_refs: Vec<&str> = eleven.iter().map(String::as_str).collect();
    let err = h
        .engine
        .registry()
        .register(RegisterRequest::new("eleven", MetricKind::Gauge).with_labels(&eleven_refs))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadInput { .. }));
}

#[tokio::test]
async fn test_rejected_values() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("m", MetricKind::Gauge))
        .await
        .unwrap();

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let report = h
            .engine
            .ingest(vec![IncomingSample::new("m", bad, NOW, Labels::new())])
            .await
            .unwrap();
        assert_eq!(report.rejected, 1, "value {} should be rejected", bad);
    }
}

#[tokio::test]
async fn test_empty_batch_is_batch_level_error() {
    let h = harness();
    assert!(h.engine.ingest(vec![]).await.is_err());
}

// =============================================================================
// Registry laws
// =============================================================================

#[tokio::test]
async fn test_register_get_round_trip() {
    let h = harness();
    let registered = h
        .engine
        .registry()
        .register(RegisterRequest {
            name: "http_requests".to_string(),
            kind: MetricKind::Counter,
            description: Some("Requests served".to_string()),
            unit: Some("requests".to_string()),
            labels: vec!["endpoint".to_string(), "status".to_string()],
            retention_days: Some(90),
        })
        .await
        .unwrap();

    let fetched = h
        .engine
        .registry()
        .get_by_name("http_requests")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, registered);
    assert_eq!(fetched.retention_days, 90);
    assert_eq!(fetched.unit.as_deref(), Some("requests"));

    let err = h
        .engine
        .registry()
        .register(RegisterRequest::new("http_requests", MetricKind::Counter))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_soft_deleted_metric_rejects_queries() {
    let h = harness();
    let metric = h
        .engine
        .registry()
        .register(RegisterRequest::new("doomed", MetricKind::Gauge))
        .await
        .unwrap();

    h.engine.registry().soft_delete(metric.id).await.unwrap();

    let err = h
        .engine
        .query(QueryRequest {
            metric_name: "doomed".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// =============================================================================
// Upsert idempotency
// =============================================================================

#[tokio::test]
async fn test_upsert_idempotency_through_pipeline() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("m", MetricKind::Gauge).with_labels(&["host"]))
        .await
        .unwrap();

    // Same (time, metric, labels) twice with the same value
    for _ in 0..2 {
        h.engine
            .ingest(vec![IncomingSample::new(
                "m",
                1.0,
                NOW,
                labels(&[("host", "a")]),
            )])
            .await
            .unwrap();
        h.engine.flush().await.unwrap();
    }
    assert_eq!(h.store.sample_count(), 1);

    // Same key again with a new value: last write wins
    h.engine
        .ingest(vec![IncomingSample::new(
            "m",
            9.0,
            NOW,
            labels(&[("host", "a")]),
        )])
        .await
        .unwrap();
    h.engine.flush().await.unwrap();

    let response = h
        .engine
        .query(QueryRequest {
            metric_name: "m".to_string(),
            start_time: Some(NOW - 1_000),
            end_time: Some(NOW + 1_000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.total_points, 1);
    assert_eq!(response.data[0].value, 9.0);
}

// =============================================================================
// Ingest N, query N
// =============================================================================

#[tokio::test]
async fn test_ingest_n_query_n() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("m", MetricKind::Gauge).with_labels(&["host"]))
        .await
        .unwrap();

    let n = 50;
    let batch: Vec<IncomingSample> = (0..n)
        .map(|i| {
            IncomingSample::new(
                "m",
                i as f64,
                NOW - 60_000 + i * 1_000,
                labels(&[("host", "a")]),
            )
        })
        .collect();
    let report = h.engine.ingest(batch).await.unwrap();
    assert_eq!(report.accepted, n as usize);
    h.engine.flush().await.unwrap();

    let response = h
        .engine
        .query(QueryRequest {
            metric_name: "m".to_string(),
            start_time: Some(NOW - 60_000),
            end_time: Some(NOW + 1_000),
            limit: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.total_points, n as usize);
}

// =============================================================================
// Engine stats
// =============================================================================

#[tokio::test]
async fn test_engine_stats() {
    let h = harness();
    h.engine
        .registry()
        .register(RegisterRequest::new("m", MetricKind::Gauge))
        .await
        .unwrap();

    h.engine
        .ingest(vec![
            IncomingSample::new("m", 1.0, NOW, Labels::new()),
            IncomingSample::new("m", f64::NAN, NOW, Labels::new()),
        ])
        .await
        .unwrap();
    h.engine.flush().await.unwrap();

    let stats = h.engine.stats();
    assert_eq!(stats.ingest.received, 2);
    assert_eq!(stats.ingest.accepted, 1);
    assert_eq!(stats.ingest.rejected, 1);
    assert_eq!(stats.ingest.flushed, 1);
    assert_eq!(stats.cached_metrics, 1);
}
