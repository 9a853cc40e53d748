//! Ingestion pipeline
//!
//! Accepts batches of incoming samples, validates each sample independently
//! (partial success is the norm), and enqueues the survivors on a lock-free
//! multi-producer write buffer. A background flusher ([`FlushService`])
//! drains the buffer into the store on a schedule; an oversize buffer
//! triggers an immediate drain.
//!
//! A sample moves through these states:
//!
//! ```text
//! Incoming -> (validation fail) -> Rejected
//!          -> (validation ok)   -> Buffered -> (flush ok)   -> Stored
//!                                           -> (flush fail) -> Buffered (re-enqueued)
//! ```
//!
//! Acceptance means "accepted into the buffer", not "durably persisted":
//! samples still buffered when the process exits are lost. That durability
//! limit is deliberate; everything else retries.

mod flusher;

pub use flusher::FlushService;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use tokio::sync::Notify;

use crate::cardinality::CardinalityGuard;
use crate::clock::SharedClock;
use crate::config::IngestionConfig;
use crate::error::{Error, Result};
use crate::registry::MetricRegistry;
use crate::storage::MetricStore;
use crate::types::{
    validate_label_key, validate_metric_name, Labels, MetricKind, Sample, MAX_SAMPLE_AGE_MS,
    MAX_SAMPLE_FUTURE_MS,
};

/// A sample as handed over by the transport layer
#[derive(Debug, Clone)]
pub struct IncomingSample {
    /// Metric name
    pub name: String,
    /// Measurement value
    pub value: f64,
    /// Epoch millis
    pub timestamp: i64,
    /// Label values
    pub labels: Labels,
    /// Kind hint for auto-registration of unknown names
    pub kind: Option<MetricKind>,
}

impl IncomingSample {
    /// Convenience constructor for the common case
    pub fn new(name: impl Into<String>, value: f64, timestamp: i64, labels: Labels) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            labels,
            kind: None,
        }
    }
}

/// Why one sample of a batch was rejected
#[derive(Debug, Clone)]
pub struct IngestionError {
    /// Position of the sample in the submitted batch
    pub index: usize,
    /// Metric name as submitted
    pub metric_name: String,
    /// Human-readable reason
    pub reason: String,
}

/// Outcome of one ingest call
#[derive(Debug)]
pub struct IngestReport {
    /// Samples accepted into the buffer
    pub accepted: usize,
    /// Samples rejected by validation
    pub rejected: usize,
    /// One entry per rejected sample
    pub errors: Vec<IngestionError>,
    /// Wall time spent in the call
    pub duration_ms: u64,
}

/// Pipeline counters
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    /// Samples submitted over the lifetime of the pipeline
    pub received: u64,
    /// Samples accepted into the buffer
    pub accepted: u64,
    /// Samples rejected by validation
    pub rejected: u64,
    /// Samples written to the store
    pub flushed: u64,
    /// Failed flush attempts (each one re-enqueued its batch)
    pub flush_failures: u64,
    /// Samples currently buffered
    pub buffered: usize,
}

/// Validating, buffering ingest front end
pub struct IngestionPipeline {
    config: IngestionConfig,
    registry: Arc<MetricRegistry>,
    guard: Arc<CardinalityGuard>,
    store: Arc<dyn MetricStore>,
    clock: SharedClock,
    buffer: SegQueue<Sample>,
    /// Wakes the flusher when the buffer hits its cap
    flush_notify: Arc<Notify>,
    /// Single-consumer guard: scheduled and manual flushes share one drain
    drain_lock: tokio::sync::Mutex<()>,
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
}

impl IngestionPipeline {
    /// Create a pipeline over the given collaborators
    pub fn new(
        config: IngestionConfig,
        registry: Arc<MetricRegistry>,
        guard: Arc<CardinalityGuard>,
        store: Arc<dyn MetricStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            registry,
            guard,
            store,
            clock,
            buffer: SegQueue::new(),
            flush_notify: Arc::new(Notify::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            received: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    /// Handle used by the flusher to wait for oversize triggers
    pub(crate) fn flush_notify(&self) -> Arc<Notify> {
        self.flush_notify.clone()
    }

    /// Validate and buffer a batch. Every sample is attempted independently;
    /// the call only fails outright on batch-level problems (empty batch,
    /// batch larger than the buffer).
    pub async fn ingest(&self, batch: Vec<IncomingSample>) -> Result<IngestReport> {
        let started = Instant::now();

        if batch.is_empty() {
            return Err(Error::bad_input("metrics", "batch must not be empty"));
        }
        if batch.len() > self.config.buffer_max_size {
            return Err(Error::ResourceExhausted(format!(
                "batch size {} exceeds buffer capacity {}",
                batch.len(),
                self.config.buffer_max_size
            )));
        }

        self.received.fetch_add(batch.len() as u64, Ordering::Relaxed);

        // Validate all samples concurrently, then join
        let outcomes = futures::future::join_all(
            batch
                .iter()
                .enumerate()
                .map(|(index, sample)| self.validate_sample(index, sample)),
        )
        .await;

        let mut accepted = 0usize;
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(sample) => {
                    self.buffer.push(sample);
                    accepted += 1;
                }
                Err(error) => errors.push(error),
            }
        }

        self.accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        self.rejected.fetch_add(errors.len() as u64, Ordering::Relaxed);

        // Oversize trigger: drain ahead of the next scheduled tick
        if self.buffer.len() >= self.config.buffer_max_size {
            self.flush_notify.notify_one();
        }

        Ok(IngestReport {
            accepted,
            rejected: errors.len(),
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run the full per-sample validation chain
    async fn validate_sample(
        &self,
        index: usize,
        incoming: &IncomingSample,
    ) -> std::result::Result<Sample, IngestionError> {
        let reject = |reason: String| IngestionError {
            index,
            metric_name: incoming.name.clone(),
            reason,
        };

        validate_metric_name(&incoming.name).map_err(|e| reject(e.to_string()))?;

        if !incoming.value.is_finite() {
            return Err(reject(format!(
                "invalid value: {} is not a finite number",
                incoming.value
            )));
        }

        let now = self.clock.now_ms();
        if incoming.timestamp < now - MAX_SAMPLE_AGE_MS {
            return Err(reject(format!(
                "invalid timestamp: {} is older than 365 days",
                incoming.timestamp
            )));
        }
        if incoming.timestamp > now + MAX_SAMPLE_FUTURE_MS {
            return Err(reject(format!(
                "invalid timestamp: {} is more than 300s in the future",
                incoming.timestamp
            )));
        }

        let kind = incoming.kind.unwrap_or(MetricKind::Gauge);
        let metric = self
            .registry
            .get_or_create(&incoming.name, kind)
            .await
            .map_err(|e| reject(e.to_string()))?;

        self.check_label_schema(&metric.id, &incoming.labels)
            .await
            .map_err(&reject)?;

        let check = self.guard.validate(&metric, &incoming.labels).await;
        for warning in &check.warnings {
            tracing::warn!(metric = %metric.name, "{}", warning);
        }
        if !check.ok {
            return Err(reject(check.errors.join("; ")));
        }

        Ok(Sample {
            timestamp: incoming.timestamp,
            metric_id: metric.id,
            value: incoming.value,
            labels: incoming.labels.clone(),
        })
    }

    /// Provided label keys must equal the registered schema exactly
    async fn check_label_schema(
        &self,
        metric_id: &crate::types::MetricId,
        labels: &Labels,
    ) -> std::result::Result<(), String> {
        let schema = self
            .registry
            .labels_of(*metric_id)
            .await
            .map_err(|e| e.to_string())?;

        for key in labels.keys() {
            validate_label_key(key).map_err(|e| e.to_string())?;
            if !schema.iter().any(|k| k == key) {
                return Err(format!(
                    "unexpected label '{}': registered schema is [{}]",
                    key,
                    schema.join(", ")
                ));
            }
        }
        for key in &schema {
            if !labels.contains_key(key) {
                return Err(format!("missing required label '{}'", key));
            }
        }
        Ok(())
    }

    /// Drain the buffer into the store. Drains in batches of the configured
    /// size; a failed write re-enqueues its samples at the tail and stops the
    /// pass (the next tick retries). Returns the number of samples written.
    pub async fn flush(&self) -> Result<u64> {
        let _consumer = self.drain_lock.lock().await;

        // Bound the pass to what was buffered when it started so concurrent
        // producers cannot keep a single pass alive forever.
        let mut remaining = self.buffer.len();
        let mut written = 0u64;

        while remaining > 0 {
            let take = remaining.min(self.config.batch_size);
            let mut batch = Vec::with_capacity(take);
            for _ in 0..take {
                match self.buffer.pop() {
                    Some(sample) => batch.push(sample),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());

            match self.store.upsert_samples(&batch).await {
                Ok(()) => {
                    written += batch.len() as u64;
                    self.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        batch = batch.len(),
                        "Flush write failed, re-enqueueing batch"
                    );
                    for sample in batch {
                        self.buffer.push(sample);
                    }
                    return Err(e);
                }
            }
        }

        if written > 0 {
            tracing::debug!(samples = written, "Buffer flushed");
        }
        Ok(written)
    }

    /// Samples currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Flush interval from the pipeline configuration
    pub fn flush_interval_ms(&self) -> u64 {
        self.config.flush_interval_ms
    }

    /// Counter snapshot
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            buffered: self.buffer.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CardinalityConfig;
    use crate::registry::RegisterRequest;
    use crate::storage::MemoryMetricStore;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        pipeline: IngestionPipeline,
        registry: Arc<MetricRegistry>,
        store: Arc<MemoryMetricStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        fixture_with(IngestionConfig::default(), CardinalityConfig::default())
    }

    fn fixture_with(ingestion: IngestionConfig, cardinality: CardinalityConfig) -> Fixture {
        let store = Arc::new(MemoryMetricStore::new());
        let manual = Arc::new(ManualClock::new(NOW));
        let clock: SharedClock = manual.clone();
        let registry = Arc::new(MetricRegistry::new(store.clone(), clock.clone()));
        let guard = Arc::new(CardinalityGuard::new(
            cardinality,
            store.clone(),
            clock.clone(),
        ));
        let pipeline = IngestionPipeline::new(
            ingestion,
            registry.clone(),
            guard,
            store.clone(),
            clock.clone(),
        );
        Fixture {
            pipeline,
            registry,
            store,
            clock: manual,
        }
    }

    fn host_labels(host: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert("host".to_string(), host.to_string());
        labels
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let f = fixture();
        let err = f.pipeline.ingest(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));
    }

    #[tokio::test]
    async fn test_oversize_batch_rejected() {
        let f = fixture_with(
            IngestionConfig {
                buffer_max_size: 2,
                ..Default::default()
            },
            CardinalityConfig::default(),
        );
        let batch = (0..3)
            .map(|i| IncomingSample::new("m", i as f64, NOW, Labels::new()))
            .collect();
        let err = f.pipeline.ingest(batch).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_accept_and_flush() {
        let f = fixture();
        f.registry
            .register(RegisterRequest::new("cpu", MetricKind::Gauge).with_labels(&["host"]))
            .await
            .unwrap();

        let report = f
            .pipeline
            .ingest(vec![IncomingSample::new("cpu", 0.5, NOW, host_labels("a"))])
            .await
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 0);
        assert_eq!(f.pipeline.buffered(), 1);

        let written = f.pipeline.flush().await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(f.pipeline.buffered(), 0);
        assert_eq!(f.store.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_success() {
        let f = fixture();
        f.registry
            .register(RegisterRequest::new("cpu", MetricKind::Gauge).with_labels(&["host"]))
            .await
            .unwrap();

        let report = f
            .pipeline
            .ingest(vec![
                IncomingSample::new("cpu", 0.5, NOW, host_labels("a")),
                IncomingSample::new("cpu", f64::NAN, NOW, host_labels("a")),
                IncomingSample::new("cpu", 0.7, NOW, host_labels("b")),
            ])
            .await
            .unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
        assert!(report.errors[0].reason.contains("finite"));
    }

    #[tokio::test]
    async fn test_label_schema_mismatch_names_offender() {
        let f = fixture();
        f.registry
            .register(RegisterRequest::new("cpu", MetricKind::Gauge).with_labels(&["host"]))
            .await
            .unwrap();

        // Extra label key
        let mut labels = host_labels("a");
        labels.insert("dc".to_string(), "x".to_string());
        let report = f
            .pipeline
            .ingest(vec![IncomingSample::new("cpu", 0.5, NOW, labels)])
            .await
            .unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected, 1);
        assert!(report.errors[0].reason.contains("dc"));

        // Missing label key
        let report = f
            .pipeline
            .ingest(vec![IncomingSample::new("cpu", 0.5, NOW, Labels::new())])
            .await
            .unwrap();
        assert_eq!(report.rejected, 1);
        assert!(report.errors[0].reason.contains("host"));
    }

    #[tokio::test]
    async fn test_timestamp_boundaries() {
        let f = fixture();
        f.registry
            .register(RegisterRequest::new("m", MetricKind::Gauge))
            .await
            .unwrap();

        let cases = [
            (NOW + MAX_SAMPLE_FUTURE_MS, true),
            (NOW + MAX_SAMPLE_FUTURE_MS + 1_000, false),
            (NOW - MAX_SAMPLE_AGE_MS, true),
            (NOW - MAX_SAMPLE_AGE_MS - 1_000, false),
        ];
        for (ts, should_accept) in cases {
            let report = f
                .pipeline
                .ingest(vec![IncomingSample::new("m", 1.0, ts, Labels::new())])
                .await
                .unwrap();
            assert_eq!(
                report.accepted == 1,
                should_accept,
                "timestamp {} acceptance mismatch",
                ts
            );
        }
    }

    #[tokio::test]
    async fn test_auto_registration() {
        let f = fixture();
        let report = f
            .pipeline
            .ingest(vec![IncomingSample::new(
                "brand_new",
                1.0,
                NOW,
                Labels::new(),
            )])
            .await
            .unwrap();
        assert_eq!(report.accepted, 1);

        let metric = f.registry.get_by_name("brand_new").await.unwrap().unwrap();
        assert_eq!(metric.kind, MetricKind::Gauge);
    }

    #[tokio::test]
    async fn test_flush_failure_reenqueues() {
        let f = fixture();
        f.registry
            .register(RegisterRequest::new("m", MetricKind::Gauge))
            .await
            .unwrap();
        f.pipeline
            .ingest(vec![IncomingSample::new("m", 1.0, NOW, Labels::new())])
            .await
            .unwrap();

        f.store.set_fail_upserts(true);
        assert!(f.pipeline.flush().await.is_err());
        assert_eq!(f.pipeline.buffered(), 1);
        assert_eq!(f.pipeline.stats().flush_failures, 1);

        // Next pass succeeds; nothing was lost
        f.store.set_fail_upserts(false);
        assert_eq!(f.pipeline.flush().await.unwrap(), 1);
        assert_eq!(f.store.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_drains_in_batches() {
        let f = fixture_with(
            IngestionConfig {
                batch_size: 10,
                ..Default::default()
            },
            CardinalityConfig::default(),
        );
        f.registry
            .register(RegisterRequest::new("m", MetricKind::Gauge))
            .await
            .unwrap();

        let batch: Vec<IncomingSample> = (0..35)
            .map(|i| IncomingSample::new("m", i as f64, NOW - i, Labels::new()))
            .collect();
        f.pipeline.ingest(batch).await.unwrap();

        assert_eq!(f.pipeline.flush().await.unwrap(), 35);
        assert_eq!(f.store.sample_count(), 35);
    }

    #[tokio::test]
    async fn test_cardinality_cap_blocks_sample() {
        let f = fixture_with(
            IngestionConfig::default(),
            CardinalityConfig {
                max_series_per_metric: 3,
                probes_per_minute: 100,
                ..Default::default()
            },
        );
        f.registry
            .register(RegisterRequest::new("m", MetricKind::Gauge).with_labels(&["k"]))
            .await
            .unwrap();

        for v in ["v1", "v2", "v3"] {
            let mut labels = Labels::new();
            labels.insert("k".to_string(), v.to_string());
            let report = f
                .pipeline
                .ingest(vec![IncomingSample::new("m", 1.0, NOW, labels)])
                .await
                .unwrap();
            assert_eq!(report.accepted, 1, "series {} should be accepted", v);
            f.pipeline.flush().await.unwrap();
            // Expire the cached estimate so the next probe sees fresh data
            f.clock.advance_ms(3_600_001);
        }

        let mut labels = Labels::new();
        labels.insert("k".to_string(), "v4".to_string());
        let report = f
            .pipeline
            .ingest(vec![IncomingSample::new("m", 1.0, NOW, labels)])
            .await
            .unwrap();
        assert_eq!(report.accepted, 0);
        assert!(report.errors[0].reason.contains("reached maximum cardinality"));
    }

    #[tokio::test]
    async fn test_stats_track_counts() {
        let f = fixture();
        f.registry
            .register(RegisterRequest::new("m", MetricKind::Gauge))
            .await
            .unwrap();

        f.pipeline
            .ingest(vec![
                IncomingSample::new("m", 1.0, NOW, Labels::new()),
                IncomingSample::new("m", f64::INFINITY, NOW, Labels::new()),
            ])
            .await
            .unwrap();
        f.pipeline.flush().await.unwrap();

        let stats = f.pipeline.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.flushed, 1);
        assert_eq!(stats.buffered, 0);
    }
}
