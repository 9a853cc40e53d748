//! Cold-storage archival
//!
//! Moves aged samples out of the hot store into an object store, one
//! gzip-compressed JSON file per (metric, UTC calendar day), and serves them
//! back for queries that reach past the hot tier.
//!
//! The daily job is single-flight (an atomic compare-and-set turns away a
//! second caller), idempotent across restarts (days already covered by a
//! recorded segment are skipped), and isolates failures at day granularity:
//! one bad day is logged and the job moves on. Hot-store deletion runs only
//! after the segment is durably uploaded and its metadata row recorded, and
//! a failed delete is deliberately non-fatal — the rows remain covered by
//! the segment and cleanup retries on the next run.

mod service;

pub use service::ArchivalService;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::ColdTierConfig;
use crate::error::{Error, Result};
use crate::storage::{MetricStore, ObjectStore};
use crate::types::{labels_json, ArchiveSegment, Labels, MetricId, Sample, TimeRange};

/// Milliseconds in one UTC day
const DAY_MS: i64 = 86_400_000;

/// Start of the UTC calendar day containing `ts`
fn day_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(DAY_MS)
}

/// One element of an archive file
///
/// Labels are a JSON object serialized as a string — a second level of
/// encoding kept for format stability. The reader also accepts a native
/// object so a future migration stays compatible.
#[derive(Debug, Serialize, Deserialize)]
struct ArchiveRecord {
    timestamp: i64,
    metric_id: String,
    value: f64,
    labels: serde_json::Value,
}

/// Counters exposed by the archival subsystem
#[derive(Debug, Clone)]
pub struct ArchivalStats {
    /// Samples moved to cold storage over the engine's lifetime
    pub total_rows_archived: u64,
    /// Compressed bytes written to the object store
    pub total_bytes_archived: u64,
    /// Segments recorded
    pub segments_written: u64,
    /// Days that failed and will be retried next run
    pub failed_days: u64,
    /// When the last job finished, epoch millis
    pub last_run_at: Option<i64>,
    /// Error recorded by the last job, if any
    pub last_error: Option<String>,
    /// Whether a job is in flight right now
    pub running: bool,
}

/// Archival engine over the metric store and object store
pub struct ArchivalEngine {
    config: ColdTierConfig,
    store: Arc<dyn MetricStore>,
    objects: Arc<dyn ObjectStore>,
    clock: SharedClock,
    running: AtomicBool,
    rows_archived: AtomicU64,
    bytes_archived: AtomicU64,
    segments_written: AtomicU64,
    failed_days: AtomicU64,
    last_run_at: Mutex<Option<i64>>,
    last_error: Mutex<Option<String>>,
}

impl ArchivalEngine {
    /// Create an engine over the given stores
    pub fn new(
        config: ColdTierConfig,
        store: Arc<dyn MetricStore>,
        objects: Arc<dyn ObjectStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            store,
            objects,
            clock,
            running: AtomicBool::new(false),
            rows_archived: AtomicU64::new(0),
            bytes_archived: AtomicU64::new(0),
            segments_written: AtomicU64::new(0),
            failed_days: AtomicU64::new(0),
            last_run_at: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Timestamp before which samples belong in the archive
    pub fn cutoff(&self) -> i64 {
        self.clock.now_ms() - (self.config.retention_days as i64) * DAY_MS
    }

    /// Run one archival pass. Returns immediately when archival is disabled
    /// or another run is already in flight. Never propagates an error to the
    /// scheduler; failures are recorded in the stats.
    pub async fn run_archival_job(&self) {
        if !self.config.enabled {
            tracing::debug!("Archival disabled, skipping run");
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Archival already running, skipping run");
            return;
        }

        let started = self.clock.now_ms();
        tracing::info!("Archival job started");

        match self.run_inner().await {
            Ok(rows) => {
                *self.last_error.lock() = None;
                tracing::info!(rows, "Archival job finished");
            }
            Err(e) => {
                tracing::error!(error = %e, "Archival job failed");
                *self.last_error.lock() = Some(e.to_string());
            }
        }

        *self.last_run_at.lock() = Some(started);
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_inner(&self) -> Result<u64> {
        if !self.objects.bucket_exists(&self.config.bucket).await? {
            return Err(Error::ObjectStore(format!(
                "archive bucket '{}' does not exist",
                self.config.bucket
            )));
        }

        let cutoff = self.cutoff();
        let metric_ids = self.store.metrics_with_data_before(cutoff).await?;
        if metric_ids.is_empty() {
            return Ok(0);
        }
        tracing::debug!(metrics = metric_ids.len(), cutoff, "Archival candidates found");

        let mut total_rows = 0u64;
        // Sequential groups, parallel metrics within a group, bounds the
        // number of in-flight uploads
        for group in metric_ids.chunks(self.config.max_concurrent_uploads.max(1)) {
            let results =
                futures::future::join_all(group.iter().map(|id| self.archive_metric(*id, cutoff)))
                    .await;
            for (id, result) in group.iter().zip(results) {
                match result {
                    Ok(rows) => total_rows += rows,
                    Err(e) => {
                        tracing::warn!(metric_id = %id, error = %e, "Metric archival failed");
                    }
                }
            }
        }

        if total_rows > self.config.vacuum_threshold_rows {
            tracing::debug!(rows = total_rows, "Requesting incremental vacuum");
            if let Err(e) = self.store.request_vacuum().await {
                tracing::warn!(error = %e, "Vacuum request failed");
            }
        }

        Ok(total_rows)
    }

    /// Archive every complete day of one metric older than the cutoff
    async fn archive_metric(&self, id: MetricId, cutoff: i64) -> Result<u64> {
        // Earliest surviving sample bounds the day walk
        let scan_range = TimeRange::new(0, cutoff)?;
        let first = self.store.sample_page(id, scan_range, 0, 1).await?;
        let Some(earliest) = first.first() else {
            return Ok(0);
        };

        let mut rows = 0u64;
        let mut day = day_start(earliest.timestamp);
        let last_day = day_start(cutoff);

        while day < last_day {
            let day_range = TimeRange::new(day, (day + DAY_MS).min(cutoff))?;
            match self.archive_day(id, day, day_range).await {
                Ok(day_rows) => rows += day_rows,
                Err(e) => {
                    self.failed_days.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        metric_id = %id,
                        day,
                        error = %e,
                        "Day archival failed, will retry next run"
                    );
                }
            }
            day += DAY_MS;

            if day < last_day && self.config.delay_between_batches_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delay_between_batches_ms))
                    .await;
            }
        }

        Ok(rows)
    }

    /// Pack, upload, record, and clean up one (metric, day)
    async fn archive_day(&self, id: MetricId, day: i64, range: TimeRange) -> Result<u64> {
        if self.store.segment_exists(id, day).await? {
            // Day already covered; retry any hot-store cleanup that failed
            // on a previous run
            let full_day = TimeRange::new(day, day + DAY_MS)?;
            if let Err(e) = self
                .store
                .delete_range_batched(id, full_day, self.config.batch_size.max(1))
                .await
            {
                tracing::warn!(metric_id = %id, day, error = %e, "Deferred cleanup failed");
            }
            return Ok(0);
        }

        let mut samples = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = self
                .store
                .sample_page(id, range, offset, self.config.batch_size.max(1))
                .await?;
            let fetched = page.len();
            samples.extend(page);
            if fetched < self.config.batch_size.max(1) {
                break;
            }
            offset += fetched;
        }
        if samples.is_empty() {
            return Ok(0);
        }

        let (payload, uncompressed_len, label_keys) = pack_segment(&samples)?;
        let compressed_len = payload.len() as u64;
        let date = Utc
            .timestamp_millis_opt(day)
            .single()
            .ok_or_else(|| Error::Internal(format!("day {} out of range", day)))?
            .format("%Y-%m-%d");
        let object_path = format!("metrics/{}/{}.json.gz", id, date);

        self.objects
            .put_object(&self.config.bucket, &object_path, payload, "application/gzip")
            .await?;

        let segment = ArchiveSegment {
            id: Uuid::new_v4(),
            metric_id: id,
            start_time: day,
            end_time: day + DAY_MS,
            object_path: object_path.clone(),
            file_format: "json.gz".to_string(),
            file_size_bytes: compressed_len,
            row_count: samples.len() as u64,
            compression_ratio: if compressed_len > 0 {
                uncompressed_len as f64 / compressed_len as f64
            } else {
                0.0
            },
            labels_index: label_keys,
            created_at: self.clock.now_ms(),
        };
        self.store.insert_segment(&segment).await?;

        self.rows_archived.fetch_add(samples.len() as u64, Ordering::Relaxed);
        self.bytes_archived.fetch_add(compressed_len, Ordering::Relaxed);
        self.segments_written.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            metric_id = %id,
            path = %object_path,
            rows = samples.len(),
            bytes = compressed_len,
            "Segment archived"
        );

        // Rows are covered by the segment from here on; a failed delete
        // leaves duplicates that the next run cleans up
        let full_day = TimeRange::new(day, day + DAY_MS)?;
        if let Err(e) = self
            .store
            .delete_range_batched(id, full_day, self.config.batch_size.max(1))
            .await
        {
            tracing::warn!(metric_id = %id, day, error = %e, "Hot-store cleanup failed");
        }

        Ok(samples.len() as u64)
    }

    /// Stream archived samples of one metric overlapping `range`, ordered by
    /// time within and across segments. Each segment is downloaded lazily as
    /// the stream reaches it; a segment that fails to download or parse
    /// yields nothing and is logged.
    pub async fn query_archive(
        &self,
        id: MetricId,
        range: TimeRange,
    ) -> Result<BoxStream<'static, Sample>> {
        let segments = self.store.segments_overlapping(id, range).await?;
        tracing::debug!(metric_id = %id, segments = segments.len(), "Archive read planned");

        let objects = self.objects.clone();
        let bucket = self.config.bucket.clone();
        let stream = futures::stream::iter(segments)
            .then(move |segment| {
                let objects = objects.clone();
                let bucket = bucket.clone();
                async move { read_segment(objects, &bucket, &segment, range).await }
            })
            .map(futures::stream::iter)
            .flatten()
            .boxed();
        Ok(stream)
    }

    /// Counter snapshot
    pub fn stats(&self) -> ArchivalStats {
        ArchivalStats {
            total_rows_archived: self.rows_archived.load(Ordering::Relaxed),
            total_bytes_archived: self.bytes_archived.load(Ordering::Relaxed),
            segments_written: self.segments_written.load(Ordering::Relaxed),
            failed_days: self.failed_days.load(Ordering::Relaxed),
            last_run_at: *self.last_run_at.lock(),
            last_error: self.last_error.lock().clone(),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Whether a job is currently in flight
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Serialize samples as a gzip JSON array. Returns the payload, the
/// uncompressed length, and the distinct label keys seen.
fn pack_segment(samples: &[Sample]) -> Result<(Bytes, usize, Vec<String>)> {
    let mut label_keys: Vec<String> = Vec::new();
    let records: Vec<ArchiveRecord> = samples
        .iter()
        .map(|s| {
            for key in s.labels.keys() {
                if !label_keys.contains(key) {
                    label_keys.push(key.clone());
                }
            }
            ArchiveRecord {
                timestamp: s.timestamp,
                metric_id: s.metric_id.to_string(),
                value: s.value,
                labels: serde_json::Value::String(labels_json(&s.labels)),
            }
        })
        .collect();
    label_keys.sort();

    let json = serde_json::to_vec(&records)?;
    let uncompressed_len = json.len();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|compressed| (Bytes::from(compressed), uncompressed_len, label_keys))
        .map_err(|e| Error::Serialization(format!("gzip failed: {}", e)))
}

/// Download and decode one segment; errors yield an empty slice
async fn read_segment(
    objects: Arc<dyn ObjectStore>,
    bucket: &str,
    segment: &ArchiveSegment,
    range: TimeRange,
) -> Vec<Sample> {
    let payload = match objects.get_object(bucket, &segment.object_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %segment.object_path, error = %e, "Segment download failed");
            return Vec::new();
        }
    };

    match unpack_segment(&payload, range) {
        Ok(samples) => samples,
        Err(e) => {
            tracing::warn!(path = %segment.object_path, error = %e, "Segment parse failed, treating as empty");
            Vec::new()
        }
    }
}

/// Gunzip and parse one segment, keeping samples inside `range` in time order
fn unpack_segment(payload: &[u8], range: TimeRange) -> Result<Vec<Sample>> {
    let mut decoder = GzDecoder::new(payload);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| Error::Serialization(format!("gunzip failed: {}", e)))?;

    let records: Vec<ArchiveRecord> = serde_json::from_slice(&json)?;

    let mut samples = Vec::with_capacity(records.len());
    for record in records {
        if !range.contains(record.timestamp) {
            continue;
        }
        let metric_id = MetricId::parse(&record.metric_id)
            .map_err(|_| Error::Serialization(format!("bad metric id '{}'", record.metric_id)))?;
        let labels = parse_archived_labels(&record.labels)?;
        samples.push(Sample {
            timestamp: record.timestamp,
            metric_id,
            value: record.value,
            labels,
        });
    }
    samples.sort_by_key(|s| s.timestamp);
    Ok(samples)
}

/// Accept both the stringified historical form and a native JSON object
fn parse_archived_labels(value: &serde_json::Value) -> Result<Labels> {
    match value {
        serde_json::Value::String(inner) => {
            serde_json::from_str(inner).map_err(|e| Error::Serialization(e.to_string()))
        }
        serde_json::Value::Object(_) => {
            serde_json::from_value(value.clone()).map_err(|e| Error::Serialization(e.to_string()))
        }
        other => Err(Error::Serialization(format!(
            "labels must be a JSON object or string, got {}",
            other
        ))),
    }
}
