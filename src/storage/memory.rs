//! In-memory gateway implementations
//!
//! Complete implementations of [`MetricStore`] and [`ObjectStore`] backed by
//! process memory. Intended for:
//! - **Unit testing** without an external time-series store or object store
//! - **Integration testing** of the whole engine
//! - **Development and prototyping** new features
//!
//! All data is lost on drop; these are not production backends. Both stores
//! expose failure toggles so tests can exercise the engine's retry and
//! isolation paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{
    labels_json, ArchiveSegment, BucketRow, DataPoint, Labels, Metric, MetricId, Sample,
    TimeRange,
};

use super::{AggregateSource, MetricFilter, MetricStore, ObjectStore};

/// Ordered sample key: (time, metric, canonical labels JSON)
type SampleKey = (i64, MetricId, String);

/// In-memory time-series store
pub struct MemoryMetricStore {
    metrics: RwLock<HashMap<MetricId, Metric>>,
    names: RwLock<HashMap<String, MetricId>>,
    labels: RwLock<HashMap<MetricId, Vec<String>>>,
    /// BTreeMap keyed by (time, metric, labels) so ranged scans walk in
    /// time order, mirroring the hypertable's primary-key layout
    samples: RwLock<BTreeMap<SampleKey, Sample>>,
    segments: RwLock<Vec<ArchiveSegment>>,
    /// Test toggle: make upserts fail with a Transient error
    fail_upserts: AtomicBool,
    vacuum_requests: AtomicU64,
}

impl MemoryMetricStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            labels: RwLock::new(HashMap::new()),
            samples: RwLock::new(BTreeMap::new()),
            segments: RwLock::new(Vec::new()),
            fail_upserts: AtomicBool::new(false),
            vacuum_requests: AtomicU64::new(0),
        }
    }

    /// Toggle simulated upsert failure (tests)
    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    /// How many vacuum requests were received
    pub fn vacuum_requests(&self) -> u64 {
        self.vacuum_requests.load(Ordering::SeqCst)
    }

    /// Total stored sample rows (tests)
    pub fn sample_count(&self) -> usize {
        self.samples.read().len()
    }

    /// Recorded segments (tests)
    pub fn segments(&self) -> Vec<ArchiveSegment> {
        self.segments.read().clone()
    }

    fn matches_labels(sample_labels: &Labels, predicate: Option<&Labels>) -> bool {
        match predicate {
            None => true,
            Some(pred) => pred
                .iter()
                .all(|(k, v)| sample_labels.get(k).is_some_and(|sv| sv == v)),
        }
    }

    /// Samples of one metric inside `range` passing the label predicate,
    /// in time-ascending order.
    fn scan(
        &self,
        id: MetricId,
        range: TimeRange,
        predicate: Option<&Labels>,
    ) -> Vec<Sample> {
        let samples = self.samples.read();
        samples
            .range((range.start, MetricId(uuid::Uuid::nil()), String::new())..)
            .take_while(|((ts, _, _), _)| *ts < range.end)
            .filter(|((_, mid, _), _)| *mid == id)
            .filter(|(_, s)| Self::matches_labels(&s.labels, predicate))
            .map(|(_, s)| s.clone())
            .collect()
    }
}

impl Default for MemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn insert_metric(&self, metric: &Metric, label_keys: &[String]) -> Result<()> {
        let mut names = self.names.write();
        if names.contains_key(&metric.name) {
            return Err(Error::AlreadyExists(metric.name.clone()));
        }
        names.insert(metric.name.clone(), metric.id);
        self.metrics.write().insert(metric.id, metric.clone());
        self.labels.write().insert(metric.id, label_keys.to_vec());
        Ok(())
    }

    async fn metric_by_name(&self, name: &str) -> Result<Option<Metric>> {
        let names = self.names.read();
        Ok(names
            .get(name)
            .and_then(|id| self.metrics.read().get(id).cloned()))
    }

    async fn metric_by_id(&self, id: MetricId) -> Result<Option<Metric>> {
        Ok(self.metrics.read().get(&id).cloned())
    }

    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<Metric>> {
        let mut out: Vec<Metric> = self
            .metrics
            .read()
            .values()
            .filter(|m| !filter.active_only || m.is_active)
            .filter(|m| {
                filter
                    .name_contains
                    .as_deref()
                    .map_or(true, |frag| m.name.contains(frag))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update_metric(
        &self,
        id: MetricId,
        retention_days: Option<u32>,
        is_active: Option<bool>,
        updated_at: i64,
    ) -> Result<Metric> {
        let mut metrics = self.metrics.write();
        let metric = metrics
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let Some(days) = retention_days {
            metric.retention_days = days;
        }
        if let Some(active) = is_active {
            metric.is_active = active;
        }
        metric.updated_at = updated_at;
        Ok(metric.clone())
    }

    async fn label_keys(&self, id: MetricId) -> Result<Vec<String>> {
        Ok(self.labels.read().get(&id).cloned().unwrap_or_default())
    }

    async fn all_metrics(&self) -> Result<Vec<(Metric, Vec<String>)>> {
        let metrics = self.metrics.read();
        let labels = self.labels.read();
        Ok(metrics
            .values()
            .map(|m| {
                (
                    m.clone(),
                    labels.get(&m.id).cloned().unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn upsert_samples(&self, samples: &[Sample]) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::Storage("simulated upsert failure".to_string()));
        }
        let mut store = self.samples.write();
        for sample in samples {
            let key = (
                sample.timestamp,
                sample.metric_id,
                labels_json(&sample.labels),
            );
            store.insert(key, sample.clone());
        }
        Ok(())
    }

    async fn read_raw(
        &self,
        id: MetricId,
        range: TimeRange,
        labels: Option<&Labels>,
        limit: usize,
    ) -> Result<Vec<DataPoint>> {
        let mut points: Vec<DataPoint> = self
            .scan(id, range, labels)
            .into_iter()
            .map(|s| DataPoint::with_labels(s.timestamp, s.value, s.labels))
            .collect();
        points.reverse(); // newest first
        points.truncate(limit);
        Ok(points)
    }

    async fn bucket(
        &self,
        id: MetricId,
        interval_ms: i64,
        range: TimeRange,
        labels: Option<&Labels>,
        _source: AggregateSource,
    ) -> Result<Vec<BucketRow>> {
        if interval_ms <= 0 {
            return Err(Error::bad_input("interval", "must be positive"));
        }
        // Buckets align to the range start; the rollup views carry the same
        // contract so the source only changes which materialization is read.
        let mut buckets: BTreeMap<i64, (f64, f64, f64, u64)> = BTreeMap::new();
        for sample in self.scan(id, range, labels) {
            let offset = sample.timestamp - range.start;
            let bucket = range.start + (offset / interval_ms) * interval_ms;
            let entry = buckets
                .entry(bucket)
                .or_insert((0.0, f64::INFINITY, f64::NEG_INFINITY, 0));
            entry.0 += sample.value;
            entry.1 = entry.1.min(sample.value);
            entry.2 = entry.2.max(sample.value);
            entry.3 += 1;
        }
        Ok(buckets
            .into_iter()
            .map(|(bucket, (sum, min, max, count))| BucketRow {
                bucket,
                avg: sum / count as f64,
                sum,
                min,
                max,
                count,
            })
            .collect())
    }

    async fn percentile(
        &self,
        id: MetricId,
        quantile: f64,
        range: TimeRange,
        labels: Option<&Labels>,
    ) -> Result<Option<f64>> {
        let mut values: Vec<f64> = self
            .scan(id, range, labels)
            .into_iter()
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        // Continuous (interpolated) quantile, matching percentile_cont
        let rank = quantile.clamp(0.0, 1.0) * (values.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            return Ok(Some(values[lo]));
        }
        let frac = rank - lo as f64;
        Ok(Some(values[lo] + (values[hi] - values[lo]) * frac))
    }

    async fn count_distinct_series(&self, id: MetricId, since: i64) -> Result<u64> {
        let samples = self.samples.read();
        let distinct: HashSet<&str> = samples
            .range((since, MetricId(uuid::Uuid::nil()), String::new())..)
            .filter(|((_, mid, _), _)| *mid == id)
            .map(|((_, _, labels), _)| labels.as_str())
            .collect();
        Ok(distinct.len() as u64)
    }

    async fn delete_range_batched(
        &self,
        id: MetricId,
        range: TimeRange,
        batch_size: usize,
    ) -> Result<u64> {
        let mut deleted = 0u64;
        loop {
            let keys: Vec<SampleKey> = {
                let samples = self.samples.read();
                samples
                    .range((range.start, MetricId(uuid::Uuid::nil()), String::new())..)
                    .take_while(|((ts, _, _), _)| *ts < range.end)
                    .filter(|((_, mid, _), _)| *mid == id)
                    .take(batch_size.max(1))
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            if keys.is_empty() {
                return Ok(deleted);
            }
            let mut samples = self.samples.write();
            for key in keys {
                if samples.remove(&key).is_some() {
                    deleted += 1;
                }
            }
        }
    }

    async fn metrics_with_data_before(&self, cutoff: i64) -> Result<Vec<MetricId>> {
        let samples = self.samples.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for ((ts, id, _), _) in samples.iter() {
            if *ts >= cutoff {
                break;
            }
            if seen.insert(*id) {
                out.push(*id);
            }
        }
        Ok(out)
    }

    async fn sample_page(
        &self,
        id: MetricId,
        range: TimeRange,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<Sample>> {
        let samples = self.samples.read();
        Ok(samples
            .range((range.start, MetricId(uuid::Uuid::nil()), String::new())..)
            .take_while(|((ts, _, _), _)| *ts < range.end)
            .filter(|((_, mid, _), _)| *mid == id)
            .skip(offset)
            .take(page_size)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn insert_segment(&self, segment: &ArchiveSegment) -> Result<()> {
        let mut segments = self.segments.write();
        let duplicate = segments.iter().any(|s| {
            s.metric_id == segment.metric_id
                && s.start_time == segment.start_time
                && s.end_time == segment.end_time
        });
        if duplicate {
            return Err(Error::Storage(format!(
                "segment for metric {} at {} already recorded",
                segment.metric_id, segment.start_time
            )));
        }
        segments.push(segment.clone());
        Ok(())
    }

    async fn segment_exists(&self, id: MetricId, day_start: i64) -> Result<bool> {
        Ok(self
            .segments
            .read()
            .iter()
            .any(|s| s.metric_id == id && s.start_time == day_start))
    }

    async fn segments_overlapping(
        &self,
        id: MetricId,
        range: TimeRange,
    ) -> Result<Vec<ArchiveSegment>> {
        let mut out: Vec<ArchiveSegment> = self
            .segments
            .read()
            .iter()
            .filter(|s| s.metric_id == id && s.start_time < range.end && range.start < s.end_time)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.start_time);
        Ok(out)
    }

    async fn request_vacuum(&self) -> Result<()> {
        self.vacuum_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory object store
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, HashMap<String, Bytes>>>,
    /// Test toggle: make puts fail with a Transient error
    fail_puts: AtomicBool,
}

impl MemoryObjectStore {
    /// Create an empty object store with the given bucket pre-created
    pub fn with_bucket(bucket: &str) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(bucket.to_string(), HashMap::new());
        Self {
            buckets: RwLock::new(buckets),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Toggle simulated put failure (tests)
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Keys currently stored in a bucket (tests)
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .get(bucket)
            .map(|objs| {
                let mut keys: Vec<String> = objs.keys().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }

    /// Overwrite an object directly, bypassing put failure toggles (tests)
    pub fn corrupt_object(&self, bucket: &str, key: &str, data: Bytes) {
        if let Some(objs) = self.buckets.write().get_mut(bucket) {
            objs.insert(key.to_string(), data);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Error::ObjectStore("simulated put failure".to_string()));
        }
        let mut buckets = self.buckets.write();
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objs| objs.get(key).cloned())
            .ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, key)))
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.read().contains_key(bucket))
    }
}
