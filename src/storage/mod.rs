//! Storage gateway contracts
//!
//! The engine talks to two external systems through the traits here: a
//! time-series store with hypertable-like semantics (`MetricStore`) and an
//! object store for archived segments (`ObjectStore`). Production backends
//! live outside this crate; [`memory`] provides complete in-memory
//! implementations for tests, development, and prototyping.

pub mod memory;

pub use memory::{MemoryMetricStore, MemoryObjectStore};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{
    ArchiveSegment, BucketRow, DataPoint, Labels, Metric, MetricId, RollupGranularity, Sample,
    TimeRange,
};

/// Which materialization a bucketed read should scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateSource {
    /// The raw sample hypertable
    Raw,
    /// One of the pre-computed continuous aggregates
    Rollup(RollupGranularity),
}

/// Filter for metric listing
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    /// Only return metrics with the active flag set
    pub active_only: bool,
    /// Case-sensitive substring match on the name
    pub name_contains: Option<String>,
}

/// Contract to the time-series store
///
/// The store owns the `metrics`, `metric_labels`, and `cold_storage_metadata`
/// tables plus the daily-chunked sample hypertable with its (time, metric,
/// labels) primary key and GIN-indexed labels column. All reads that take a
/// label predicate treat it as "series labels contain all given pairs".
#[async_trait]
pub trait MetricStore: Send + Sync + 'static {
    // --- metric definitions -------------------------------------------------

    /// Atomically check name uniqueness and insert the metric row together
    /// with its label-key rows. Returns `AlreadyExists` on a duplicate name.
    async fn insert_metric(&self, metric: &Metric, label_keys: &[String]) -> Result<()>;

    /// Look up a metric by its unique name
    async fn metric_by_name(&self, name: &str) -> Result<Option<Metric>>;

    /// Look up a metric by id
    async fn metric_by_id(&self, id: MetricId) -> Result<Option<Metric>>;

    /// List metrics matching the filter
    async fn list_metrics(&self, filter: &MetricFilter) -> Result<Vec<Metric>>;

    /// Update retention and/or active flag; returns the stored row.
    /// Returns `NotFound` for an unknown id.
    async fn update_metric(
        &self,
        id: MetricId,
        retention_days: Option<u32>,
        is_active: Option<bool>,
        updated_at: i64,
    ) -> Result<Metric>;

    /// Label-schema keys registered for a metric
    async fn label_keys(&self, id: MetricId) -> Result<Vec<String>>;

    /// Every metric with its label keys, for cache preload
    async fn all_metrics(&self) -> Result<Vec<(Metric, Vec<String>)>>;

    // --- samples ------------------------------------------------------------

    /// Per-row upsert on the (time, metric, labels) primary key:
    /// last write wins on exact key collision.
    async fn upsert_samples(&self, samples: &[Sample]) -> Result<()>;

    /// Raw samples in `range`, newest first, truncated to `limit`
    async fn read_raw(
        &self,
        id: MetricId,
        range: TimeRange,
        labels: Option<&Labels>,
        limit: usize,
    ) -> Result<Vec<DataPoint>>;

    /// Bucketed statistics over `range`, bucket starts ascending
    async fn bucket(
        &self,
        id: MetricId,
        interval_ms: i64,
        range: TimeRange,
        labels: Option<&Labels>,
        source: AggregateSource,
    ) -> Result<Vec<BucketRow>>;

    /// Continuous (interpolated) quantile of values in `range`;
    /// None when the range holds no samples
    async fn percentile(
        &self,
        id: MetricId,
        quantile: f64,
        range: TimeRange,
        labels: Option<&Labels>,
    ) -> Result<Option<f64>>;

    /// Count of distinct label combinations for a metric since `since`
    async fn count_distinct_series(&self, id: MetricId, since: i64) -> Result<u64>;

    /// Delete samples in `range` a page at a time until none remain;
    /// returns the number of deleted rows
    async fn delete_range_batched(
        &self,
        id: MetricId,
        range: TimeRange,
        batch_size: usize,
    ) -> Result<u64>;

    /// Metric ids that still have samples older than `cutoff`
    async fn metrics_with_data_before(&self, cutoff: i64) -> Result<Vec<MetricId>>;

    /// One page of samples in `range`, ordered by time ascending
    async fn sample_page(
        &self,
        id: MetricId,
        range: TimeRange,
        offset: usize,
        page_size: usize,
    ) -> Result<Vec<Sample>>;

    // --- archive metadata ---------------------------------------------------

    /// Record a finished archive segment
    async fn insert_segment(&self, segment: &ArchiveSegment) -> Result<()>;

    /// Whether a segment already covers (metric, day starting at `day_start`)
    async fn segment_exists(&self, id: MetricId, day_start: i64) -> Result<bool>;

    /// Segments whose [start, end) intersects `range`, ordered by start
    async fn segments_overlapping(
        &self,
        id: MetricId,
        range: TimeRange,
    ) -> Result<Vec<ArchiveSegment>>;

    // --- maintenance --------------------------------------------------------

    /// Fire-and-forget incremental vacuum hint after heavy deletes
    async fn request_vacuum(&self) -> Result<()> {
        Ok(())
    }
}

/// Contract to the object store holding archive segments
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store an object, replacing any existing one under the same key
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<()>;

    /// Fetch an object; `NotFound` when the key does not exist
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Whether the bucket exists and is reachable
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;
}
