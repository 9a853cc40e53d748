//! Core data types used throughout the metric store
//!
//! # Key Types
//!
//! - **`Metric`**: a registered metric definition (name, kind, label schema)
//! - **`MetricId`**: opaque 128-bit metric identifier (UUID v4)
//! - **`Sample`**: a single ingested measurement (time, metric, value, labels)
//! - **`SeriesKey`**: (metric, labels) identity of one time series
//! - **`TimeRange`**: half-open query window `[start, end)` in epoch millis
//! - **`Aggregation`** / **`Interval`**: query-language atoms
//! - **`ArchiveSegment`**: metadata row for one archived calendar day
//!
//! Labels are kept in a `BTreeMap` so their serialized JSON form is canonical:
//! two label sets are the same series iff their canonical JSON is equal, which
//! is also the storage primary-key comparison.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum metric name length
pub const MAX_NAME_LENGTH: usize = 255;
/// Maximum metric description length
pub const MAX_DESCRIPTION_LENGTH: usize = 1000;
/// Maximum metric unit length
pub const MAX_UNIT_LENGTH: usize = 100;
/// Maximum label key length
pub const MAX_LABEL_KEY_LENGTH: usize = 100;
/// Maximum label value length
pub const MAX_LABEL_VALUE_LENGTH: usize = 100;
/// Maximum number of labels per metric
pub const MAX_LABELS_PER_METRIC: usize = 10;
/// Minimum retention in days
pub const MIN_RETENTION_DAYS: u32 = 1;
/// Maximum retention in days (5 years)
pub const MAX_RETENTION_DAYS: u32 = 1825;
/// Default retention in days
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Oldest accepted sample age in milliseconds (365 days)
pub const MAX_SAMPLE_AGE_MS: i64 = 365 * 24 * 3600 * 1000;
/// Furthest accepted sample future skew in milliseconds (5 minutes)
pub const MAX_SAMPLE_FUTURE_MS: i64 = 300 * 1000;

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.-]*$").expect("metric name regex"));
static LABEL_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").expect("label key regex"));

/// Validate a metric name against the naming rules.
pub fn validate_metric_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::bad_input("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::bad_input(
            "name",
            format!("length {} exceeds maximum {}", name.len(), MAX_NAME_LENGTH),
        ));
    }
    if !METRIC_NAME_RE.is_match(name) {
        return Err(Error::bad_input(
            "name",
            format!("'{}' does not match ^[a-zA-Z][a-zA-Z0-9_.-]*$", name),
        ));
    }
    Ok(())
}

/// Validate a label key against the naming rules.
pub fn validate_label_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::bad_input("label key", "must not be empty"));
    }
    if key.len() > MAX_LABEL_KEY_LENGTH {
        return Err(Error::bad_input(
            "label key",
            format!(
                "'{}' length {} exceeds maximum {}",
                key,
                key.len(),
                MAX_LABEL_KEY_LENGTH
            ),
        ));
    }
    if !LABEL_KEY_RE.is_match(key) {
        return Err(Error::bad_input(
            "label key",
            format!("'{}' does not match ^[a-zA-Z][a-zA-Z0-9_]*$", key),
        ));
    }
    Ok(())
}

/// Unique identifier for a metric definition
///
/// Opaque 128-bit identifier backed by UUID v4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(pub Uuid);

impl MetricId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the canonical hyphenated string form
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::bad_input("metric id", format!("'{}' is not a valid UUID", s)))
    }
}

impl Default for MetricId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metric kind
///
/// Behavior branches on the kind in exactly one place today: RATE queries are
/// restricted to counters. Histogram and Summary register and ingest as plain
/// values; they have no dedicated ingest path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    /// Monotonically increasing value, resets allowed
    Counter,
    /// Point-in-time value
    Gauge,
    /// Distribution sketch (registration only)
    Histogram,
    /// Quantile summary (registration only)
    Summary,
}

impl MetricKind {
    /// Whether RATE queries are meaningful for this kind
    pub fn supports_rate(&self) -> bool {
        matches!(self, MetricKind::Counter)
    }

    /// Canonical uppercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "COUNTER",
            MetricKind::Gauge => "GAUGE",
            MetricKind::Histogram => "HISTOGRAM",
            MetricKind::Summary => "SUMMARY",
        }
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COUNTER" => Ok(MetricKind::Counter),
            "GAUGE" => Ok(MetricKind::Gauge),
            "HISTOGRAM" => Ok(MetricKind::Histogram),
            "SUMMARY" => Ok(MetricKind::Summary),
            other => Err(Error::bad_input(
                "type",
                format!("'{}' is not one of COUNTER, GAUGE, HISTOGRAM, SUMMARY", other),
            )),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label set for a sample or query predicate
///
/// BTreeMap keeps key order deterministic so the JSON rendering is canonical.
pub type Labels = BTreeMap<String, String>;

/// Render a label set as canonical JSON (sorted keys, no whitespace).
pub fn labels_json(labels: &Labels) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "{}".to_string())
}

/// A registered metric definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Unique identifier
    pub id: MetricId,
    /// Globally unique name
    pub name: String,
    /// Metric kind
    pub kind: MetricKind,
    /// Optional human description
    pub description: Option<String>,
    /// Optional unit string (e.g. "celsius", "requests")
    pub unit: Option<String>,
    /// Hot-tier retention in days
    pub retention_days: u32,
    /// Soft-delete flag: inactive metrics reject ingest and lookups
    pub is_active: bool,
    /// Creation time, epoch millis
    pub created_at: i64,
    /// Last modification time, epoch millis
    pub updated_at: i64,
}

/// A single measurement accepted into the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Epoch millis
    pub timestamp: i64,
    /// Owning metric
    pub metric_id: MetricId,
    /// Finite measurement value
    pub value: f64,
    /// Label values, exactly the metric's label schema keys
    pub labels: Labels,
}

impl Sample {
    /// The series this sample belongs to
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            metric_id: self.metric_id,
            labels: self.labels.clone(),
        }
    }
}

/// (metric, labels) identity of one time series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Owning metric
    pub metric_id: MetricId,
    /// Label values
    pub labels: Labels,
}

/// Half-open time window `[start, end)` in epoch millis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp, inclusive
    pub start: i64,
    /// End timestamp, exclusive
    pub end: i64,
}

impl TimeRange {
    /// Create a range, rejecting start > end
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(Error::bad_input(
                "time range",
                format!("start {} is after end {}", start, end),
            ));
        }
        Ok(Self { start, end })
    }

    /// Whether a timestamp falls inside `[start, end)`
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Range span in milliseconds
    pub fn span_ms(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether two ranges share any time point
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection of two ranges, or None when disjoint
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(TimeRange { start, end })
        } else {
            None
        }
    }
}

/// One output point of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Epoch millis
    pub timestamp: i64,
    /// Point value
    pub value: f64,
    /// Labels of the contributing series (empty for merged aggregates)
    #[serde(default)]
    pub labels: Labels,
}

impl DataPoint {
    /// Create a point without labels
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            labels: Labels::new(),
        }
    }

    /// Create a labeled point
    pub fn with_labels(timestamp: i64, value: f64, labels: Labels) -> Self {
        Self {
            timestamp,
            value,
            labels,
        }
    }
}

/// One row of a bucketed aggregate read
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    /// Bucket start, epoch millis
    pub bucket: i64,
    /// Mean of values in the bucket
    pub avg: f64,
    /// Sum of values in the bucket
    pub sum: f64,
    /// Minimum value in the bucket
    pub min: f64,
    /// Maximum value in the bucket
    pub max: f64,
    /// Number of samples in the bucket
    pub count: u64,
}

/// Requested aggregation for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    /// Sum per bucket
    Sum,
    /// Mean per bucket
    Avg,
    /// Minimum per bucket
    Min,
    /// Maximum per bucket
    Max,
    /// Sample count per bucket
    Count,
    /// Counter rate (counters only)
    Rate,
    /// 50th percentile over the whole range
    P50,
    /// 75th percentile over the whole range
    P75,
    /// 90th percentile over the whole range
    P90,
    /// 95th percentile over the whole range
    P95,
    /// 99th percentile over the whole range
    P99,
}

impl Aggregation {
    /// The quantile in [0, 1] for percentile aggregations, None otherwise
    pub fn quantile(&self) -> Option<f64> {
        match self {
            Aggregation::P50 => Some(0.50),
            Aggregation::P75 => Some(0.75),
            Aggregation::P90 => Some(0.90),
            Aggregation::P95 => Some(0.95),
            Aggregation::P99 => Some(0.99),
            _ => None,
        }
    }

    /// Whether this is one of the bucketable statistics
    pub fn is_bucketable(&self) -> bool {
        matches!(
            self,
            Aggregation::Sum
                | Aggregation::Avg
                | Aggregation::Min
                | Aggregation::Max
                | Aggregation::Count
        )
    }

    /// Canonical uppercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVG",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Count => "COUNT",
            Aggregation::Rate => "RATE",
            Aggregation::P50 => "P50",
            Aggregation::P75 => "P75",
            Aggregation::P90 => "P90",
            Aggregation::P95 => "P95",
            Aggregation::P99 => "P99",
        }
    }
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUM" => Ok(Aggregation::Sum),
            "AVG" => Ok(Aggregation::Avg),
            "MIN" => Ok(Aggregation::Min),
            "MAX" => Ok(Aggregation::Max),
            "COUNT" => Ok(Aggregation::Count),
            "RATE" => Ok(Aggregation::Rate),
            "P50" => Ok(Aggregation::P50),
            "P75" => Ok(Aggregation::P75),
            "P90" => Ok(Aggregation::P90),
            "P95" => Ok(Aggregation::P95),
            "P99" => Ok(Aggregation::P99),
            other => Err(Error::bad_input(
                "aggregation",
                format!("unknown aggregation '{}'", other),
            )),
        }
    }
}

static INTERVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([smhd])$").expect("interval regex"));

/// Pre-aggregated rollup granularities kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupGranularity {
    /// 5-minute continuous aggregate
    FiveMinutes,
    /// 1-hour continuous aggregate
    OneHour,
    /// 1-day continuous aggregate
    OneDay,
}

/// A parsed bucketing interval, e.g. `15m`, `1h`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Magnitude
    pub value: u64,
    /// Unit character: s, m, h, d
    pub unit: char,
}

impl Interval {
    /// Parse `^\d+[smhd]$`, rejecting zero
    pub fn parse(s: &str) -> Result<Self> {
        let caps = INTERVAL_RE.captures(s).ok_or_else(|| {
            Error::bad_input(
                "interval",
                format!("'{}' does not match ^\\d+[smhd]$ (e.g. 5m, 1h)", s),
            )
        })?;
        let value: u64 = caps[1]
            .parse()
            .map_err(|_| Error::bad_input("interval", format!("'{}' magnitude overflows", s)))?;
        if value == 0 {
            return Err(Error::bad_input("interval", "must be greater than zero"));
        }
        let unit = caps[2].chars().next().unwrap_or('s');
        Ok(Self { value, unit })
    }

    /// Build from a whole number of seconds (whole-range buckets)
    pub fn from_seconds(secs: u64) -> Self {
        Self {
            value: secs.max(1),
            unit: 's',
        }
    }

    /// Interval length in milliseconds
    pub fn as_millis(&self) -> i64 {
        let secs = match self.unit {
            's' => self.value,
            'm' => self.value * 60,
            'h' => self.value * 3600,
            'd' => self.value * 86_400,
            _ => self.value,
        };
        (secs as i64).saturating_mul(1000)
    }

    /// Matching pre-computed rollup, if this is a standard interval
    pub fn rollup(&self) -> Option<RollupGranularity> {
        match (self.value, self.unit) {
            (5, 'm') => Some(RollupGranularity::FiveMinutes),
            (1, 'h') => Some(RollupGranularity::OneHour),
            (1, 'd') => Some(RollupGranularity::OneDay),
            _ => None,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

/// Metadata row for one archived (metric, calendar day) segment
///
/// Covers the closed-open UTC day `[start_time, end_time)`. Never mutated
/// after creation; at most one exists per (metric, day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSegment {
    /// Segment id
    pub id: Uuid,
    /// Owning metric
    pub metric_id: MetricId,
    /// UTC day start, epoch millis
    pub start_time: i64,
    /// UTC day end (start + 24h), epoch millis
    pub end_time: i64,
    /// Object key, `metrics/<metricId>/<YYYY-MM-DD>.json.gz`
    pub object_path: String,
    /// File format tag, `json.gz`
    pub file_format: String,
    /// Compressed size in bytes
    pub file_size_bytes: u64,
    /// Number of archived samples
    pub row_count: u64,
    /// Uncompressed / compressed size ratio
    pub compression_ratio: f64,
    /// Distinct label keys observed in the segment
    pub labels_index: Vec<String>,
    /// Creation time, epoch millis
    pub created_at: i64,
}
