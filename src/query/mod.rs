//! Query planning and execution
//!
//! Routes a query to the cheapest path that answers it: raw reads, the
//! pre-computed rollup views for standard intervals, the store's percentile
//! function, or the rate engine for counters. Ranges that reach past the hot
//! tier fan out to the archive and merge both tiers before shaping the
//! response.
//!
//! Caps: bucketed reads return at most 1000 buckets and are cut off after a
//! 5 second hard timeout; raw reads honor the configured point limit.
//! Results are always ordered newest first.

mod rate;

pub use rate::RateEngine;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::archive::ArchivalEngine;
use crate::clock::SharedClock;
use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::registry::MetricRegistry;
use crate::storage::{AggregateSource, MetricStore};
use crate::types::{
    labels_json, Aggregation, BucketRow, DataPoint, Interval, Labels, Metric, TimeRange,
};

/// Milliseconds in one day
const DAY_MS: i64 = 86_400_000;
/// Widest accepted query span: 90 days
const MAX_SPAN_MS: i64 = 90 * DAY_MS;
/// Most buckets a single query may return
const MAX_BUCKETS: i64 = 1_000;
/// Hard timeout for aggregation paths
const AGGREGATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A query as handed over by the transport layer
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Metric name
    pub metric_name: String,
    /// Range start, epoch millis; defaults to end − 24 h
    pub start_time: Option<i64>,
    /// Range end, epoch millis; defaults to now
    pub end_time: Option<i64>,
    /// Requested aggregation; None returns raw samples
    pub aggregation: Option<Aggregation>,
    /// Bucketing interval, e.g. "15m"
    pub interval: Option<String>,
    /// Label predicate: series must carry all given pairs
    pub labels: Option<Labels>,
    /// Point limit for raw reads
    pub limit: Option<usize>,
}

/// Shaped query result
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Metric name
    pub metric: String,
    /// Data points, newest first
    pub data: Vec<DataPoint>,
    /// Echo of the requested aggregation
    pub aggregation: Option<Aggregation>,
    /// Echo of the requested interval
    pub interval: Option<String>,
    /// Number of returned points
    pub total_points: usize,
}

/// Planner over the hot store and the archive
pub struct QueryPlanner {
    config: QueryConfig,
    hot_retention_days: u32,
    registry: Arc<MetricRegistry>,
    store: Arc<dyn MetricStore>,
    archive: Arc<ArchivalEngine>,
    clock: SharedClock,
}

impl QueryPlanner {
    /// Create a planner over the given collaborators
    pub fn new(
        config: QueryConfig,
        hot_retention_days: u32,
        registry: Arc<MetricRegistry>,
        store: Arc<dyn MetricStore>,
        archive: Arc<ArchivalEngine>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            hot_retention_days,
            registry,
            store,
            archive,
            clock,
        }
    }

    /// Plan and execute one query
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        if request.metric_name.is_empty() {
            return Err(Error::bad_input("metric_name", "must not be empty"));
        }

        let metric = self
            .registry
            .get_by_name(&request.metric_name)
            .await?
            .ok_or_else(|| Error::NotFound(request.metric_name.clone()))?;

        let now = self.clock.now_ms();
        let end = request.end_time.unwrap_or(now);
        let start = request.start_time.unwrap_or(end - DAY_MS);
        if start >= end {
            return Err(Error::bad_input(
                "time range",
                format!("start {} must be before end {}", start, end),
            ));
        }
        let range = TimeRange::new(start, end)?;
        if range.span_ms() > MAX_SPAN_MS {
            return Err(Error::bad_input(
                "time range",
                format!("span {}ms exceeds the 90 day maximum", range.span_ms()),
            ));
        }

        let limit = match request.limit {
            Some(0) => return Err(Error::bad_input("limit", "must be greater than zero")),
            Some(n) => n.min(self.config.max_limit),
            None => self.config.default_limit,
        };

        let interval = match &request.interval {
            Some(raw) => Some(Interval::parse(raw)?),
            None => None,
        };

        let overall = Duration::from_secs(self.config.timeout_seconds.max(1));
        let data = tokio::time::timeout(
            overall,
            self.route(&metric, &request, range, interval, limit),
        )
        .await
        .map_err(|_| Error::Timeout {
            elapsed_ms: overall.as_millis() as u64,
            advice: "narrow the time range or raise the query timeout".to_string(),
        })??;

        tracing::debug!(
            metric = %metric.name,
            points = data.len(),
            aggregation = ?request.aggregation,
            "Query served"
        );

        let total_points = data.len();
        Ok(QueryResponse {
            metric: metric.name,
            data,
            aggregation: request.aggregation,
            interval: request.interval,
            total_points,
        })
    }

    async fn route(
        &self,
        metric: &Metric,
        request: &QueryRequest,
        range: TimeRange,
        interval: Option<Interval>,
        limit: usize,
    ) -> Result<Vec<DataPoint>> {
        match request.aggregation {
            None => {
                let mut points = self
                    .merged_raw(metric, range, request.labels.as_ref(), limit)
                    .await?;
                points.truncate(limit);
                Ok(points)
            }

            Some(Aggregation::Rate) => {
                if !metric.kind.supports_rate() {
                    return Err(Error::bad_input(
                        "aggregation",
                        format!(
                            "RATE requires a COUNTER metric; '{}' is a {}",
                            metric.name, metric.kind
                        ),
                    ));
                }
                let points = self
                    .merged_raw(metric, range, request.labels.as_ref(), self.config.max_limit)
                    .await?;
                let mut rates = RateEngine::compute(&points);
                rates.truncate(limit);
                Ok(rates)
            }

            Some(agg) if agg.quantile().is_some() => {
                let quantile = agg.quantile().unwrap_or(0.5);
                self.percentile_point(metric, quantile, range, request.labels.as_ref())
                    .await
            }

            Some(agg) if agg.is_bucketable() => {
                // Whole range as one bucket when no interval is given; the
                // bucket width is expressed in whole seconds, the single
                // form the bucket function accepts
                let bucket_interval = interval.unwrap_or_else(|| {
                    Interval::from_seconds((range.span_ms() / 1000).max(1) as u64)
                });
                self.bucketed(metric, agg, bucket_interval, range, request.labels.as_ref())
                    .await
            }

            Some(agg) => Err(Error::bad_input(
                "aggregation",
                format!("{} is not supported here", agg.as_str()),
            )),
        }
    }

    /// Raw points from the hot tier merged with the archived portion of the
    /// range, deduplicated on (time, labels), newest first.
    async fn merged_raw(
        &self,
        metric: &Metric,
        range: TimeRange,
        labels: Option<&Labels>,
        fetch_limit: usize,
    ) -> Result<Vec<DataPoint>> {
        let hot = self
            .store
            .read_raw(metric.id, range, labels, fetch_limit)
            .await?;

        let archived = self.archived_points(metric, range, labels).await?;
        if archived.is_empty() {
            return Ok(hot);
        }

        // Archived rows first so a hot row wins on a shared key
        let mut merged: BTreeMap<(i64, String), DataPoint> = BTreeMap::new();
        for point in archived.into_iter().chain(hot) {
            merged.insert((point.timestamp, labels_json(&point.labels)), point);
        }
        Ok(merged.into_values().rev().collect())
    }

    /// Archived points for the part of `range` older than the hot tier
    async fn archived_points(
        &self,
        metric: &Metric,
        range: TimeRange,
        labels: Option<&Labels>,
    ) -> Result<Vec<DataPoint>> {
        let hot_cutoff = self.clock.now_ms() - (self.hot_retention_days as i64) * DAY_MS;
        let Some(archived_range) = range.intersect(&TimeRange {
            start: i64::MIN,
            end: hot_cutoff,
        }) else {
            return Ok(Vec::new());
        };

        let stream = self.archive.query_archive(metric.id, archived_range).await?;
        let samples: Vec<_> = stream.collect().await;
        Ok(samples
            .into_iter()
            .filter(|s| match labels {
                None => true,
                Some(pred) => pred
                    .iter()
                    .all(|(k, v)| s.labels.get(k).is_some_and(|sv| sv == v)),
            })
            .map(|s| DataPoint::with_labels(s.timestamp, s.value, s.labels))
            .collect())
    }

    /// Percentile over the whole range: one point at the range end
    async fn percentile_point(
        &self,
        metric: &Metric,
        quantile: f64,
        range: TimeRange,
        labels: Option<&Labels>,
    ) -> Result<Vec<DataPoint>> {
        let hot_cutoff = self.clock.now_ms() - (self.hot_retention_days as i64) * DAY_MS;

        let value = tokio::time::timeout(AGGREGATION_TIMEOUT, async {
            if range.start >= hot_cutoff {
                // Entirely hot: the store computes the interpolated quantile
                self.store.percentile(metric.id, quantile, range, labels).await
            } else {
                // Fan out and interpolate over both tiers
                let mut values: Vec<f64> = self
                    .merged_raw(metric, range, labels, self.config.max_limit)
                    .await?
                    .into_iter()
                    .map(|p| p.value)
                    .collect();
                if values.is_empty() {
                    return Ok(None);
                }
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let rank = quantile.clamp(0.0, 1.0) * (values.len() - 1) as f64;
                let lo = rank.floor() as usize;
                let hi = rank.ceil() as usize;
                let value = if lo == hi {
                    values[lo]
                } else {
                    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
                };
                Ok(Some(value))
            }
        })
        .await
        .map_err(|_| Error::Timeout {
            elapsed_ms: AGGREGATION_TIMEOUT.as_millis() as u64,
            advice: "narrow the time range".to_string(),
        })??;

        // The single output point sits at the requested range end
        Ok(value
            .map(|v| vec![DataPoint::new(range.end, v)])
            .unwrap_or_default())
    }

    /// Bucketed statistics, merged across tiers, newest bucket first
    async fn bucketed(
        &self,
        metric: &Metric,
        aggregation: Aggregation,
        interval: Interval,
        range: TimeRange,
        labels: Option<&Labels>,
    ) -> Result<Vec<DataPoint>> {
        let interval_ms = interval.as_millis();
        let expected = (range.span_ms() + interval_ms - 1) / interval_ms;
        if expected > MAX_BUCKETS {
            return Err(Error::ResourceExhausted(format!(
                "query would return {} buckets, more than the {} cap; widen the interval or narrow the range",
                expected, MAX_BUCKETS
            )));
        }

        // Standard intervals hit the matching continuous aggregate
        let source = match interval.rollup() {
            Some(granularity) => AggregateSource::Rollup(granularity),
            None => AggregateSource::Raw,
        };

        let rows = tokio::time::timeout(AGGREGATION_TIMEOUT, async {
            let hot = self
                .store
                .bucket(metric.id, interval_ms, range, labels, source)
                .await?;
            let archived = self.archived_points(metric, range, labels).await?;
            if archived.is_empty() {
                return Ok::<_, Error>(hot);
            }
            Ok(merge_bucket_rows(hot, &archived, range.start, interval_ms))
        })
        .await
        .map_err(|_| Error::Timeout {
            elapsed_ms: AGGREGATION_TIMEOUT.as_millis() as u64,
            advice: "widen the interval or narrow the range".to_string(),
        })??;

        let mut points: Vec<DataPoint> = rows
            .into_iter()
            .map(|row| {
                let value = match aggregation {
                    Aggregation::Sum => row.sum,
                    Aggregation::Avg => row.avg,
                    Aggregation::Min => row.min,
                    Aggregation::Max => row.max,
                    Aggregation::Count => row.count as f64,
                    _ => row.avg,
                };
                DataPoint::new(row.bucket, value)
            })
            .collect();
        points.reverse(); // rows arrive oldest first
        Ok(points)
    }
}

/// Fold archived points into bucket rows computed from the hot tier.
/// Bucket alignment matches the store: buckets start at the range start.
fn merge_bucket_rows(
    hot: Vec<BucketRow>,
    archived: &[DataPoint],
    range_start: i64,
    interval_ms: i64,
) -> Vec<BucketRow> {
    let mut by_bucket: BTreeMap<i64, BucketRow> = hot.into_iter().map(|r| (r.bucket, r)).collect();

    for point in archived {
        let offset = point.timestamp - range_start;
        let bucket = range_start + (offset / interval_ms) * interval_ms;
        let entry = by_bucket.entry(bucket).or_insert(BucketRow {
            bucket,
            avg: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        });
        entry.sum += point.value;
        entry.min = entry.min.min(point.value);
        entry.max = entry.max.max(point.value);
        entry.count += 1;
        entry.avg = entry.sum / entry.count as f64;
    }

    by_bucket.into_values().collect()
}
