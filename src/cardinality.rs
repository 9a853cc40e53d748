//! Cardinality protection
//!
//! High-cardinality label sets are the classic way a metric store blows up:
//! memory exhaustion, index bloat, slow queries. The guard bounds the damage
//! per metric with a hard series cap and surfaces early warnings for label
//! keys that look like unique identifiers.
//!
//! The current cardinality of a metric is the count of distinct label
//! combinations observed in a trailing window, read from the store. Probes
//! are expensive, so results are cached for an hour and probe traffic is
//! rate-limited by one global token bucket shared across all metrics. When a
//! probe cannot run, the guard fails open on the count (cached value, else
//! zero) — but the hard-cap rejection only ever fires on a real count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::clock::SharedClock;
use crate::config::CardinalityConfig;
use crate::storage::MetricStore;
use crate::types::{Labels, Metric, MetricId};

/// Label-key substrings that usually mean unbounded value sets.
/// Matching keys raise warnings, never errors.
const HIGH_CARDINALITY_PATTERNS: &[&str] = &[
    "id",
    "uuid",
    "guid",
    "session",
    "request",
    "transaction",
    "user",
    "customer",
    "account",
    "email",
    "username",
    "ip",
    "address",
    "timestamp",
    "datetime",
    "random",
    "nonce",
    "token",
];

/// Estimate cache time-to-live: one hour
const ESTIMATE_TTL_MS: i64 = 3_600_000;

/// Outcome of a cardinality validation
#[derive(Debug, Clone)]
pub struct CardinalityCheck {
    /// Whether the sample may be ingested
    pub ok: bool,
    /// Best known distinct-series count for the metric
    pub current_cardinality: u64,
    /// Non-blocking advisories (high-cardinality key patterns, nearing cap)
    pub warnings: Vec<String>,
    /// Blocking failures
    pub errors: Vec<String>,
}

/// Cardinality summary for one metric
#[derive(Debug, Clone)]
pub struct MetricCardinalityStats {
    /// Best known distinct-series count
    pub current_cardinality: u64,
    /// Configured hard cap
    pub limit: u64,
    /// current / limit
    pub utilization: f64,
    /// When the count was last probed, epoch millis; None if never
    pub probed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct CachedEstimate {
    count: u64,
    fetched_at: i64,
}

/// Token bucket limiting cardinality probes across all metrics
///
/// Tokens are scaled by 1000 for sub-token precision; refill happens lazily
/// on acquire against the injected clock so tests are deterministic.
struct ProbeBucket {
    tokens_scaled: AtomicU64,
    max_tokens_scaled: u64,
    last_refill_ms: AtomicU64,
    rate_per_minute: u64,
}

impl ProbeBucket {
    const SCALE: u64 = 1000;

    fn new(rate_per_minute: u64, now_ms: i64) -> Self {
        let max_tokens_scaled = rate_per_minute.max(1) * Self::SCALE;
        Self {
            tokens_scaled: AtomicU64::new(max_tokens_scaled),
            max_tokens_scaled,
            last_refill_ms: AtomicU64::new(now_ms.max(0) as u64),
            rate_per_minute: rate_per_minute.max(1),
        }
    }

    fn try_acquire(&self, now_ms: i64) -> bool {
        let now_ms = now_ms.max(0) as u64;
        let last_ms = self.last_refill_ms.load(Ordering::Acquire);
        let elapsed_ms = now_ms.saturating_sub(last_ms);

        // Compute the refill at full precision rather than from a pre-rounded
        // per-ms rate; 10/min must not round up to 60/min.
        let tokens_to_add =
            elapsed_ms.saturating_mul(self.rate_per_minute * Self::SCALE) / 60_000;

        if tokens_to_add > 0
            && self
                .last_refill_ms
                .compare_exchange(last_ms, now_ms, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let _ = self
                .tokens_scaled
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |current| {
                    Some((current + tokens_to_add).min(self.max_tokens_scaled))
                });
        }

        self.tokens_scaled
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |tokens| {
                if tokens >= Self::SCALE {
                    Some(tokens - Self::SCALE)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Guard enforcing per-metric series caps
pub struct CardinalityGuard {
    config: CardinalityConfig,
    store: Arc<dyn MetricStore>,
    clock: SharedClock,
    estimates: RwLock<HashMap<MetricId, CachedEstimate>>,
    probe_bucket: ProbeBucket,
    probes: AtomicU64,
    probe_failures: AtomicU64,
    rate_limited: AtomicU64,
    rejections: AtomicU64,
}

impl CardinalityGuard {
    /// Create a guard over the given store
    pub fn new(config: CardinalityConfig, store: Arc<dyn MetricStore>, clock: SharedClock) -> Self {
        let bucket = ProbeBucket::new(config.probes_per_minute, clock.now_ms());
        Self {
            config,
            store,
            clock,
            estimates: RwLock::new(HashMap::new()),
            probe_bucket: bucket,
            probes: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Validate a sample's labels against the metric's cardinality budget.
    ///
    /// Checks run in order: label count, value lengths, high-cardinality key
    /// patterns (warn-only), then the estimated current cardinality against
    /// the cap. Structural failures skip the probe.
    pub async fn validate(&self, metric: &Metric, labels: &Labels) -> CardinalityCheck {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if labels.len() > self.config.max_labels_per_metric {
            errors.push(format!(
                "too many labels: {} exceeds maximum {}",
                labels.len(),
                self.config.max_labels_per_metric
            ));
        }

        for (key, value) in labels {
            if value.is_empty() {
                errors.push(format!("label '{}' has an empty value", key));
            } else if value.len() > self.config.max_label_value_length {
                errors.push(format!(
                    "label '{}' value length {} exceeds maximum {}",
                    key,
                    value.len(),
                    self.config.max_label_value_length
                ));
            }

            let lowered = key.to_ascii_lowercase();
            if let Some(pattern) = HIGH_CARDINALITY_PATTERNS
                .iter()
                .find(|p| lowered.contains(*p))
            {
                warnings.push(format!(
                    "label key '{}' matches high-cardinality pattern '{}'",
                    key, pattern
                ));
            }
        }

        if !errors.is_empty() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            return CardinalityCheck {
                ok: false,
                current_cardinality: 0,
                warnings,
                errors,
            };
        }

        let (current, is_real_count) = self.estimate(metric.id).await;

        if is_real_count && current >= self.config.max_series_per_metric {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            errors.push(format!(
                "metric '{}' has reached maximum cardinality ({} series, limit {})",
                metric.name, current, self.config.max_series_per_metric
            ));
        } else if current as f64
            > self.config.max_series_per_metric as f64 * self.config.warning_threshold
        {
            warnings.push(format!(
                "metric '{}' is nearing its cardinality limit ({} of {} series)",
                metric.name, current, self.config.max_series_per_metric
            ));
        }

        CardinalityCheck {
            ok: errors.is_empty(),
            current_cardinality: current,
            warnings,
            errors,
        }
    }

    /// Best known distinct-series count for a metric. The second element is
    /// true when the count came from the store (fresh or cached), false when
    /// it is the zero fallback.
    async fn estimate(&self, id: MetricId) -> (u64, bool) {
        let now = self.clock.now_ms();

        if let Some(cached) = self.estimates.read().get(&id) {
            if now - cached.fetched_at < ESTIMATE_TTL_MS {
                return (cached.count, true);
            }
        }

        if !self.probe_bucket.try_acquire(now) {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            return self.cached_fallback(id);
        }

        self.probes.fetch_add(1, Ordering::Relaxed);
        let since = now - (self.config.check_window_hours as i64) * 3_600_000;
        match self.store.count_distinct_series(id, since).await {
            Ok(count) => {
                self.estimates.write().insert(
                    id,
                    CachedEstimate {
                        count,
                        fetched_at: now,
                    },
                );
                (count, true)
            }
            Err(e) => {
                self.probe_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(metric_id = %id, error = %e, "Cardinality probe failed");
                self.cached_fallback(id)
            }
        }
    }

    /// Stale-cache-or-zero fallback when a probe cannot run
    fn cached_fallback(&self, id: MetricId) -> (u64, bool) {
        match self.estimates.read().get(&id) {
            Some(cached) => (cached.count, true),
            None => (0, false),
        }
    }

    /// Cardinality summary for one metric, from the cache
    pub fn stats(&self, id: MetricId) -> MetricCardinalityStats {
        let cached = self.estimates.read().get(&id).copied();
        let current = cached.map(|c| c.count).unwrap_or(0);
        MetricCardinalityStats {
            current_cardinality: current,
            limit: self.config.max_series_per_metric,
            utilization: current as f64 / self.config.max_series_per_metric as f64,
            probed_at: cached.map(|c| c.fetched_at),
        }
    }

    /// Drop expired estimate cache entries; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let mut estimates = self.estimates.write();
        let before = estimates.len();
        estimates.retain(|_, cached| now - cached.fetched_at < ESTIMATE_TTL_MS);
        before - estimates.len()
    }

    /// Total rejections issued by this guard
    pub fn rejection_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Total store probes executed
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Probes skipped because the token bucket was empty
    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }
}
