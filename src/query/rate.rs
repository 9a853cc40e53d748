//! Counter rate computation
//!
//! Turns raw counter samples into per-point rates by differencing
//! consecutive samples within each series. A counter that shrinks between
//! two samples has reset; the new value is taken as the amount accrued since
//! the reset, so rates never go negative.

use std::collections::BTreeMap;

use crate::types::{labels_json, DataPoint};

/// Per-series counter differencing
pub struct RateEngine;

impl RateEngine {
    /// Compute per-point rates from raw samples, in points per second.
    ///
    /// Input order does not matter; samples are grouped into series by their
    /// label set and ordered by time within each series. The first sample of
    /// every series produces no output. Results are flattened across series
    /// and returned newest first.
    pub fn compute(points: &[DataPoint]) -> Vec<DataPoint> {
        let mut series: BTreeMap<String, Vec<&DataPoint>> = BTreeMap::new();
        for point in points {
            series.entry(labels_json(&point.labels)).or_default().push(point);
        }

        let mut rates = Vec::new();
        for (_, mut samples) in series {
            samples.sort_by_key(|p| p.timestamp);

            for pair in samples.windows(2) {
                let (prev, curr) = (pair[0], pair[1]);
                let dt_seconds = (curr.timestamp - prev.timestamp) as f64 / 1000.0;
                if dt_seconds <= 0.0 {
                    continue;
                }

                let delta = if curr.value >= prev.value {
                    curr.value - prev.value
                } else {
                    // Counter reset: the current value is what accrued since
                    curr.value
                };

                rates.push(DataPoint::with_labels(
                    curr.timestamp,
                    delta / dt_seconds,
                    curr.labels.clone(),
                ));
            }
        }

        rates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    fn point(ts: i64, value: f64) -> DataPoint {
        DataPoint::new(ts, value)
    }

    fn labeled(ts: i64, value: f64, host: &str) -> DataPoint {
        let mut labels = Labels::new();
        labels.insert("host".to_string(), host.to_string());
        DataPoint::with_labels(ts, value, labels)
    }

    #[test]
    fn test_simple_rate() {
        let t = 1_700_000_000_000;
        let points = vec![point(t, 10.0), point(t + 10_000, 30.0)];
        let rates = RateEngine::compute(&points);
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].timestamp, t + 10_000);
        assert!((rates[0].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_detection() {
        // 10 -> 30 -> 5: the drop to 5 is a reset, rate = 5 / 10s
        let t = 1_700_000_000_000;
        let points = vec![
            point(t, 10.0),
            point(t + 10_000, 30.0),
            point(t + 20_000, 5.0),
        ];
        let rates = RateEngine::compute(&points);
        assert_eq!(rates.len(), 2);
        // Newest first
        assert_eq!(rates[0].timestamp, t + 20_000);
        assert!((rates[0].value - 0.5).abs() < 1e-9);
        assert_eq!(rates[1].timestamp, t + 10_000);
        assert!((rates[1].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_never_negative() {
        let t = 1_700_000_000_000;
        let points = vec![
            point(t, 100.0),
            point(t + 1_000, 50.0),
            point(t + 2_000, 0.0),
            point(t + 3_000, 75.0),
        ];
        for rate in RateEngine::compute(&points) {
            assert!(rate.value >= 0.0, "negative rate {}", rate.value);
        }
    }

    #[test]
    fn test_series_are_independent() {
        let t = 1_700_000_000_000;
        let points = vec![
            labeled(t, 10.0, "a"),
            labeled(t + 1_000, 20.0, "a"),
            labeled(t + 500, 100.0, "b"),
            labeled(t + 1_500, 300.0, "b"),
        ];
        let rates = RateEngine::compute(&points);
        assert_eq!(rates.len(), 2);

        let a = rates.iter().find(|r| r.labels["host"] == "a").unwrap();
        let b = rates.iter().find(|r| r.labels["host"] == "b").unwrap();
        assert!((a.value - 10.0).abs() < 1e-9);
        assert!((b.value - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_sample_yields_nothing() {
        let points = vec![point(1_700_000_000_000, 42.0)];
        assert!(RateEngine::compute(&points).is_empty());
    }

    #[test]
    fn test_unordered_input() {
        let t = 1_700_000_000_000;
        let points = vec![point(t + 10_000, 30.0), point(t, 10.0)];
        let rates = RateEngine::compute(&points);
        assert_eq!(rates.len(), 1);
        assert!((rates[0].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_timestamps_skipped() {
        let t = 1_700_000_000_000;
        let points = vec![point(t, 10.0), point(t, 20.0), point(t + 1_000, 30.0)];
        let rates = RateEngine::compute(&points);
        // The zero-dt pair contributes nothing
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].timestamp, t + 1_000);
    }
}
