//! Configuration management for the metric store
//!
//! TOML file support with environment variable overrides and sensible
//! defaults for every tunable the engine recognizes. Loading always ends in
//! [`Config::validate`], so a config that parses but makes no sense (a batch
//! larger than its buffer, a cold tier shorter than the hot one) is rejected
//! with the field that is wrong.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Ingestion pipeline tuning
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Cardinality protection
    #[serde(default)]
    pub cardinality: CardinalityConfig,

    /// Hot-tier retention
    #[serde(default)]
    pub hot_tier: HotTierConfig,

    /// Cold-tier archival
    #[serde(default)]
    pub cold_tier: ColdTierConfig,

    /// Query limits
    #[serde(default)]
    pub query: QueryConfig,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Maximum buffered samples before an immediate flush is triggered;
    /// also the maximum accepted batch size
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: usize,

    /// Scheduled flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Samples drained per storage write
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,

    /// Worker threads hint for the hosting runtime
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Cardinality guard configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CardinalityConfig {
    /// Hard cap on distinct series per metric in the check window
    #[serde(default = "default_max_series_per_metric")]
    pub max_series_per_metric: u64,

    /// Maximum labels per metric
    #[serde(default = "default_max_labels_per_metric")]
    pub max_labels_per_metric: usize,

    /// Maximum label value length
    #[serde(default = "default_max_label_value_length")]
    pub max_label_value_length: usize,

    /// Fraction of the cap that raises a warning (0.0 to 1.0)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Trailing window for the distinct-series count, in hours
    #[serde(default = "default_check_window_hours")]
    pub check_window_hours: u64,

    /// Cardinality probes allowed per minute, shared across all metrics
    #[serde(default = "default_probes_per_minute")]
    pub probes_per_minute: u64,
}

/// Hot-tier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotTierConfig {
    /// Days of data kept uncompressed and query-fast
    #[serde(default = "default_hot_retention_days")]
    pub retention_days: u32,

    /// Days after which the store may compress chunks in place
    #[serde(default = "default_compression_after_days")]
    pub compression_after_days: u32,
}

/// Cold-tier archival configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColdTierConfig {
    /// Whether the archival job runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Age in days past which samples move to the archive
    #[serde(default = "default_cold_retention_days")]
    pub retention_days: u32,

    /// Page size for archival reads and deletes
    #[serde(default = "default_archival_batch_size")]
    pub batch_size: usize,

    /// Throttle sleep between archived days, milliseconds
    #[serde(default = "default_delay_between_batches_ms")]
    pub delay_between_batches_ms: u64,

    /// Metrics archived in parallel within one group
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Archived-row count past which an incremental vacuum is requested
    #[serde(default = "default_vacuum_threshold_rows")]
    pub vacuum_threshold_rows: u64,

    /// Local hour (0-23) at which the daily run fires
    #[serde(default = "default_schedule_hour")]
    pub schedule_hour: u32,

    /// Object-store bucket for archive segments
    #[serde(default = "default_archive_bucket")]
    pub bucket: String,
}

/// Query planner configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Raw-query point limit when the caller gives none
    #[serde(default = "default_query_limit")]
    pub default_limit: usize,

    /// Largest accepted raw-query limit
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Overall request timeout in seconds
    #[serde(default = "default_query_timeout_seconds")]
    pub timeout_seconds: u64,
}

// Default value functions
fn default_buffer_max_size() -> usize {
    10_000
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_ingest_batch_size() -> usize {
    1_000
}
fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_series_per_metric() -> u64 {
    10_000
}
fn default_max_labels_per_metric() -> usize {
    10
}
fn default_max_label_value_length() -> usize {
    100
}
fn default_warning_threshold() -> f64 {
    0.8
}
fn default_check_window_hours() -> u64 {
    24
}
fn default_probes_per_minute() -> u64 {
    10
}
fn default_hot_retention_days() -> u32 {
    10
}
fn default_compression_after_days() -> u32 {
    7
}
fn default_cold_retention_days() -> u32 {
    30
}
fn default_archival_batch_size() -> usize {
    5_000
}
fn default_delay_between_batches_ms() -> u64 {
    1_000
}
fn default_max_concurrent_uploads() -> usize {
    3
}
fn default_vacuum_threshold_rows() -> u64 {
    100_000
}
fn default_schedule_hour() -> u32 {
    2
}
fn default_archive_bucket() -> String {
    "tideline-archive".to_string()
}
fn default_query_limit() -> usize {
    100
}
fn default_max_limit() -> usize {
    10_000
}
fn default_query_timeout_seconds() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            buffer_max_size: default_buffer_max_size(),
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_ingest_batch_size(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            max_series_per_metric: default_max_series_per_metric(),
            max_labels_per_metric: default_max_labels_per_metric(),
            max_label_value_length: default_max_label_value_length(),
            warning_threshold: default_warning_threshold(),
            check_window_hours: default_check_window_hours(),
            probes_per_minute: default_probes_per_minute(),
        }
    }
}

impl Default for HotTierConfig {
    fn default() -> Self {
        Self {
            retention_days: default_hot_retention_days(),
            compression_after_days: default_compression_after_days(),
        }
    }
}

impl Default for ColdTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_cold_retention_days(),
            batch_size: default_archival_batch_size(),
            delay_between_batches_ms: default_delay_between_batches_ms(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            vacuum_threshold_rows: default_vacuum_threshold_rows(),
            schedule_hour: default_schedule_hour(),
            bucket: default_archive_bucket(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_max_limit(),
            timeout_seconds: default_query_timeout_seconds(),
        }
    }
}

impl Config {
    /// Read, parse, and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            Error::bad_input("config", format!("{} is not valid TOML: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::from_file`], with environment overrides applied on top
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TIDELINE_BUFFER_MAX_SIZE") {
            if let Ok(n) = v.parse() {
                self.ingestion.buffer_max_size = n;
            }
        }
        if let Ok(v) = std::env::var("TIDELINE_FLUSH_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.ingestion.flush_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("TIDELINE_MAX_SERIES_PER_METRIC") {
            if let Ok(n) = v.parse() {
                self.cardinality.max_series_per_metric = n;
            }
        }
        if let Ok(v) = std::env::var("TIDELINE_COLD_ENABLED") {
            if let Ok(b) = v.parse() {
                self.cold_tier.enabled = b;
            }
        }
        if let Ok(v) = std::env::var("TIDELINE_ARCHIVE_BUCKET") {
            self.cold_tier.bucket = v;
        }
    }

    /// Reject configurations that parse but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.ingestion.buffer_max_size == 0 {
            return Err(Error::bad_input(
                "ingestion.buffer_max_size",
                "must be greater than zero",
            ));
        }
        if self.ingestion.batch_size == 0 {
            return Err(Error::bad_input(
                "ingestion.batch_size",
                "must be greater than zero",
            ));
        }
        if self.ingestion.batch_size > self.ingestion.buffer_max_size {
            return Err(Error::bad_input(
                "ingestion.batch_size",
                format!(
                    "{} exceeds buffer_max_size {}",
                    self.ingestion.batch_size, self.ingestion.buffer_max_size
                ),
            ));
        }
        if self.cardinality.max_series_per_metric == 0 {
            return Err(Error::bad_input(
                "cardinality.max_series_per_metric",
                "must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.cardinality.warning_threshold) {
            return Err(Error::bad_input(
                "cardinality.warning_threshold",
                format!(
                    "{} is outside [0, 1]",
                    self.cardinality.warning_threshold
                ),
            ));
        }
        if self.hot_tier.retention_days == 0 {
            return Err(Error::bad_input(
                "hot_tier.retention_days",
                "must be greater than zero",
            ));
        }
        if self.cold_tier.retention_days < self.hot_tier.retention_days {
            return Err(Error::bad_input(
                "cold_tier.retention_days",
                format!(
                    "{} is shorter than hot_tier.retention_days {}",
                    self.cold_tier.retention_days, self.hot_tier.retention_days
                ),
            ));
        }
        if self.cold_tier.max_concurrent_uploads == 0 {
            return Err(Error::bad_input(
                "cold_tier.max_concurrent_uploads",
                "must be greater than zero",
            ));
        }
        if self.cold_tier.schedule_hour > 23 {
            return Err(Error::bad_input(
                "cold_tier.schedule_hour",
                format!("{} is not an hour of the day", self.cold_tier.schedule_hour),
            ));
        }
        if self.cold_tier.bucket.is_empty() {
            return Err(Error::bad_input("cold_tier.bucket", "must not be empty"));
        }
        if self.query.default_limit == 0 || self.query.max_limit == 0 {
            return Err(Error::bad_input(
                "query.default_limit",
                "limits must be greater than zero",
            ));
        }
        if self.query.default_limit > self.query.max_limit {
            return Err(Error::bad_input(
                "query.default_limit",
                format!(
                    "{} exceeds max_limit {}",
                    self.query.default_limit, self.query.max_limit
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ingestion.buffer_max_size, 10_000);
        assert_eq!(config.ingestion.flush_interval_ms, 5_000);
        assert_eq!(config.cardinality.max_series_per_metric, 10_000);
        assert_eq!(config.hot_tier.retention_days, 10);
        assert_eq!(config.cold_tier.retention_days, 30);
        assert!(config.cold_tier.enabled);
        assert_eq!(config.query.default_limit, 100);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_batch_size() {
        let mut config = Config::default();
        config.ingestion.batch_size = config.ingestion.buffer_max_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cold_retention_shorter_than_hot() {
        let mut config = Config::default();
        config.cold_tier.retention_days = 5; // hot default is 10
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("TIDELINE_BUFFER_MAX_SIZE", "20000");
        let config = Config::from_env().unwrap();
        assert_eq!(config.ingestion.buffer_max_size, 20_000);
        std::env::remove_var("TIDELINE_BUFFER_MAX_SIZE");
    }

    #[test]
    fn test_validation_error_names_field() {
        let mut config = Config::default();
        config.cold_tier.schedule_hour = 99;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadInput);
        assert!(err.to_string().contains("cold_tier.schedule_hour"));
    }

    #[test]
    fn test_from_file_missing_path() {
        let err = Config::from_file("/nonexistent/tideline.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [ingestion]
            buffer_max_size = 500

            [cold_tier]
            enabled = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.ingestion.buffer_max_size, 500);
        assert_eq!(config.ingestion.batch_size, 1_000); // default preserved
        assert!(!config.cold_tier.enabled);
    }
}
