//! Metric registry with write-through cache
//!
//! Owns metric definitions and their label schemas. Lookups by name are the
//! ingest hot path, so the registry keeps a process-wide concurrent cache in
//! front of the store. The cache is a monotonic mirror: every mutation goes
//! to the store first and the cache entry is refreshed (or removed, on
//! soft-delete) before the call returns, so a subsequent read can never see a
//! stale definition.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::storage::{MetricFilter, MetricStore};
use crate::types::{
    validate_label_key, validate_metric_name, Metric, MetricId, MetricKind,
    DEFAULT_RETENTION_DAYS, MAX_DESCRIPTION_LENGTH, MAX_LABELS_PER_METRIC, MAX_RETENTION_DAYS,
    MAX_UNIT_LENGTH, MIN_RETENTION_DAYS,
};

/// A metric registration request
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Metric name (globally unique)
    pub name: String,
    /// Metric kind
    pub kind: MetricKind,
    /// Optional description
    pub description: Option<String>,
    /// Optional unit
    pub unit: Option<String>,
    /// Label schema keys
    pub labels: Vec<String>,
    /// Hot-tier retention; defaults to 30 days
    pub retention_days: Option<u32>,
}

impl RegisterRequest {
    /// Minimal request: name + kind, no labels
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            unit: None,
            labels: Vec::new(),
            retention_days: None,
        }
    }

    /// Set the label schema
    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Registry over the metric store with an in-memory cache
pub struct MetricRegistry {
    store: Arc<dyn MetricStore>,
    clock: SharedClock,
    /// name -> active metric definition
    by_name: DashMap<String, Metric>,
    /// id -> name, to invalidate by id
    names_by_id: DashMap<MetricId, String>,
    /// id -> label schema keys
    labels_by_id: DashMap<MetricId, Vec<String>>,
}

impl MetricRegistry {
    /// Create a registry over the given store
    pub fn new(store: Arc<dyn MetricStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            by_name: DashMap::new(),
            names_by_id: DashMap::new(),
            labels_by_id: DashMap::new(),
        }
    }

    /// Validate and register a new metric. Duplicate names fail with
    /// `AlreadyExists`; the metric row and label rows land atomically.
    pub async fn register(&self, request: RegisterRequest) -> Result<Metric> {
        validate_metric_name(&request.name)?;

        if let Some(desc) = &request.description {
            if desc.len() > MAX_DESCRIPTION_LENGTH {
                return Err(Error::bad_input(
                    "description",
                    format!("length {} exceeds maximum {}", desc.len(), MAX_DESCRIPTION_LENGTH),
                ));
            }
        }
        if let Some(unit) = &request.unit {
            if unit.len() > MAX_UNIT_LENGTH {
                return Err(Error::bad_input(
                    "unit",
                    format!("length {} exceeds maximum {}", unit.len(), MAX_UNIT_LENGTH),
                ));
            }
        }

        let retention = request.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&retention) {
            return Err(Error::bad_input(
                "retention_days",
                format!(
                    "{} is outside [{}, {}]",
                    retention, MIN_RETENTION_DAYS, MAX_RETENTION_DAYS
                ),
            ));
        }

        if request.labels.len() > MAX_LABELS_PER_METRIC {
            return Err(Error::bad_input(
                "labels",
                format!(
                    "{} label keys exceed maximum {}",
                    request.labels.len(),
                    MAX_LABELS_PER_METRIC
                ),
            ));
        }
        let mut seen = BTreeSet::new();
        for key in &request.labels {
            validate_label_key(key)?;
            if !seen.insert(key.as_str()) {
                return Err(Error::bad_input(
                    "labels",
                    format!("duplicate label key '{}'", key),
                ));
            }
        }
        let label_keys: Vec<String> = seen.into_iter().map(String::from).collect();

        let now = self.clock.now_ms();
        let metric = Metric {
            id: MetricId::new(),
            name: request.name,
            kind: request.kind,
            description: request.description,
            unit: request.unit,
            retention_days: retention,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_metric(&metric, &label_keys).await?;
        self.cache_insert(&metric, label_keys);
        tracing::debug!(metric = %metric.name, id = %metric.id, "Metric registered");
        Ok(metric)
    }

    /// Look up an active metric by name, cache first
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Metric>> {
        if let Some(cached) = self.by_name.get(name) {
            return Ok(Some(cached.clone()));
        }

        match self.store.metric_by_name(name).await? {
            Some(metric) if metric.is_active => {
                let keys = self.store.label_keys(metric.id).await?;
                self.cache_insert(&metric, keys);
                Ok(Some(metric))
            }
            _ => Ok(None),
        }
    }

    /// Look up a metric by id, active or not
    pub async fn get_by_id(&self, id: MetricId) -> Result<Option<Metric>> {
        if let Some(name) = self.names_by_id.get(&id) {
            if let Some(cached) = self.by_name.get(name.value()) {
                return Ok(Some(cached.clone()));
            }
        }
        self.store.metric_by_id(id).await
    }

    /// List registered metrics
    pub async fn list(&self, filter: &MetricFilter) -> Result<Vec<Metric>> {
        self.store.list_metrics(filter).await
    }

    /// Update retention and/or active flag. Writes the store first, then
    /// refreshes the cache entry before returning.
    pub async fn update(
        &self,
        id: MetricId,
        retention_days: Option<u32>,
        is_active: Option<bool>,
    ) -> Result<Metric> {
        if let Some(days) = retention_days {
            if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(Error::bad_input(
                    "retention_days",
                    format!(
                        "{} is outside [{}, {}]",
                        days, MIN_RETENTION_DAYS, MAX_RETENTION_DAYS
                    ),
                ));
            }
        }

        let updated = self
            .store
            .update_metric(id, retention_days, is_active, self.clock.now_ms())
            .await?;

        if updated.is_active {
            let keys = self.store.label_keys(id).await?;
            self.cache_insert(&updated, keys);
        } else {
            self.cache_remove(id);
        }
        Ok(updated)
    }

    /// Soft-delete: clear the active flag and drop the cache entry before
    /// returning, so a subsequent get cannot revive it.
    pub async fn soft_delete(&self, id: MetricId) -> Result<Metric> {
        let deleted = self
            .store
            .update_metric(id, None, Some(false), self.clock.now_ms())
            .await?;
        self.cache_remove(id);
        tracing::debug!(metric = %deleted.name, id = %id, "Metric soft-deleted");
        Ok(deleted)
    }

    /// Resolve a metric by name, auto-registering it with an empty label
    /// schema when unknown. Used by ingestion for unregistered names.
    pub async fn get_or_create(&self, name: &str, kind: MetricKind) -> Result<Metric> {
        if let Some(metric) = self.get_by_name(name).await? {
            return Ok(metric);
        }

        match self.register(RegisterRequest::new(name, kind)).await {
            Ok(metric) => Ok(metric),
            // Concurrent auto-registration of the same name: take the winner
            Err(Error::AlreadyExists(_)) => self
                .get_by_name(name)
                .await?
                .ok_or_else(|| Error::NotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Label schema keys for a metric
    pub async fn labels_of(&self, id: MetricId) -> Result<Vec<String>> {
        if let Some(keys) = self.labels_by_id.get(&id) {
            return Ok(keys.clone());
        }
        let keys = self.store.label_keys(id).await?;
        self.labels_by_id.insert(id, keys.clone());
        Ok(keys)
    }

    /// Warm the cache with every stored metric. Called once at startup.
    pub async fn preload(&self) -> Result<usize> {
        let all = self.store.all_metrics().await?;
        let mut loaded = 0;
        for (metric, keys) in all {
            if metric.is_active {
                self.cache_insert(&metric, keys);
                loaded += 1;
            }
        }
        tracing::debug!(count = loaded, "Metric cache preloaded");
        Ok(loaded)
    }

    /// Number of cached definitions
    pub fn cached_count(&self) -> usize {
        self.by_name.len()
    }

    fn cache_insert(&self, metric: &Metric, label_keys: Vec<String>) {
        self.by_name.insert(metric.name.clone(), metric.clone());
        self.names_by_id.insert(metric.id, metric.name.clone());
        self.labels_by_id.insert(metric.id, label_keys);
    }

    fn cache_remove(&self, id: MetricId) {
        if let Some((_, name)) = self.names_by_id.remove(&id) {
            self.by_name.remove(&name);
        }
        self.labels_by_id.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryMetricStore;

    fn test_registry() -> (MetricRegistry, Arc<MemoryMetricStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryMetricStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let registry = MetricRegistry::new(store.clone(), clock.clone());
        (registry, store, clock)
    }

    #[tokio::test]
    async fn test_register_and_get_back() {
        let (registry, _, _) = test_registry();
        let registered = registry
            .register(
                RegisterRequest::new("cpu_usage", MetricKind::Gauge).with_labels(&["host", "dc"]),
            )
            .await
            .unwrap();

        let fetched = registry.get_by_name("cpu_usage").await.unwrap().unwrap();
        assert_eq!(fetched, registered);

        let mut keys = registry.labels_of(registered.id).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["dc".to_string(), "host".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let (registry, _, _) = test_registry();
        registry
            .register(RegisterRequest::new("reqs", MetricKind::Counter))
            .await
            .unwrap();

        let err = registry
            .register(RegisterRequest::new("reqs", MetricKind::Counter))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (registry, _, _) = test_registry();

        assert!(registry
            .register(RegisterRequest::new("1bad", MetricKind::Gauge))
            .await
            .is_err());

        let mut req = RegisterRequest::new("ok", MetricKind::Gauge);
        req.retention_days = Some(0);
        assert!(registry.register(req).await.is_err());

        let mut req = RegisterRequest::new("ok", MetricKind::Gauge);
        req.retention_days = Some(1826);
        assert!(registry.register(req).await.is_err());

        // 11 labels is one past the cap
        let keys: Vec<String> = (0..11).map(|i| format!("k{}", i)).collect();
        let mut req = RegisterRequest::new("ok", MetricKind::Gauge);
        req.labels = keys;
        assert!(registry.register(req).await.is_err());

        // Exactly 10 is accepted
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let mut req = RegisterRequest::new("ok", MetricKind::Gauge);
        req.labels = keys;
        assert!(registry.register(req).await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_hit_after_miss() {
        let (registry, store, clock) = test_registry();
        // Register through a second registry so the first one's cache is cold
        let other = MetricRegistry::new(store.clone(), clock.clone());
        other
            .register(RegisterRequest::new("cold", MetricKind::Gauge))
            .await
            .unwrap();

        assert_eq!(registry.cached_count(), 0);
        assert!(registry.get_by_name("cold").await.unwrap().is_some());
        assert_eq!(registry.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_removes_cache_entry() {
        let (registry, _, _) = test_registry();
        let metric = registry
            .register(RegisterRequest::new("doomed", MetricKind::Gauge))
            .await
            .unwrap();
        assert_eq!(registry.cached_count(), 1);

        registry.soft_delete(metric.id).await.unwrap();
        assert_eq!(registry.cached_count(), 0);
        assert!(registry.get_by_name("doomed").await.unwrap().is_none());

        // Still reachable by id, flagged inactive
        let by_id = registry.get_by_id(metric.id).await.unwrap().unwrap();
        assert!(!by_id.is_active);
    }

    #[tokio::test]
    async fn test_update_refreshes_cache() {
        let (registry, _, clock) = test_registry();
        let metric = registry
            .register(RegisterRequest::new("tuned", MetricKind::Gauge))
            .await
            .unwrap();

        clock.advance_ms(1000);
        let updated = registry.update(metric.id, Some(90), None).await.unwrap();
        assert_eq!(updated.retention_days, 90);
        assert!(updated.updated_at > metric.updated_at);

        // Cache reflects the update immediately
        let cached = registry.get_by_name("tuned").await.unwrap().unwrap();
        assert_eq!(cached.retention_days, 90);
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let (registry, _, _) = test_registry();
        let created = registry
            .get_or_create("auto_metric", MetricKind::Gauge)
            .await
            .unwrap();
        assert_eq!(created.kind, MetricKind::Gauge);
        assert!(registry.labels_of(created.id).await.unwrap().is_empty());

        // Second call resolves the same metric
        let resolved = registry
            .get_or_create("auto_metric", MetricKind::Counter)
            .await
            .unwrap();
        assert_eq!(resolved.id, created.id);
        assert_eq!(resolved.kind, MetricKind::Gauge);
    }

    #[tokio::test]
    async fn test_preload() {
        let (registry, store, clock) = test_registry();
        let other = MetricRegistry::new(store.clone(), clock.clone());
        for name in ["m1", "m2", "m3"] {
            other
                .register(RegisterRequest::new(name, MetricKind::Gauge))
                .await
                .unwrap();
        }
        let doomed = other
            .register(RegisterRequest::new("gone", MetricKind::Gauge))
            .await
            .unwrap();
        other.soft_delete(doomed.id).await.unwrap();

        let loaded = registry.preload().await.unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(registry.cached_count(), 3);
    }
}
