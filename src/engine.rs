//! Engine facade
//!
//! Wires the registry, cardinality guard, ingestion pipeline, query planner,
//! and archival engine over one storage gateway pair, and drives the
//! background services. The hosting process builds one [`MetricEngine`],
//! calls [`MetricEngine::start`], and hands requests to [`ingest`] and
//! [`query`].
//!
//! [`ingest`]: MetricEngine::ingest
//! [`query`]: MetricEngine::query

use std::sync::Arc;
use std::time::Duration;

use crate::archive::{ArchivalEngine, ArchivalService, ArchivalStats};
use crate::cardinality::CardinalityGuard;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{FlushService, IngestReport, IngestStats, IngestionPipeline, IncomingSample};
use crate::query::{QueryPlanner, QueryRequest, QueryResponse};
use crate::registry::MetricRegistry;
use crate::services::ServiceManager;
use crate::storage::{MetricStore, ObjectStore};

/// Combined engine counters
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Ingestion pipeline counters
    pub ingest: IngestStats,
    /// Archival counters
    pub archival: ArchivalStats,
    /// Metric definitions currently cached
    pub cached_metrics: usize,
}

/// The assembled metric engine
pub struct MetricEngine {
    registry: Arc<MetricRegistry>,
    guard: Arc<CardinalityGuard>,
    pipeline: Arc<IngestionPipeline>,
    planner: Arc<QueryPlanner>,
    archival: Arc<ArchivalEngine>,
    services: ServiceManager,
    archival_enabled: bool,
    schedule_hour: u32,
}

impl MetricEngine {
    /// Start building an engine
    pub fn builder() -> MetricEngineBuilder {
        MetricEngineBuilder::default()
    }

    /// Preload the metric cache and start the background services
    pub async fn start(&self) -> Result<()> {
        self.registry.preload().await?;

        self.services
            .register(Arc::new(FlushService::new(self.pipeline.clone())))
            .map_err(|e| Error::Internal(e.to_string()))?;
        if self.archival_enabled {
            self.services
                .register(Arc::new(ArchivalService::new(
                    self.archival.clone(),
                    self.schedule_hour,
                )))
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        self.services
            .start_all()
            .map_err(|e| Error::Internal(e.to_string()))?;
        tracing::info!("Metric engine started");
        Ok(())
    }

    /// Stop the background services; the flusher drains the buffer on the
    /// way out
    pub async fn shutdown(&self) -> Result<()> {
        self.services
            .shutdown()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    /// Validate and buffer a batch of samples
    pub async fn ingest(&self, batch: Vec<IncomingSample>) -> Result<IngestReport> {
        self.pipeline.ingest(batch).await
    }

    /// Plan and execute a query
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.planner.query(request).await
    }

    /// Drain the ingest buffer now instead of waiting for the next tick
    pub async fn flush(&self) -> Result<u64> {
        self.pipeline.flush().await
    }

    /// Run one archival pass now instead of waiting for the schedule
    pub async fn run_archival(&self) {
        self.archival.run_archival_job().await;
    }

    /// The metric registry
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// The cardinality guard
    pub fn cardinality(&self) -> &CardinalityGuard {
        &self.guard
    }

    /// The archival engine
    pub fn archival(&self) -> &ArchivalEngine {
        &self.archival
    }

    /// Whether every background service is healthy
    pub fn is_healthy(&self) -> bool {
        self.services.is_healthy()
    }

    /// Counter snapshot across subsystems
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ingest: self.pipeline.stats(),
            archival: self.archival.stats(),
            cached_metrics: self.registry.cached_count(),
        }
    }
}

/// Builder for [`MetricEngine`]
#[derive(Default)]
pub struct MetricEngineBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn MetricStore>>,
    objects: Option<Arc<dyn ObjectStore>>,
    clock: Option<SharedClock>,
}

impl MetricEngineBuilder {
    /// Use this configuration (defaults otherwise)
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this time-series store
    pub fn with_store(mut self, store: Arc<dyn MetricStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this object store
    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Use this clock (system clock otherwise)
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Assemble the engine
    pub fn build(self) -> Result<MetricEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .store
            .ok_or_else(|| Error::bad_input("store", "a metric store is required"))?;
        let objects = self
            .objects
            .ok_or_else(|| Error::bad_input("object_store", "an object store is required"))?;
        let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let registry = Arc::new(MetricRegistry::new(store.clone(), clock.clone()));
        let guard = Arc::new(CardinalityGuard::new(
            config.cardinality.clone(),
            store.clone(),
            clock.clone(),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            config.ingestion.clone(),
            registry.clone(),
            guard.clone(),
            store.clone(),
            clock.clone(),
        ));
        let archival = Arc::new(ArchivalEngine::new(
            config.cold_tier.clone(),
            store.clone(),
            objects,
            clock.clone(),
        ));
        let planner = Arc::new(QueryPlanner::new(
            config.query.clone(),
            config.hot_tier.retention_days,
            registry.clone(),
            store,
            archival.clone(),
            clock,
        ));

        Ok(MetricEngine {
            registry,
            guard,
            pipeline,
            planner,
            archival,
            services: ServiceManager::new(Duration::from_secs(30)),
            archival_enabled: config.cold_tier.enabled,
            schedule_hour: config.cold_tier.schedule_hour,
        })
    }
}
