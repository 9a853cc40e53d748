//! Background service framework
//!
//! The engine runs two long-lived background tasks: the ingest flusher and
//! the archival scheduler. Both implement [`Service`] and are coordinated by
//! a [`ServiceManager`] that owns the shared shutdown signal and waits for
//! graceful termination with a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Trait for long-running background services
///
/// A service's `start` owns its main loop and must watch the shutdown
/// receiver for graceful termination.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run the service until shutdown is signalled
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and identification
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Initializing
    Starting,
    /// Main loop running
    Running,
    /// Stopped cleanly
    Stopped,
    /// Terminated with an error
    Failed(String),
}

impl ServiceStatus {
    /// Whether the service is running normally
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }
}

/// Errors from the service framework
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service failed while running
    #[error("service runtime error: {0}")]
    RuntimeError(String),

    /// A service with this name is already registered or running
    #[error("service already running")]
    AlreadyRunning,

    /// Internal framework failure
    #[error("internal error: {0}")]
    Internal(String),
}

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
}

/// Coordinator for background services
pub struct ServiceManager {
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
    running: RwLock<bool>,
}

impl ServiceManager {
    /// Create a manager with the given graceful-shutdown timeout
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_timeout,
            running: RwLock::new(false),
        }
    }

    /// Create with a 30 second shutdown timeout
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(30))
    }

    /// Register a service; must happen before `start_all`
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRunning);
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
            },
        );
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Spawn every registered service
    pub fn start_all(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }

        let mut services = self.services.write();
        for (name, handle) in services.iter_mut() {
            let service = handle.service.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handle.task = Some(tokio::spawn(async move { service.start(shutdown_rx).await }));
            tracing::debug!(service = name, "Service started");
        }
        Ok(())
    }

    /// Signal shutdown and wait for services to stop, bounded by the timeout
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(service = name, "Service stopped gracefully");
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error");
                }
                Ok(Err(e)) => {
                    tracing::error!(service = name, error = %e, "Service task panicked");
                }
                Err(_) => {
                    tracing::warn!(service = name, "Service shutdown timed out");
                }
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Status of every registered service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        let services = self.services.read();
        services
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Whether every registered service is healthy
    pub fn is_healthy(&self) -> bool {
        let services = self.services.read();
        services.values().all(|h| h.service.status().is_healthy())
    }
}
