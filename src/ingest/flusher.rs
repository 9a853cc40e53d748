//! Background buffer flusher
//!
//! Drains the ingest buffer into the store on a fixed schedule, and
//! immediately when the pipeline signals that the buffer hit its cap.
//! Flush failures are logged and left for the next tick; the failed batch is
//! already back in the buffer by the time the error surfaces here.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::services::{Service, ServiceError, ServiceStatus};

use super::IngestionPipeline;

/// Scheduled drain of the ingest buffer
pub struct FlushService {
    pipeline: Arc<IngestionPipeline>,
    status: RwLock<ServiceStatus>,
}

impl FlushService {
    /// Create a flusher for the given pipeline
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            pipeline,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }
}

#[async_trait::async_trait]
impl Service for FlushService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            interval_ms = self.pipeline.flush_interval_ms(),
            "Flush service started"
        );

        let mut tick = interval(Duration::from_millis(self.pipeline.flush_interval_ms()));
        let notify = self.pipeline.flush_notify();

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Flush service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Flush service broadcast receiver lagged");
                        }
                    }
                }

                _ = tick.tick() => {
                    if let Err(e) = self.pipeline.flush().await {
                        tracing::warn!(error = %e, "Scheduled flush failed, will retry");
                    }
                }

                _ = notify.notified() => {
                    tracing::debug!(buffered = self.pipeline.buffered(), "Buffer-full flush triggered");
                    if let Err(e) = self.pipeline.flush().await {
                        tracing::warn!(error = %e, "Triggered flush failed, will retry");
                    }
                }
            }
        }

        // Final drain so a clean shutdown loses nothing that was buffered
        if let Err(e) = self.pipeline.flush().await {
            tracing::warn!(error = %e, buffered = self.pipeline.buffered(), "Final flush failed");
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Flush service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "flusher"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
