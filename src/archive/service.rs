//! Archival scheduler
//!
//! Fires the archival job once a day at the configured local hour. The job
//! itself is single-flight and swallows its own errors, so the scheduler
//! only sequences wake-ups and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, TimeZone};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::services::{Service, ServiceError, ServiceStatus};

use super::ArchivalEngine;

/// Daily archival trigger
pub struct ArchivalService {
    engine: Arc<ArchivalEngine>,
    schedule_hour: u32,
    status: RwLock<ServiceStatus>,
}

impl ArchivalService {
    /// Create a scheduler firing at `schedule_hour` local time
    pub fn new(engine: Arc<ArchivalEngine>, schedule_hour: u32) -> Self {
        Self {
            engine,
            schedule_hour: schedule_hour.min(23),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Wall-clock wait until the next scheduled firing
    fn time_until_next_run(&self) -> Duration {
        let now = Local::now();
        let fire_at = NaiveTime::from_hms_opt(self.schedule_hour, 0, 0)
            .unwrap_or(NaiveTime::MIN);

        let mut next = now.date_naive().and_time(fire_at);
        if Local
            .from_local_datetime(&next)
            .earliest()
            .map_or(true, |candidate| candidate <= now)
        {
            next += chrono::Duration::days(1);
        }

        match Local.from_local_datetime(&next).earliest() {
            Some(candidate) => candidate
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::from_secs(3600)),
            None => Duration::from_secs(3600),
        }
    }
}

#[async_trait::async_trait]
impl Service for ArchivalService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(hour = self.schedule_hour, "Archival service started");

        loop {
            let wait = self.time_until_next_run();
            tracing::debug!(wait_secs = wait.as_secs(), "Next archival run scheduled");

            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Archival service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Archival service broadcast receiver lagged");
                        }
                    }
                }

                _ = tokio::time::sleep(wait) => {
                    self.engine.run_archival_job().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Archival service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "archival"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
