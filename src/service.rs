use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::WorkQueue;
use crate::scheduler::SiteCapacity;

/// What one maintenance cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub locations_updated: usize,
    pub negotiations_released: usize,
    pub elements_pulled: usize,
    pub reports_sent: usize,
}

/// Periodic housekeeping of one queue, run every `ReportInterval`:
///
/// 1. refresh data locations
/// 2. release elements whose negotiation timed out
/// 3. pull work from the parent into spare capacity
/// 4. report progress to the parent
///
/// A failing step is logged and the cycle moves on.
pub struct MaintenanceService {
    queue: Arc<WorkQueue>,
    interval: Duration,
}

impl MaintenanceService {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        let interval = queue.config().report_interval();
        Self { queue, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.queue.update_location_info().await {
            Ok(n) => report.locations_updated = n,
            Err(e) => tracing::error!(error = %e, "Location refresh failed"),
        }
        match self.queue.flush_negotiation_failures().await {
            Ok(n) => report.negotiations_released = n,
            Err(e) => tracing::error!(error = %e, "Negotiation flush failed"),
        }
        if self.queue.has_parent() {
            match self.queue.pull_work(&SiteCapacity::new()).await {
                Ok(n) => report.elements_pulled = n,
                Err(e) => tracing::error!(error = %e, "Pulling work failed"),
            }
            match self.queue.update_parent().await {
                Ok(n) => report.reports_sent = n,
                Err(e) => tracing::error!(error = %e, "Parent update failed"),
            }
        }

        tracing::debug!(?report, "Maintenance cycle finished");
        report
    }

    /// Run cycles until `shutdown` is cancelled. The first cycle runs at once.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Maintenance service started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Maintenance service stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }
}
