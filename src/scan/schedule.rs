use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::scan::{BatchScanner, ScanError};

/// Invokes `run_once` on a fixed interval until cancelled
pub struct PeriodicScan {
    scanner: Arc<BatchScanner>,
    interval: Duration,
}

impl PeriodicScan {
    pub fn new(scanner: Arc<BatchScanner>, interval: Duration) -> Self {
        Self { scanner, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Continuous scanning (for background daemon)
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // A slow run should not be followed by a burst of catch-up runs
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Periodic account scan started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Periodic account scan stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.scanner.run_once().await {
                Ok(summary) => debug!(
                    checked = summary.checked,
                    cursor = summary.cursor_after,
                    "Scheduled scan complete"
                ),
                Err(ScanError::AlreadyRunning) => {
                    debug!("Previous scan still running, skipping tick")
                }
                Err(e) => error!("Scheduled account scan failed: {}", e),
            }
        }
    }
}
