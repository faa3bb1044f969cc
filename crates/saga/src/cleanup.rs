//! Retention sweep for delivered outbox entries and old receipts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use store::{OutboxStore, Purged};
use tokio::sync::watch;

use crate::error::Result;

/// Retention settings for one service's outbox and receipts.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often the sweep runs.
    pub interval: Duration,
    /// Entries and receipts older than this are deleted.
    pub retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl CleanupConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Periodically purges one service's delivered outbox entries and
/// processed-message receipts.
pub struct OutboxCleanup {
    service: &'static str,
    outbox: Arc<dyn OutboxStore>,
    config: CleanupConfig,
}

impl OutboxCleanup {
    pub fn new(service: &'static str, outbox: Arc<dyn OutboxStore>, config: CleanupConfig) -> Self {
        Self {
            service,
            outbox,
            config,
        }
    }

    /// Runs one sweep now.
    pub async fn sweep(&self) -> Result<Purged> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let before = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let purged = self.outbox.purge(before).await?;

        if purged.outbox > 0 || purged.receipts > 0 {
            tracing::info!(
                service = self.service,
                outbox = purged.outbox,
                receipts = purged.receipts,
                "retention sweep purged rows"
            );
        }
        metrics::counter!("outbox_rows_purged_total", "service" => self.service)
            .increment(purged.outbox);
        metrics::counter!("receipts_purged_total", "service" => self.service)
            .increment(purged.receipts);
        Ok(purged)
    }

    /// Sweeps until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(
            service = self.service,
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "retention sweep started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(service = self.service, error = %e, "retention sweep failed");
                    }
                }
            }
        }
    }
}
