//! Saga timeout: cancels orders stuck awaiting confirmation.

use std::sync::Arc;
use std::time::Duration;

use event_channel::EventChannel;
use tokio::sync::watch;

use crate::controller::OrderSagaController;

/// Periodically cancels orders pending longer than a timeout.
pub struct TimeoutSweeper<C> {
    controller: Arc<OrderSagaController<C>>,
    timeout: chrono::Duration,
    interval: Duration,
}

impl<C: EventChannel> TimeoutSweeper<C> {
    /// Creates a sweeper that checks every quarter of `timeout`, bounded to
    /// between 10ms and 30s.
    pub fn new(controller: Arc<OrderSagaController<C>>, timeout: chrono::Duration) -> Self {
        let interval = (timeout / 4)
            .to_std()
            .unwrap_or_default()
            .clamp(Duration::from_millis(10), Duration::from_secs(30));
        Self {
            controller,
            timeout,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweeps until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(timeout_secs = self.timeout.num_seconds(), "saga timeout enabled");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.controller.expire_pending(self.timeout).await {
                        tracing::warn!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
    }
}
