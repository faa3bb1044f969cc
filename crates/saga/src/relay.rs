//! Outbox relay: moves journaled events onto the channel.

use std::sync::Arc;
use std::time::Duration;

use domain::SagaEvent;
use event_channel::{EventChannel, EventEnvelope};
use store::OutboxStore;
use tokio::sync::{Mutex, watch};

use crate::error::Result;

/// Number of outbox entries fetched per round trip.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Wraps a saga event for the outbox, keyed by its order ID.
pub fn envelope(event: &SagaEvent) -> std::result::Result<EventEnvelope, store::StoreError> {
    Ok(EventEnvelope::new(
        event.topic().as_str(),
        event.order_id().to_string(),
        event.payload()?,
    ))
}

/// Publishes a service's pending outbox entries in insertion order.
///
/// Clones share one flush lock, so a handler flushing after its commit and
/// the periodic relay loop never publish the same service's entries
/// interleaved.
pub struct OutboxRelay<C> {
    outbox: Arc<dyn OutboxStore>,
    channel: Arc<C>,
    batch_size: usize,
    flushing: Arc<Mutex<()>>,
}

impl<C> Clone for OutboxRelay<C> {
    fn clone(&self) -> Self {
        Self {
            outbox: self.outbox.clone(),
            channel: self.channel.clone(),
            batch_size: self.batch_size,
            flushing: self.flushing.clone(),
        }
    }
}

impl<C: EventChannel> OutboxRelay<C> {
    pub fn new(outbox: Arc<dyn OutboxStore>, channel: Arc<C>) -> Self {
        Self {
            outbox,
            channel,
            batch_size: DEFAULT_BATCH_SIZE,
            flushing: Arc::new(Mutex::new(())),
        }
    }

    /// Publishes every pending entry, marking each delivered after its
    /// publish succeeds.
    ///
    /// Stops at the first publish failure; that entry and everything after
    /// it stay pending. Returns the number of entries published.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flushing.lock().await;
        let mut published = 0;

        loop {
            let batch = self.outbox.pending(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                let topic = entry.envelope.topic.clone();
                self.channel.publish(entry.envelope).await?;
                self.outbox.mark_delivered(entry.sequence).await?;

                metrics::counter!("outbox_published_total", "topic" => topic).increment(1);
                published += 1;
            }
        }

        if published > 0 {
            tracing::debug!(published, "outbox flushed");
        }
        Ok(published)
    }

    /// Flushes periodically until `shutdown` fires.
    ///
    /// Recovers entries left behind when a handler's own flush failed or the
    /// process stopped between commit and publish.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "outbox relay flush failed");
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }
}
