//! Consumer loop: one per service and consumer group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use domain::DEAD_LETTER_TOPIC;
use event_channel::{ChannelError, Delivery, EventChannel, EventEnvelope, Subscription};
use tokio::sync::watch;

use crate::error::{Result, SagaError};
use crate::router::EventRouter;

/// Default pause before a failed delivery is handed out again.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Handled and committed.
    Committed,
    /// Failed with a retryable error; left uncommitted for redelivery.
    Retrying,
    /// Poison message: moved to the dead-letter topic and committed.
    DeadLettered,
}

/// Receives deliveries for a consumer group and routes them.
pub struct Consumer<C> {
    channel: Arc<C>,
    group: String,
    router: Arc<EventRouter>,
    retry_backoff: Duration,
}

impl<C: EventChannel> Consumer<C> {
    pub fn new(channel: Arc<C>, group: impl Into<String>, router: Arc<EventRouter>) -> Self {
        Self {
            channel,
            group: group.into(),
            router,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Sets the pause applied after a retryable failure.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Subscribes to the router's topics.
    pub async fn subscribe(&self) -> Result<C::Subscription> {
        let topics = self.router.topics();
        Ok(self.channel.subscribe(&self.group, &topics).await?)
    }

    /// Consumes until `shutdown` fires or the channel closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut subscription = self.subscribe().await?;
        tracing::info!(group = %self.group, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                delivery = subscription.next() => delivery,
            };

            let result = match delivery {
                Ok(delivery) => self.process(&mut subscription, delivery).await.map(|_| ()),
                Err(ChannelError::Closed) => break,
                Err(e) => Err(e.into()),
            };

            if let Err(e) = result {
                tracing::warn!(group = %self.group, error = %e, "consumer error, backing off");
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        tracing::info!(group = %self.group, "consumer stopped");
        Ok(())
    }

    /// Routes one delivery and settles it.
    ///
    /// Commits on success, leaves the delivery uncommitted after a
    /// retryable failure, and dead-letters then commits a poison message.
    /// Errors are channel failures while settling.
    pub async fn process(
        &self,
        subscription: &mut C::Subscription,
        delivery: Delivery,
    ) -> Result<Handled> {
        let envelope = &delivery.envelope;
        let started = Instant::now();
        let result = self.router.route(envelope).await;
        metrics::histogram!(
            "message_handling_duration_seconds",
            "group" => self.group.clone(),
            "topic" => envelope.topic.clone()
        )
        .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                subscription.commit(&delivery).await?;
                Ok(Handled::Committed)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    group = %self.group,
                    topic = %envelope.topic,
                    key = %envelope.key,
                    error = %e,
                    "handler failed, message will be redelivered"
                );
                tokio::time::sleep(self.retry_backoff).await;
                Ok(Handled::Retrying)
            }
            Err(e) => {
                self.dead_letter(envelope, &e).await?;
                subscription.commit(&delivery).await?;
                Ok(Handled::DeadLettered)
            }
        }
    }

    async fn dead_letter(&self, envelope: &EventEnvelope, error: &SagaError) -> Result<()> {
        let mut builder = EventEnvelope::builder()
            .topic(DEAD_LETTER_TOPIC)
            .key(envelope.key.clone())
            .payload_raw(envelope.payload.clone());
        for (name, value) in &envelope.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        let dead = builder
            .header("reason", error.to_string())
            .header("sourceTopic", envelope.topic.clone())
            .header("consumerGroup", self.group.clone())
            .build();

        self.channel.publish(dead).await?;

        metrics::counter!(
            "messages_dead_lettered_total",
            "group" => self.group.clone(),
            "topic" => envelope.topic.clone()
        )
        .increment(1);
        tracing::warn!(
            group = %self.group,
            topic = %envelope.topic,
            key = %envelope.key,
            error = %error,
            "message dead-lettered"
        );
        Ok(())
    }
}
