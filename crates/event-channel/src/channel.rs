use async_trait::async_trait;

use crate::{EventEnvelope, Result};

/// A message handed to a consumer group, together with its log position.
///
/// The position is only advanced when the delivery is committed; an
/// uncommitted delivery is handed out again.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub partition: u32,
    pub offset: u64,
}

/// Core trait for the broker the services communicate through.
///
/// Implementations must be partitioned by key and deliver at least once:
/// within one consumer group, messages sharing a key arrive in publish
/// order, and a message is redelivered until its delivery is committed.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Consumer handle returned by [`EventChannel::subscribe`].
    type Subscription: Subscription;

    /// Publishes a message to `envelope.topic`, partitioned by `envelope.key`.
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;

    /// Subscribes a consumer group to a set of topics.
    ///
    /// A group that has never committed starts from the beginning of each
    /// topic.
    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<Self::Subscription>;
}

/// One logical consumer within a consumer group.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next uncommitted message on any subscribed partition.
    ///
    /// Returns `ChannelError::Closed` once the channel shuts down.
    async fn next(&mut self) -> Result<Delivery>;

    /// Marks a delivery as processed so it is not handed out again.
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;
}
