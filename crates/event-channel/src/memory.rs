use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{
    ChannelError, EventEnvelope, Result,
    channel::{Delivery, EventChannel, Subscription},
};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 8;

#[derive(Debug, Default)]
struct BrokerState {
    /// topic -> partition logs
    logs: HashMap<String, Vec<Vec<EventEnvelope>>>,
    /// (group, topic, partition) -> next offset to deliver
    offsets: HashMap<(String, String, u32), u64>,
    /// Every published message in publish order, for inspection.
    history: Vec<EventEnvelope>,
    fail_on_publish: bool,
    closed: bool,
}

struct Inner {
    partitions: u32,
    state: Mutex<BrokerState>,
    published: Notify,
}

/// In-process broker with Kafka-like semantics.
///
/// Each topic is split into partitions chosen by hashing the message key.
/// Consumer groups track a committed offset per partition, so a message is
/// handed out again until it is committed.
#[derive(Clone)]
pub struct InMemoryEventChannel {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }
}

impl InMemoryEventChannel {
    /// Creates a channel with the default partition count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a channel whose topics have `partitions` partitions each.
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                published: Notify::new(),
            }),
        }
    }

    /// Returns the partition a key maps to.
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.inner.partitions)) as u32
    }

    /// Returns every message published to `topic`, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<EventEnvelope> {
        self.inner
            .state
            .lock()
            .await
            .history
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the total number of messages published.
    pub async fn message_count(&self) -> usize {
        self.inner.state.lock().await.history.len()
    }

    /// Configures the channel to reject publishes, simulating an outage.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.inner.state.lock().await.fail_on_publish = fail;
    }

    /// Closes the channel; waiting subscribers return `ChannelError::Closed`.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.published.notify_waiters();
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    type Subscription = InMemorySubscription;

    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let partition = self.partition_for(&envelope.key) as usize;
        let mut state = self.inner.state.lock().await;

        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.fail_on_publish {
            return Err(ChannelError::Publish {
                topic: envelope.topic,
                reason: "broker unavailable".to_string(),
            });
        }

        let partitions = self.inner.partitions as usize;
        state
            .logs
            .entry(envelope.topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions])[partition]
            .push(envelope.clone());

        tracing::debug!(topic = %envelope.topic, key = %envelope.key, partition, "message published");
        metrics::counter!("channel_messages_published_total", "topic" => envelope.topic.clone())
            .increment(1);
        state.history.push(envelope);
        drop(state);

        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<InMemorySubscription> {
        if topics.is_empty() {
            return Err(ChannelError::Subscribe {
                group: group.to_string(),
                reason: "no topics given".to_string(),
            });
        }
        if self.inner.state.lock().await.closed {
            return Err(ChannelError::Closed);
        }

        let partitions = self.inner.partitions;
        let slots = topics
            .iter()
            .flat_map(|topic| (0..partitions).map(move |p| (topic.to_string(), p)))
            .collect();

        tracing::info!(%group, ?topics, "consumer group subscribed");
        Ok(InMemorySubscription {
            inner: self.inner.clone(),
            group: group.to_string(),
            slots,
            cursor: 0,
        })
    }
}

/// Consumer handle for [`InMemoryEventChannel`].
///
/// Partitions are polled round-robin, so a message that keeps failing does
/// not starve other partitions, while later messages on its own partition
/// wait behind it.
pub struct InMemorySubscription {
    inner: Arc<Inner>,
    group: String,
    slots: Vec<(String, u32)>,
    cursor: usize,
}

impl InMemorySubscription {
    /// Returns the consumer group this subscription belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    fn poll_ready(&mut self, state: &BrokerState) -> Option<Delivery> {
        for step in 0..self.slots.len() {
            let index = (self.cursor + step) % self.slots.len();
            let (topic, partition) = &self.slots[index];

            let offset = state
                .offsets
                .get(&(self.group.clone(), topic.clone(), *partition))
                .copied()
                .unwrap_or(0);

            let head = state
                .logs
                .get(topic)
                .and_then(|partitions| partitions.get(*partition as usize))
                .and_then(|log| log.get(offset as usize));

            if let Some(envelope) = head {
                self.cursor = (index + 1) % self.slots.len();
                return Some(Delivery {
                    envelope: envelope.clone(),
                    partition: *partition,
                    offset,
                });
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Delivery> {
        let inner = self.inner.clone();
        loop {
            let published = inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            {
                let state = inner.state.lock().await;
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                if let Some(delivery) = self.poll_ready(&state) {
                    return Ok(delivery);
                }
            }

            published.await;
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let position = state
            .offsets
            .entry((
                self.group.clone(),
                delivery.envelope.topic.clone(),
                delivery.partition,
            ))
            .or_insert(0);
        *position = (*position).max(delivery.offset + 1);
        Ok(())
    }
}
