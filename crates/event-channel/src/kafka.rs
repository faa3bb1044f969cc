//! Kafka-backed event channel.
//!
//! Each saga topic maps to a Kafka topic of the same name, optionally
//! prefixed. The envelope key is the Kafka message key, so one order's
//! messages share a partition. The payload travels as the message value;
//! the event ID, timestamp and envelope headers travel as Kafka headers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use uuid::Uuid;

use crate::channel::{Delivery, EventChannel, Subscription};
use crate::error::{ChannelError, Result};
use crate::event::{EventEnvelope, EventId};

/// Kafka header carrying the envelope's event ID.
pub const EVENT_ID_HEADER: &str = "event-id";
/// Kafka header carrying the envelope's RFC 3339 timestamp.
pub const TIMESTAMP_HEADER: &str = "event-timestamp";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaChannelConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Prepended to every topic name; empty by default.
    pub topic_prefix: String,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
}

impl KafkaChannelConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            topic_prefix: String::new(),
            security_protocol: None,
        }
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// The Kafka topic a saga topic is published on.
    pub fn kafka_topic(&self, topic: &str) -> String {
        format!("{}{}", self.topic_prefix, topic)
    }

    /// The saga topic behind a Kafka topic.
    pub fn saga_topic<'a>(&self, kafka_topic: &'a str) -> &'a str {
        kafka_topic
            .strip_prefix(self.topic_prefix.as_str())
            .unwrap_or(kafka_topic)
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        self.apply_security(&mut config);
        config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", group);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        self.apply_security(&mut config);
        config
    }

    fn apply_security(&self, config: &mut ClientConfig) {
        if let Some(protocol) = &self.security_protocol {
            config.set("security.protocol", protocol);
        }
    }
}

/// Event channel over a Kafka cluster.
///
/// Kafka's consumer groups and per-partition offsets supply the
/// at-least-once, per-key ordered delivery the services rely on.
pub struct KafkaEventChannel {
    producer: FutureProducer,
    config: KafkaChannelConfig,
}

impl KafkaEventChannel {
    pub fn new(config: KafkaChannelConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| ChannelError::Broker(format!("failed to create Kafka producer: {e}")))?;

        tracing::info!(bootstrap_servers = %config.bootstrap_servers, "connected to Kafka");
        Ok(Self { producer, config })
    }

    pub fn config(&self) -> &KafkaChannelConfig {
        &self.config
    }
}

/// Kafka headers for an envelope: its ID, timestamp and own headers.
fn encode_headers(envelope: &EventEnvelope) -> OwnedHeaders {
    let event_id = envelope.event_id.to_string();
    let timestamp = envelope.timestamp.to_rfc3339();
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: EVENT_ID_HEADER,
            value: Some(event_id.as_str()),
        })
        .insert(Header {
            key: TIMESTAMP_HEADER,
            value: Some(timestamp.as_str()),
        });
    for (key, value) in &envelope.headers {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        });
    }
    headers
}

/// Rebuilds an envelope from the parts of a Kafka message.
///
/// A value that is not JSON becomes a JSON string, so the consumer can
/// still dead-letter it instead of failing on every poll.
fn decode_envelope<'a>(
    topic: &str,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
    headers: impl Iterator<Item = (&'a str, Option<&'a [u8]>)>,
) -> EventEnvelope {
    let payload = match value {
        Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }),
        None => serde_json::Value::Null,
    };

    let mut builder = EventEnvelope::builder()
        .topic(topic)
        .key(key.map(|k| String::from_utf8_lossy(k).into_owned()).unwrap_or_default())
        .payload_raw(payload);

    for (name, value) in headers {
        let Some(value) = value.map(|v| String::from_utf8_lossy(v).into_owned()) else {
            continue;
        };
        builder = match name {
            EVENT_ID_HEADER => match Uuid::parse_str(&value) {
                Ok(id) => builder.event_id(EventId::from_uuid(id)),
                Err(_) => builder,
            },
            TIMESTAMP_HEADER => match DateTime::parse_from_rfc3339(&value) {
                Ok(at) => builder.timestamp(at.with_timezone(&Utc)),
                Err(_) => builder,
            },
            _ => builder.header(name, value),
        };
    }

    builder.build()
}

#[async_trait]
impl EventChannel for KafkaEventChannel {
    type Subscription = KafkaSubscription;

    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let topic = self.config.kafka_topic(&envelope.topic);
        let payload = serde_json::to_vec(&envelope.payload)?;
        let record = FutureRecord::to(&topic)
            .key(envelope.key.as_str())
            .payload(&payload)
            .headers(encode_headers(&envelope));

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| ChannelError::Publish {
                topic: envelope.topic.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(topic = %envelope.topic, key = %envelope.key, "message published");
        metrics::counter!("channel_messages_published_total", "topic" => envelope.topic)
            .increment(1);
        Ok(())
    }

    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<KafkaSubscription> {
        let subscribe_error = |reason: String| ChannelError::Subscribe {
            group: group.to_string(),
            reason,
        };
        if topics.is_empty() {
            return Err(subscribe_error("no topics given".to_string()));
        }

        let consumer: StreamConsumer = self
            .config
            .consumer_config(group)
            .create()
            .map_err(|e| subscribe_error(e.to_string()))?;

        let kafka_topics: Vec<String> = topics.iter().map(|t| self.config.kafka_topic(t)).collect();
        let topic_refs: Vec<&str> = kafka_topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| subscribe_error(e.to_string()))?;

        tracing::info!(%group, topics = ?kafka_topics, "consumer group subscribed");
        Ok(KafkaSubscription {
            consumer,
            config: self.config.clone(),
            held: None,
        })
    }
}

/// Consumer handle for [`KafkaEventChannel`].
///
/// Kafka does not hand a consumed message out again by itself, so the last
/// uncommitted delivery is held and returned by the next call to `next`
/// until it is committed. Later messages wait behind it.
pub struct KafkaSubscription {
    consumer: StreamConsumer,
    config: KafkaChannelConfig,
    held: Option<Delivery>,
}

impl KafkaSubscription {
    fn to_delivery(&self, message: &BorrowedMessage<'_>) -> Delivery {
        let headers = message
            .headers()
            .into_iter()
            .flat_map(|headers| headers.iter())
            .map(|header| (header.key, header.value));
        let envelope = decode_envelope(
            self.config.saga_topic(message.topic()),
            message.key(),
            message.payload(),
            headers,
        );

        Delivery {
            envelope,
            partition: message.partition().max(0) as u32,
            offset: message.offset().max(0) as u64,
        }
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Result<Delivery> {
        if let Some(delivery) = &self.held {
            return Ok(delivery.clone());
        }

        let delivery = {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| ChannelError::Broker(e.to_string()))?;
            self.to_delivery(&message)
        };
        self.held = Some(delivery.clone());
        Ok(delivery)
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &self.config.kafka_topic(&delivery.envelope.topic),
                delivery.partition as i32,
                Offset::Offset(delivery.offset as i64 + 1),
            )
            .map_err(|e| ChannelError::Broker(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| ChannelError::Broker(e.to_string()))?;

        if self.held.as_ref().is_some_and(|held| {
            held.partition == delivery.partition
                && held.offset == delivery.offset
                && held.envelope.topic == delivery.envelope.topic
        }) {
            self.held = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_prefix_round_trips() {
        let config = KafkaChannelConfig::new("localhost:9092").with_topic_prefix("dispatch.");
        assert_eq!(config.kafka_topic("order-created"), "dispatch.order-created");
        assert_eq!(config.saga_topic("dispatch.order-created"), "order-created");
        assert_eq!(config.saga_topic("other"), "other");

        let bare = KafkaChannelConfig::new("localhost:9092");
        assert_eq!(bare.kafka_topic("order-ready"), "order-ready");
    }

    #[test]
    fn consumer_config_disables_auto_commit() {
        let config = KafkaChannelConfig::new("localhost:9092").with_security_protocol("SSL");
        let client = config.consumer_config("sv-truck-group");
        assert_eq!(client.get("group.id"), Some("sv-truck-group"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("security.protocol"), Some("SSL"));
    }

    #[test]
    fn decode_restores_id_timestamp_and_headers() {
        let original = EventEnvelope::builder()
            .topic("dead-letter")
            .key("o-1")
            .payload_raw(serde_json::json!({"orderId": "o-1"}))
            .header("reason", "bad payload")
            .build();
        let event_id = original.event_id.to_string();
        let timestamp = original.timestamp.to_rfc3339();
        let value = serde_json::to_vec(&original.payload).unwrap();

        let headers = vec![
            (EVENT_ID_HEADER, Some(event_id.as_bytes())),
            (TIMESTAMP_HEADER, Some(timestamp.as_bytes())),
            ("reason", Some("bad payload".as_bytes())),
        ];
        let decoded = decode_envelope("dead-letter", Some("o-1".as_bytes()), Some(value.as_slice()), headers.into_iter());

        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_keeps_non_json_value_as_string() {
        let decoded = decode_envelope("order-created", None, Some("not json{".as_bytes()), std::iter::empty());
        assert_eq!(decoded.payload, serde_json::json!("not json{"));
        assert_eq!(decoded.key, "");
        assert!(decoded.headers.is_empty());
    }
}
