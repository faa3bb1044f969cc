//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{CleanupConfig, Service};

/// Which event channel the services share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// In-process partitioned log; every service must run in this process.
    Memory,
    /// Kafka cluster at `KAFKA_BROKERS`; needs the `kafka` feature.
    Kafka,
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset keeps every store
///   in memory
/// - `BROKER_PARTITIONS`: partitions per topic (default: `8`)
/// - `OUTBOX_RELAY_INTERVAL_MS`: background outbox flush period (default: `500`)
/// - `RETRY_BACKOFF_MS`: pause before a failed delivery is retried (default: `200`)
/// - `ORDER_PENDING_TIMEOUT_SECS`: cancel orders pending longer than this;
///   unset disables the sweeper
/// - `SEED_RESOURCES`: replace trucks and drivers with the seed set on
///   startup (default: `true`)
/// - `SERVICES`: comma-separated services this process runs, out of
///   `order`, `truck` and `driver` (default: all three)
/// - `BROKER`: `memory` or `kafka` (default: `memory`)
/// - `KAFKA_BROKERS`: Kafka bootstrap servers (default: `"localhost:9092"`)
/// - `KAFKA_TOPIC_PREFIX`: prefix for Kafka topic names (default: none)
/// - `CLEANUP_INTERVAL_SECS`: retention sweep period (default: `3600`)
/// - `RECEIPT_RETENTION_SECS`: age at which delivered outbox entries and
///   processed-message receipts are deleted (default: `604800`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub broker_partitions: u32,
    pub relay_interval: Duration,
    pub retry_backoff: Duration,
    pub pending_timeout: Option<Duration>,
    pub seed_resources: bool,
    pub services: Vec<Service>,
    pub broker: BrokerKind,
    pub kafka_brokers: String,
    pub kafka_topic_prefix: String,
    pub cleanup_interval: Duration,
    pub receipt_retention: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`; unparsable values fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            broker_partitions: lookup("BROKER_PARTITIONS")
                .and_then(|p| p.parse().ok())
                .filter(|p| *p > 0)
                .unwrap_or(defaults.broker_partitions),
            relay_interval: parsed("OUTBOX_RELAY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.relay_interval),
            retry_backoff: parsed("RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            pending_timeout: parsed("ORDER_PENDING_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            seed_resources: lookup("SEED_RESOURCES")
                .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(defaults.seed_resources),
            services: lookup("SERVICES")
                .and_then(|v| parse_services(&v))
                .unwrap_or(defaults.services),
            broker: match lookup("BROKER").map(|v| v.trim().to_ascii_lowercase()).as_deref() {
                Some("kafka") => BrokerKind::Kafka,
                _ => defaults.broker,
            },
            kafka_brokers: lookup("KAFKA_BROKERS")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.kafka_brokers),
            kafka_topic_prefix: lookup("KAFKA_TOPIC_PREFIX").unwrap_or(defaults.kafka_topic_prefix),
            cleanup_interval: parsed("CLEANUP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
            receipt_retention: parsed("RECEIPT_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.receipt_retention),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Selected services and timing for the saga's background tasks.
    pub fn runtime_settings(&self) -> saga::RuntimeSettings {
        saga::RuntimeSettings {
            services: self.services.clone(),
            relay_interval: self.relay_interval,
            retry_backoff: self.retry_backoff,
            pending_timeout: self.pending_timeout,
            cleanup: CleanupConfig::default()
                .with_interval(self.cleanup_interval)
                .with_retention(self.receipt_retention),
        }
    }
}

/// Parses a `SERVICES` list; `None` if it names no known service.
fn parse_services(value: &str) -> Option<Vec<Service>> {
    let mut services = Vec::new();
    for name in value.split(',').filter(|name| !name.trim().is_empty()) {
        match name.parse::<Service>() {
            Ok(service) if !services.contains(&service) => services.push(service),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring SERVICES entry"),
        }
    }
    (!services.is_empty()).then_some(services)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            broker_partitions: event_channel::memory::DEFAULT_PARTITIONS,
            relay_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(200),
            pending_timeout: None,
            seed_resources: true,
            services: Service::ALL.to_vec(),
            broker: BrokerKind::Memory,
            kafka_brokers: "localhost:9092".to_string(),
            kafka_topic_prefix: String::new(),
            cleanup_interval: Duration::from_secs(3600),
            receipt_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}
