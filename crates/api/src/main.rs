//! Process entry point: the order, truck and driver services.

use std::sync::Arc;

use api::config::{BrokerKind, Config};
use common::ResourceKind;
use event_channel::{EventChannel, InMemoryEventChannel};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{Dispatch, Service, Stores};
use sqlx::postgres::PgPoolOptions;
use store::{PostgresOrderStore, PostgresResourceStore, run_migrations};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Opens PostgreSQL stores when `DATABASE_URL` is set, in-memory ones otherwise.
async fn open_stores(config: &Config) -> Result<Stores, BoxError> {
    let Some(url) = &config.database_url else {
        tracing::info!("DATABASE_URL not set, using in-memory stores");
        return Ok(Stores::in_memory());
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    run_migrations(&pool).await?;
    tracing::info!("connected to PostgreSQL, migrations applied");

    Ok(Stores::from_parts(
        PostgresOrderStore::new(pool.clone()),
        PostgresResourceStore::new(pool.clone(), ResourceKind::Truck),
        PostgresResourceStore::new(pool, ResourceKind::Driver),
    ))
}

#[cfg(feature = "kafka")]
fn kafka_channel(config: &Config) -> Result<Arc<event_channel::KafkaEventChannel>, BoxError> {
    let kafka = event_channel::KafkaChannelConfig::new(&config.kafka_brokers)
        .with_topic_prefix(&config.kafka_topic_prefix);
    Ok(Arc::new(event_channel::KafkaEventChannel::new(kafka)?))
}

/// Runs the selected services on `channel` and serves HTTP until a shutdown
/// signal arrives, then stops the background tasks.
async fn run<C>(
    config: &Config,
    channel: Arc<C>,
    stores: Stores,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError>
where
    C: EventChannel + 'static,
    C::Subscription: 'static,
{
    // Start consumers, outbox relays and retention sweeps
    let dispatch = Dispatch::new(channel, stores);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = dispatch.spawn(&config.runtime_settings(), shutdown_rx);

    // Build the application
    let state = api::AppState::from_dispatch(&dispatch).with_services(config.services.clone());
    let app = api::create_app(Arc::new(state), metrics_handle);

    // Serve until a shutdown signal arrives
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task panicked");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Open the stores and seed the hosted resource services
    let stores = open_stores(&config).await?;
    if config.seed_resources {
        api::seed::seed_for(&stores, &config.services).await?;
    }

    // 4. Run on the configured broker
    match config.broker {
        BrokerKind::Memory => {
            if config.services.len() < Service::ALL.len() {
                tracing::warn!(
                    services = ?config.services,
                    "in-memory broker only reaches services in this process"
                );
            }
            let channel = Arc::new(InMemoryEventChannel::with_partitions(config.broker_partitions));
            run(&config, channel.clone(), stores, metrics_handle).await?;
            channel.close().await;
        }
        #[cfg(feature = "kafka")]
        BrokerKind::Kafka => {
            run(&config, kafka_channel(&config)?, stores, metrics_handle).await?;
        }
        #[cfg(not(feature = "kafka"))]
        BrokerKind::Kafka => {
            return Err("BROKER=kafka needs a build with the `kafka` feature".into());
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
