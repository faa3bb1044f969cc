//! Wiring of the three services onto one channel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common::ResourceKind;
use event_channel::EventChannel;
use store::{
    InMemoryOrderStore, InMemoryResourceStore, OrderStore, OutboxStore, ResourceStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::assignment::AssignmentManager;
use crate::cleanup::{CleanupConfig, OutboxCleanup};
use crate::consumer::{Consumer, DEFAULT_RETRY_BACKOFF};
use crate::controller::OrderSagaController;
use crate::error::SagaError;
use crate::relay::OutboxRelay;
use crate::router::EventRouter;
use crate::sweeper::TimeoutSweeper;

/// Consumer group of the order service.
pub const ORDER_GROUP: &str = "sv-order-group";
/// Consumer group of the truck service.
pub const TRUCK_GROUP: &str = "sv-truck-group";
/// Consumer group of the driver service.
pub const DRIVER_GROUP: &str = "sv-driver-group";

/// One of the three services a process can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Order,
    Truck,
    Driver,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Order, Service::Truck, Service::Driver];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Order => "order",
            Service::Truck => "truck",
            Service::Driver => "driver",
        }
    }

    /// The consumer group the service reads with.
    pub fn group(&self) -> &'static str {
        match self {
            Service::Order => ORDER_GROUP,
            Service::Truck => TRUCK_GROUP,
            Service::Driver => DRIVER_GROUP,
        }
    }

    /// The resource service for `kind`.
    pub fn for_resource(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Truck => Service::Truck,
            ResourceKind::Driver => Service::Driver,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "order" => Ok(Service::Order),
            "truck" => Ok(Service::Truck),
            "driver" => Ok(Service::Driver),
            other => Err(SagaError::InvalidRequest(format!("unknown service: {other}"))),
        }
    }
}

/// Which services run and how their background tasks are timed.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Services whose consumers and background tasks this process runs.
    pub services: Vec<Service>,
    pub relay_interval: Duration,
    pub retry_backoff: Duration,
    /// When set, orders pending longer than this are cancelled.
    pub pending_timeout: Option<Duration>,
    pub cleanup: CleanupConfig,
}

impl RuntimeSettings {
    pub fn runs(&self, service: Service) -> bool {
        self.services.contains(&service)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            services: Service::ALL.to_vec(),
            relay_interval: Duration::from_millis(500),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            pending_timeout: None,
            cleanup: CleanupConfig::default(),
        }
    }
}

/// Store handles for the three services. Each service's outbox handle must
/// point at the same store as its state handle.
#[derive(Clone)]
pub struct Stores {
    pub orders: Arc<dyn OrderStore>,
    pub order_outbox: Arc<dyn OutboxStore>,
    pub trucks: Arc<dyn ResourceStore>,
    pub truck_outbox: Arc<dyn OutboxStore>,
    pub drivers: Arc<dyn ResourceStore>,
    pub driver_outbox: Arc<dyn OutboxStore>,
}

impl Stores {
    /// Builds the handles from one order store and two resource stores.
    pub fn from_parts<O, R>(orders: O, trucks: R, drivers: R) -> Self
    where
        O: OrderStore + OutboxStore + 'static,
        R: ResourceStore + OutboxStore + 'static,
    {
        let orders = Arc::new(orders);
        let trucks = Arc::new(trucks);
        let drivers = Arc::new(drivers);
        Self {
            orders: orders.clone(),
            order_outbox: orders,
            trucks: trucks.clone(),
            truck_outbox: trucks,
            drivers: drivers.clone(),
            driver_outbox: drivers,
        }
    }

    /// Empty in-memory stores.
    pub fn in_memory() -> Self {
        Self::from_parts(
            InMemoryOrderStore::new(),
            InMemoryResourceStore::new(ResourceKind::Truck),
            InMemoryResourceStore::new(ResourceKind::Driver),
        )
    }

    /// The resource store for `kind`.
    pub fn resources(&self, kind: ResourceKind) -> &Arc<dyn ResourceStore> {
        match kind {
            ResourceKind::Truck => &self.trucks,
            ResourceKind::Driver => &self.drivers,
        }
    }
}

struct ServiceUnit<C> {
    service: Service,
    router: Arc<EventRouter>,
    relay: OutboxRelay<C>,
    outbox: Arc<dyn OutboxStore>,
}

/// The order, truck and driver services sharing one channel.
///
/// Each service keeps its own store, router, consumer group and outbox
/// relay; they communicate only through the channel.
pub struct Dispatch<C> {
    channel: Arc<C>,
    orders: Arc<OrderSagaController<C>>,
    trucks: Arc<AssignmentManager<C>>,
    drivers: Arc<AssignmentManager<C>>,
    units: Vec<ServiceUnit<C>>,
}

impl<C> Dispatch<C>
where
    C: EventChannel + 'static,
    C::Subscription: 'static,
{
    pub fn new(channel: Arc<C>, stores: Stores) -> Self {
        let order_relay = OutboxRelay::new(stores.order_outbox.clone(), channel.clone());
        let truck_relay = OutboxRelay::new(stores.truck_outbox.clone(), channel.clone());
        let driver_relay = OutboxRelay::new(stores.driver_outbox.clone(), channel.clone());

        let orders = Arc::new(OrderSagaController::new(stores.orders, order_relay.clone()));
        let trucks = Arc::new(AssignmentManager::new(stores.trucks, truck_relay.clone()));
        let drivers = Arc::new(AssignmentManager::new(stores.drivers, driver_relay.clone()));

        let units = vec![
            ServiceUnit {
                service: Service::Order,
                router: Arc::new(EventRouter::new().register(orders.clone())),
                relay: order_relay,
                outbox: stores.order_outbox,
            },
            ServiceUnit {
                service: Service::Truck,
                router: Arc::new(EventRouter::new().register(trucks.clone())),
                relay: truck_relay,
                outbox: stores.truck_outbox,
            },
            ServiceUnit {
                service: Service::Driver,
                router: Arc::new(EventRouter::new().register(drivers.clone())),
                relay: driver_relay,
                outbox: stores.driver_outbox,
            },
        ];

        Self {
            channel,
            orders,
            trucks,
            drivers,
            units,
        }
    }

    pub fn orders(&self) -> &Arc<OrderSagaController<C>> {
        &self.orders
    }

    /// The assignment manager for `kind`.
    pub fn resources(&self, kind: ResourceKind) -> &Arc<AssignmentManager<C>> {
        match kind {
            ResourceKind::Truck => &self.trucks,
            ResourceKind::Driver => &self.drivers,
        }
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Spawns the consumer, relay loop and retention sweep of every selected
    /// service, plus the timeout sweeper when the order service runs with a
    /// timeout. All of them stop when `shutdown` fires.
    pub fn spawn(
        &self,
        settings: &RuntimeSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        for unit in self.units.iter().filter(|unit| settings.runs(unit.service)) {
            let consumer =
                Consumer::new(self.channel.clone(), unit.service.group(), unit.router.clone())
                .with_retry_backoff(settings.retry_backoff);
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let group = consumer.group().to_string();
                if let Err(e) = consumer.run(rx).await {
                    tracing::error!(%group, error = %e, "consumer exited with error");
                }
            }));

            tasks.push(tokio::spawn(
                unit.relay
                    .clone()
                    .run(settings.relay_interval, shutdown.clone()),
            ));

            let cleanup = OutboxCleanup::new(
                unit.service.as_str(),
                unit.outbox.clone(),
                settings.cleanup.clone(),
            );
            tasks.push(tokio::spawn(cleanup.run(shutdown.clone())));
        }

        if let Some(timeout) = settings.pending_timeout.filter(|_| settings.runs(Service::Order)) {
            match chrono::Duration::from_std(timeout) {
                Ok(timeout) => {
                    let sweeper = TimeoutSweeper::new(self.orders.clone(), timeout);
                    tasks.push(tokio::spawn(sweeper.run(shutdown.clone())));
                }
                Err(e) => tracing::warn!(error = %e, "saga timeout out of range, disabled"),
            }
        }

        let services: Vec<_> = settings.services.iter().map(Service::as_str).collect();
        tracing::info!(?services, tasks = tasks.len(), "dispatch services started");
        tasks
    }
}
