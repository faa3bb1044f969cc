//! Order saga controller: owns the order aggregate's lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, ResourceId, ResourceKind};
use domain::{AssignedData, ConflictedData, Order, SagaEvent, Topic};
use event_channel::{EventChannel, EventEnvelope};
use store::{Modification, OrderStore};

use crate::error::{Result, SagaError};
use crate::relay::{OutboxRelay, envelope};
use crate::router::EventHandler;

/// Drives an order from placement to fulfillment or cancellation.
///
/// Reacts to whichever assignment or conflict event arrives, in any order;
/// it never waits for both resources.
pub struct OrderSagaController<C> {
    store: Arc<dyn OrderStore>,
    relay: OutboxRelay<C>,
}

impl<C: EventChannel> OrderSagaController<C> {
    pub fn new(store: Arc<dyn OrderStore>, relay: OutboxRelay<C>) -> Self {
        Self { store, relay }
    }

    /// Places an order for a truck and a driver and announces it.
    ///
    /// The references are not checked against the resource services. The
    /// order and its `order-created` event are committed together; if the
    /// immediate publish fails, the relay loop delivers it later.
    #[tracing::instrument(skip(self))]
    pub async fn create_order(&self, truck_id: ResourceId, driver_id: ResourceId) -> Result<Order> {
        for (kind, id) in [(ResourceKind::Truck, &truck_id), (ResourceKind::Driver, &driver_id)] {
            if id.as_str().trim().is_empty() {
                return Err(SagaError::InvalidRequest(format!("{kind}Id is required")));
            }
        }

        let order = Order::place(truck_id, driver_id);
        let created = envelope(&SagaEvent::OrderCreated(order.clone()))?;
        self.store.create(&order, vec![created]).await?;

        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_id = %order.id(), "order placed, awaiting confirmation");

        if let Err(e) = self.relay.flush().await {
            tracing::warn!(order_id = %order.id(), error = %e, "order-created left in outbox");
        }
        Ok(order)
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        Ok(self.store.list().await?)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }

    /// Records an assignment and confirms the order once both resources
    /// are secured.
    ///
    /// The flag update and the confirmation check run as one atomic update,
    /// so two assignments arriving together confirm the order exactly once.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn on_assigned(&self, kind: ResourceKind, data: AssignedData) -> Result<()> {
        let confirmed = AtomicBool::new(false);
        let change = |order: &mut Order| -> store::Result<Vec<EventEnvelope>> {
            if !order.record_assignment(kind) {
                return Ok(Vec::new());
            }
            confirmed.store(true, Ordering::Relaxed);
            Ok(vec![envelope(&SagaEvent::OrderReady(order.clone()))?])
        };

        match self
            .store
            .modify(data.order_id, Some(Topic::assigned(kind)), &change)
            .await?
        {
            Modification::Applied(_) if confirmed.load(Ordering::Relaxed) => {
                metrics::counter!("orders_ready_total").increment(1);
                tracing::info!(%kind, "{kind} assigned, order in fulfillment");
            }
            Modification::Applied(_) => {
                tracing::info!(%kind, "{kind} assigned, waiting for the other resource");
            }
            Modification::Duplicate => {
                tracing::debug!(%kind, "duplicate assignment ignored");
            }
            Modification::NotFound => return Err(SagaError::OrderNotFound(data.order_id)),
        }

        self.relay.flush().await?;
        Ok(())
    }

    /// Records a rejected claim and cancels the order.
    ///
    /// Fires once per conflicted resource, whatever the other resource's
    /// state; the cancellation carries the full aggregate.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn on_conflicted(&self, kind: ResourceKind, data: ConflictedData) -> Result<()> {
        let change = |order: &mut Order| -> store::Result<Vec<EventEnvelope>> {
            order.record_conflict(kind, data.reason.clone());
            Ok(vec![envelope(&SagaEvent::cancelled(order))?])
        };

        match self
            .store
            .modify(data.order_id, Some(Topic::conflicted(kind)), &change)
            .await?
        {
            Modification::Applied(_) => {
                metrics::counter!("orders_cancelled_total", "cause" => kind.as_str()).increment(1);
                tracing::warn!(%kind, reason = %data.reason, "order cancelled");
            }
            Modification::Duplicate => {
                tracing::debug!(%kind, "duplicate conflict ignored");
            }
            Modification::NotFound => return Err(SagaError::OrderNotFound(data.order_id)),
        }

        self.relay.flush().await?;
        Ok(())
    }

    /// Cancels every order still awaiting confirmation after `timeout`.
    ///
    /// Returns the number of orders cancelled. An order that races with a
    /// consumer is skipped and picked up by the next sweep.
    pub async fn expire_pending(&self, timeout: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - timeout;
        let mut expired = 0;

        for order_id in self.store.stale_pending(cutoff).await? {
            let cancelled = AtomicBool::new(false);
            let change = |order: &mut Order| -> store::Result<Vec<EventEnvelope>> {
                if !order.expire_if_stale(Utc::now(), timeout) {
                    return Ok(Vec::new());
                }
                cancelled.store(true, Ordering::Relaxed);
                Ok(vec![envelope(&SagaEvent::cancelled(order))?])
            };

            match self.store.modify(order_id, None, &change).await {
                Ok(_) if cancelled.load(Ordering::Relaxed) => {
                    expired += 1;
                    metrics::counter!("orders_cancelled_total", "cause" => "timeout")
                        .increment(1);
                    tracing::warn!(%order_id, "order cancelled: confirmation timed out");
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(%order_id, error = %e, "order changed during sweep");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if expired > 0 {
            self.relay.flush().await?;
        }
        Ok(expired)
    }
}

#[async_trait]
impl<C: EventChannel> EventHandler for OrderSagaController<C> {
    fn topics(&self) -> &'static [Topic] {
        &[
            Topic::TruckAssigned,
            Topic::DriverAssigned,
            Topic::TruckConflicted,
            Topic::DriverConflicted,
        ]
    }

    async fn handle(&self, event: SagaEvent) -> Result<()> {
        match event {
            SagaEvent::TruckAssigned(data) => self.on_assigned(ResourceKind::Truck, data).await,
            SagaEvent::DriverAssigned(data) => self.on_assigned(ResourceKind::Driver, data).await,
            SagaEvent::TruckConflicted(data) => {
                self.on_conflicted(ResourceKind::Truck, data).await
            }
            SagaEvent::DriverConflicted(data) => {
                self.on_conflicted(ResourceKind::Driver, data).await
            }
            other => Err(SagaError::UnknownEventTopic(other.topic().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use domain::{ConflictCause, StatusCode};
    use event_channel::InMemoryEventChannel;
    use store::{InMemoryOrderStore, OutboxStore};

    use super::*;

    struct Fixture {
        store: InMemoryOrderStore,
        channel: Arc<InMemoryEventChannel>,
        controller: OrderSagaController<InMemoryEventChannel>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryOrderStore::new();
        let channel = Arc::new(InMemoryEventChannel::new());
        let relay = OutboxRelay::new(Arc::new(store.clone()), channel.clone());
        let controller = OrderSagaController::new(Arc::new(store.clone()), relay);
        Fixture {
            store,
            channel,
            controller,
        }
    }

    fn codes(order: &Order) -> Vec<u16> {
        order.status_history().iter().map(|e| e.code.code()).collect()
    }

    async fn place(f: &Fixture) -> Order {
        f.controller
            .create_order(ResourceId::new("T1"), ResourceId::new("D1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_order_publishes_full_aggregate() {
        let f = fixture();
        let order = place(&f).await;

        assert_eq!(codes(&order), vec![1]);
        let published = f.channel.published("order-created").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, order.id().to_string());
        assert_eq!(published[0].payload["fulfillment"]["driverId"], "D1");
        assert_eq!(f.controller.list_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_order_rejects_blank_references() {
        let f = fixture();
        let result = f
            .controller
            .create_order(ResourceId::new("T1"), ResourceId::new("  "))
            .await;
        assert!(matches!(result, Err(SagaError::InvalidRequest(msg)) if msg == "driverId is required"));
        assert!(f.controller.list_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_order_survives_publish_outage() {
        let f = fixture();
        f.channel.set_fail_on_publish(true).await;

        let order = place(&f).await;
        assert_eq!(f.store.pending(10).await.unwrap().len(), 1);
        assert_eq!(f.controller.get_order(order.id()).await.unwrap(), order);
    }

    #[tokio::test]
    async fn both_assignments_confirm_once() {
        let f = fixture();
        let order = place(&f).await;
        let data = AssignedData { order_id: order.id() };

        f.controller.on_assigned(ResourceKind::Truck, data.clone()).await.unwrap();
        assert!(f.channel.published("order-ready").await.is_empty());

        f.controller.on_assigned(ResourceKind::Driver, data.clone()).await.unwrap();
        f.controller.on_assigned(ResourceKind::Driver, data).await.unwrap();

        let stored = f.controller.get_order(order.id()).await.unwrap();
        assert_eq!(codes(&stored), vec![1, 2]);
        let ready = f.channel.published("order-ready").await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].payload["statusHistory"][1]["code"], 2);
    }

    #[tokio::test]
    async fn concurrent_assignments_confirm_once() {
        let f = fixture();
        let order = place(&f).await;
        let data = AssignedData { order_id: order.id() };

        let (truck, driver) = tokio::join!(
            f.controller.on_assigned(ResourceKind::Truck, data.clone()),
            f.controller.on_assigned(ResourceKind::Driver, data.clone()),
        );
        truck.unwrap();
        driver.unwrap();

        let stored = f.controller.get_order(order.id()).await.unwrap();
        assert_eq!(codes(&stored), vec![1, 2]);
        assert_eq!(f.channel.published("order-ready").await.len(), 1);
    }

    #[tokio::test]
    async fn conflict_cancels_with_reason() {
        let f = fixture();
        let order = place(&f).await;
        f.controller
            .on_assigned(ResourceKind::Truck, AssignedData { order_id: order.id() })
            .await
            .unwrap();

        let reason = ConflictCause::AlreadyAssigned.reason(ResourceKind::Driver, "D1");
        let data = ConflictedData {
            order_id: order.id(),
            reason: reason.clone(),
            cause: Some(ConflictCause::AlreadyAssigned),
        };
        f.controller.on_conflicted(ResourceKind::Driver, data.clone()).await.unwrap();
        f.controller.on_conflicted(ResourceKind::Driver, data).await.unwrap();

        let stored = f.controller.get_order(order.id()).await.unwrap();
        assert_eq!(codes(&stored), vec![1, 99]);
        assert_eq!(stored.status_history()[1].name, reason);
        assert!(stored.fulfillment().is_truck_assigned);

        let cancelled = f.channel.published("order-cancelled").await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].key, order.id().to_string());
        assert_eq!(cancelled[0].payload["fulfillment"]["truckId"], "T1");
    }

    #[tokio::test]
    async fn each_conflict_cancels_independently() {
        let f = fixture();
        let order = place(&f).await;

        for kind in ResourceKind::ALL {
            let data = ConflictedData {
                order_id: order.id(),
                reason: ConflictCause::NotFound.reason(kind, "X"),
                cause: Some(ConflictCause::NotFound),
            };
            f.controller.on_conflicted(kind, data).await.unwrap();
        }

        let stored = f.controller.get_order(order.id()).await.unwrap();
        assert_eq!(codes(&stored), vec![1, 99, 99]);
        assert_eq!(f.channel.published("order-cancelled").await.len(), 2);
    }

    #[tokio::test]
    async fn assignment_after_conflict_does_not_confirm() {
        let f = fixture();
        let order = place(&f).await;
        let data = ConflictedData {
            order_id: order.id(),
            reason: "truck T1 not found".into(),
            cause: None,
        };
        f.controller.on_conflicted(ResourceKind::Truck, data).await.unwrap();
        f.controller
            .on_assigned(ResourceKind::Driver, AssignedData { order_id: order.id() })
            .await
            .unwrap();

        let stored = f.controller.get_order(order.id()).await.unwrap();
        assert_eq!(stored.current_status(), StatusCode::Conflicted);
        assert!(f.channel.published("order-ready").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_reported() {
        let f = fixture();
        let missing = OrderId::new();
        let result = f
            .controller
            .on_assigned(ResourceKind::Truck, AssignedData { order_id: missing })
            .await;
        assert!(matches!(result, Err(SagaError::OrderNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn publish_failure_fails_handler_and_redelivery_recovers() {
        let f = fixture();
        let order = place(&f).await;
        let data = AssignedData { order_id: order.id() };
        f.controller.on_assigned(ResourceKind::Truck, data.clone()).await.unwrap();

        f.channel.set_fail_on_publish(true).await;
        let result = f.controller.on_assigned(ResourceKind::Driver, data.clone()).await;
        assert!(result.as_ref().is_err_and(SagaError::is_retryable));

        // redelivery: the mutation is de-duplicated, the flush goes through
        f.channel.set_fail_on_publish(false).await;
        f.controller.on_assigned(ResourceKind::Driver, data).await.unwrap();

        let stored = f.controller.get_order(order.id()).await.unwrap();
        assert_eq!(codes(&stored), vec![1, 2]);
        assert_eq!(f.channel.published("order-ready").await.len(), 1);
    }

    #[tokio::test]
    async fn expire_pending_cancels_only_stale_orders() {
        let f = fixture();
        let stale = place(&f).await;

        assert_eq!(
            f.controller.expire_pending(chrono::Duration::hours(1)).await.unwrap(),
            0
        );
        assert_eq!(
            f.controller.expire_pending(chrono::Duration::zero()).await.unwrap(),
            1
        );

        let stored = f.controller.get_order(stale.id()).await.unwrap();
        assert_eq!(codes(&stored), vec![1, 99]);
        assert_eq!(stored.status_history()[1].name, domain::CONFIRMATION_TIMED_OUT);
        assert_eq!(f.channel.published("order-cancelled").await.len(), 1);

        // nothing left to expire
        assert_eq!(
            f.controller.expire_pending(chrono::Duration::zero()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn handler_rejects_resource_topics() {
        let f = fixture();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        let result = f.controller.handle(SagaEvent::OrderCreated(order)).await;
        assert!(matches!(result, Err(SagaError::UnknownEventTopic(t)) if t == "order-created"));
    }
}
