//! Resource assignment manager, run by the truck and driver services.

use std::sync::Arc;

use async_trait::async_trait;
use common::ResourceKind;
use domain::{CancellationNotice, Order, Resource, SagaEvent, Topic};
use event_channel::{EventChannel, EventEnvelope};
use store::{ClaimOutcome, Release, ResourceStore};

use crate::error::{Result, SagaError};
use crate::relay::{OutboxRelay, envelope};
use crate::router::EventHandler;

/// Claims and releases one kind of resource on behalf of orders.
pub struct AssignmentManager<C> {
    kind: ResourceKind,
    store: Arc<dyn ResourceStore>,
    relay: OutboxRelay<C>,
}

fn outcome_label(outcome: ClaimOutcome) -> &'static str {
    match outcome {
        ClaimOutcome::Assigned => "assigned",
        ClaimOutcome::Rejected(cause) => cause.as_str(),
        ClaimOutcome::Duplicate => "duplicate",
        ClaimOutcome::OrderCancelled => "order_cancelled",
    }
}

impl<C: EventChannel> AssignmentManager<C> {
    pub fn new(store: Arc<dyn ResourceStore>, relay: OutboxRelay<C>) -> Self {
        Self {
            kind: store.kind(),
            store,
            relay,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        Ok(self.store.list().await?)
    }

    /// Tries to claim the resource the order asked for.
    ///
    /// The claim is an atomic compare-and-set in the store; the assigned or
    /// conflicted event is journaled with it and then flushed.
    #[tracing::instrument(skip(self, order), fields(kind = %self.kind, order_id = %order.id()))]
    pub async fn on_order_created(&self, order: Order) -> Result<()> {
        let kind = self.kind;
        let order_id = order.id();
        let resource_id = order.fulfillment().resource(kind).clone();

        let render = |outcome: ClaimOutcome| -> store::Result<Vec<EventEnvelope>> {
            let event = match outcome {
                ClaimOutcome::Assigned => SagaEvent::assigned(kind, order_id),
                ClaimOutcome::Rejected(cause) => {
                    SagaEvent::conflicted(kind, order_id, cause, cause.reason(kind, &resource_id))
                }
                ClaimOutcome::Duplicate | ClaimOutcome::OrderCancelled => return Ok(Vec::new()),
            };
            Ok(vec![envelope(&event)?])
        };

        let outcome = self.store.claim(order_id, &resource_id, &render).await?;
        metrics::counter!(
            "resource_claims_total",
            "kind" => kind.as_str(),
            "outcome" => outcome_label(outcome)
        )
        .increment(1);

        match outcome {
            ClaimOutcome::Assigned => {
                tracing::info!(resource = %resource_id, "{kind} assigned to order");
            }
            ClaimOutcome::Rejected(cause) => {
                let diagnostic = SagaError::rejection(kind, resource_id, cause);
                tracing::warn!(error = %diagnostic, "{kind} claim rejected");
            }
            ClaimOutcome::Duplicate => {
                tracing::debug!("duplicate order-created ignored");
            }
            ClaimOutcome::OrderCancelled => {
                tracing::info!("order already cancelled, claim skipped");
            }
        }

        self.relay.flush().await?;
        Ok(())
    }

    /// Compensation: frees the resource this order holds, if any.
    ///
    /// Only the holding order can free a resource, so the cancellation of an
    /// order whose own claim was rejected leaves the real holder untouched.
    #[tracing::instrument(skip(self, notice), fields(kind = %self.kind, order_id = %notice.order_id))]
    pub async fn on_order_cancelled(&self, notice: CancellationNotice) -> Result<()> {
        match self.store.release(notice.order_id).await? {
            Release::Released(resource_id) => {
                metrics::counter!("resources_released_total", "kind" => self.kind.as_str())
                    .increment(1);
                tracing::info!(resource = %resource_id, "{} released", self.kind);
            }
            Release::NotHeld => {
                tracing::debug!("nothing held for cancelled order");
            }
            Release::Duplicate => {
                tracing::debug!("duplicate order-cancelled ignored");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<C: EventChannel> EventHandler for AssignmentManager<C> {
    fn topics(&self) -> &'static [Topic] {
        &[Topic::OrderCreated, Topic::OrderCancelled]
    }

    async fn handle(&self, event: SagaEvent) -> Result<()> {
        match event {
            SagaEvent::OrderCreated(order) => self.on_order_created(order).await,
            SagaEvent::OrderCancelled(notice) => self.on_order_cancelled(notice).await,
            other => Err(SagaError::UnknownEventTopic(other.topic().to_string())),
        }
    }
}
