use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ResourceId, ResourceKind};
use domain::{ConflictCause, Order, Resource, Topic};
use event_channel::EventEnvelope;

use crate::Result;

/// The service a store instance belongs to.
///
/// Services share nothing; when several of them live in one database, the
/// scope keeps their receipts and outbox journals apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Orders,
    Resources(ResourceKind),
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Orders => "order",
            Scope::Resources(kind) => kind.as_str(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event waiting in a service's outbox journal.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Insertion position; entries are published in this order.
    pub sequence: i64,
    pub envelope: EventEnvelope,
}

/// Read side of the transactional outbox.
///
/// Entries are written by the mutating operations of [`OrderStore`] and
/// [`ResourceStore`], in the same atomic step as the state change.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` undelivered entries, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Marks an entry as published. Marking twice is a no-op.
    async fn mark_delivered(&self, sequence: i64) -> Result<()>;

    /// Deletes delivered entries and processed-message receipts recorded
    /// before `before`.
    ///
    /// A purged receipt no longer de-duplicates its message, so the
    /// retention must outlast any redelivery the channel can produce.
    async fn purge(&self, before: DateTime<Utc>) -> Result<Purged>;
}

/// Row counts removed by [`OutboxStore::purge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    pub outbox: u64,
    pub receipts: u64,
}

/// A change to an order, run inside the store's atomic update.
///
/// Returns the events the change implies; they are journaled together with
/// the new order state.
pub type OrderChange<'a> = &'a (dyn Fn(&mut Order) -> Result<Vec<EventEnvelope>> + Send + Sync);

/// Result of [`OrderStore::modify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    /// The change was committed; carries the updated order.
    Applied(Order),
    /// A receipt for this (order, topic) already exists; nothing changed.
    Duplicate,
    /// No order with that ID exists.
    NotFound,
}

/// Persistence for the order service.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Stores a new order and journals its outbound events.
    async fn create(&self, order: &Order, outbox: Vec<EventEnvelope>) -> Result<()>;

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Returns every order, oldest first.
    async fn list(&self) -> Result<Vec<Order>>;

    /// Applies `change` to an order as one version-guarded update.
    ///
    /// When `receipt` names the topic of the triggering message, the update
    /// is skipped if a receipt for (order, topic) exists, and the receipt is
    /// recorded otherwise.
    async fn modify(
        &self,
        order_id: OrderId,
        receipt: Option<Topic>,
        change: OrderChange<'_>,
    ) -> Result<Modification>;

    /// Returns the IDs of orders still awaiting confirmation that were
    /// placed at or before `cutoff`.
    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<OrderId>>;
}

/// Result of [`ResourceStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The resource was free and now holds the order.
    Assigned,
    /// The claim was rejected.
    Rejected(ConflictCause),
    /// The order-created message was already handled.
    Duplicate,
    /// The order was cancelled before its order-created arrived.
    OrderCancelled,
}

/// Turns a claim outcome into the events to journal with it.
pub type ClaimRender<'a> =
    &'a (dyn Fn(ClaimOutcome) -> Result<Vec<EventEnvelope>> + Send + Sync);

/// Result of [`ResourceStore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// The resource held by the order was freed.
    Released(ResourceId),
    /// The service holds nothing for this order.
    NotHeld,
    /// The order-cancelled message was already handled.
    Duplicate,
}

/// Persistence for one resource service (trucks or drivers).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// The kind of resource this store holds.
    fn kind(&self) -> ResourceKind;

    /// Replaces the whole collection.
    async fn seed(&self, resources: Vec<Resource>) -> Result<()>;

    async fn list(&self) -> Result<Vec<Resource>>;

    async fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>>;

    /// Atomically claims a free resource for an order.
    ///
    /// Compare-and-set on the free flag: at most one order can hold a
    /// resource. Records an order-created receipt, and journals whatever
    /// `render` produces for the outcome in the same step.
    async fn claim(
        &self,
        order_id: OrderId,
        resource_id: &ResourceId,
        render: ClaimRender<'_>,
    ) -> Result<ClaimOutcome>;

    /// Frees whatever resource the order holds.
    ///
    /// Only a resource whose holder is `order_id` is touched. Records an
    /// order-cancelled receipt, which later claims for the same order see.
    async fn release(&self, order_id: OrderId) -> Result<Release>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_names() {
        assert_eq!(Scope::Orders.as_str(), "order");
        assert_eq!(Scope::Resources(ResourceKind::Truck).as_str(), "truck");
        assert_eq!(Scope::Resources(ResourceKind::Driver).to_string(), "driver");
    }
}
