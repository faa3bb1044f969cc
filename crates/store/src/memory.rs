use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ResourceId, ResourceKind};
use domain::{ConflictCause, Order, Resource, Topic};
use event_channel::EventEnvelope;
use tokio::sync::RwLock;

use crate::{
    Result, Version,
    store::{
        ClaimOutcome, ClaimRender, Modification, OrderChange, OrderStore, OutboxEntry,
        OutboxStore, Purged, Release, ResourceStore,
    },
};

/// Outbox journal kept next to a service's state.
///
/// Holds only undelivered entries; delivery happens in sequence order, so a
/// delivered entry is almost always the front one.
#[derive(Debug, Default)]
struct Journal {
    entries: VecDeque<OutboxEntry>,
    next_sequence: i64,
}

impl Journal {
    fn append(&mut self, envelopes: Vec<EventEnvelope>) {
        for envelope in envelopes {
            self.next_sequence += 1;
            self.entries.push_back(OutboxEntry {
                sequence: self.next_sequence,
                envelope,
            });
        }
    }

    fn pending(&self, limit: usize) -> Vec<OutboxEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    fn mark_delivered(&mut self, sequence: i64) {
        match self.entries.front() {
            Some(front) if front.sequence == sequence => {
                self.entries.pop_front();
            }
            _ => self.entries.retain(|entry| entry.sequence != sequence),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Processed-message receipts with the time each was recorded.
#[derive(Debug, Default)]
struct Receipts {
    recorded: HashMap<(OrderId, Topic), DateTime<Utc>>,
}

impl Receipts {
    fn contains(&self, order_id: OrderId, topic: Topic) -> bool {
        self.recorded.contains_key(&(order_id, topic))
    }

    /// Returns false if the receipt already existed.
    fn insert(&mut self, order_id: OrderId, topic: Topic) -> bool {
        match self.recorded.entry((order_id, topic)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        }
    }

    fn purge_before(&mut self, before: DateTime<Utc>) -> u64 {
        let len = self.recorded.len();
        self.recorded.retain(|_, at| *at >= before);
        (len - self.recorded.len()) as u64
    }

    fn len(&self) -> usize {
        self.recorded.len()
    }
}

#[derive(Debug, Default)]
struct OrderState {
    /// Order IDs in creation order.
    placed: Vec<OrderId>,
    rows: HashMap<OrderId, (Version, Order)>,
    receipts: Receipts,
    outbox: Journal,
}

/// In-memory order store for tests and single-process runs.
///
/// All operations take one write lock, so every modification is atomic.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<OrderState>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored version of an order.
    pub async fn version(&self, order_id: OrderId) -> Option<Version> {
        self.state
            .read()
            .await
            .rows
            .get(&order_id)
            .map(|(version, _)| *version)
    }

    /// Returns the number of journaled events awaiting delivery.
    pub async fn outbox_len(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns the number of processed-message receipts held.
    pub async fn receipt_count(&self) -> usize {
        self.state.read().await.receipts.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: &Order, outbox: Vec<EventEnvelope>) -> Result<()> {
        let mut state = self.state.write().await;
        let order_id = order.id();
        if state.rows.contains_key(&order_id) {
            return Err(crate::StoreError::ConcurrencyConflict {
                order_id,
                expected: Version::default(),
            });
        }

        state.placed.push(order_id);
        state.rows.insert(order_id, (Version::first(), order.clone()));
        state.outbox.append(outbox);
        Ok(())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state.rows.get(&order_id).map(|(_, order)| order.clone()))
    }

    async fn list(&self) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state
            .placed
            .iter()
            .filter_map(|id| state.rows.get(id))
            .map(|(_, order)| order.clone())
            .collect())
    }

    async fn modify(
        &self,
        order_id: OrderId,
        receipt: Option<Topic>,
        change: OrderChange<'_>,
    ) -> Result<Modification> {
        let mut state = self.state.write().await;

        if let Some(topic) = receipt
            && state.receipts.contains(order_id, topic)
        {
            return Ok(Modification::Duplicate);
        }

        let Some((version, mut order)) = state.rows.get(&order_id).cloned() else {
            return Ok(Modification::NotFound);
        };

        let events = change(&mut order)?;

        state.rows.insert(order_id, (version.next(), order.clone()));
        if let Some(topic) = receipt {
            state.receipts.insert(order_id, topic);
        }
        state.outbox.append(events);
        Ok(Modification::Applied(order))
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<OrderId>> {
        let state = self.state.read().await;
        Ok(state
            .placed
            .iter()
            .filter_map(|id| state.rows.get(id))
            .filter(|(_, order)| {
                order.is_pending() && order.placed_at().is_some_and(|placed| placed <= cutoff)
            })
            .map(|(_, order)| order.id())
            .collect())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOrderStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        Ok(self.state.read().await.outbox.pending(limit))
    }

    async fn mark_delivered(&self, sequence: i64) -> Result<()> {
        self.state.write().await.outbox.mark_delivered(sequence);
        Ok(())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<Purged> {
        let receipts = self.state.write().await.receipts.purge_before(before);
        Ok(Purged {
            outbox: 0,
            receipts,
        })
    }
}

#[derive(Debug, Default)]
struct ResourceState {
    resources: Vec<Resource>,
    receipts: Receipts,
    outbox: Journal,
}

/// In-memory store for one resource service.
#[derive(Clone)]
pub struct InMemoryResourceStore {
    kind: ResourceKind,
    state: Arc<RwLock<ResourceState>>,
}

impl InMemoryResourceStore {
    /// Creates an empty store for `kind`.
    pub fn new(kind: ResourceKind) -> Self {
        Self::with_resources(kind, Vec::new())
    }

    /// Creates a store pre-filled with `resources`.
    pub fn with_resources(kind: ResourceKind, resources: Vec<Resource>) -> Self {
        Self {
            kind,
            state: Arc::new(RwLock::new(ResourceState {
                resources,
                ..ResourceState::default()
            })),
        }
    }

    /// Returns the number of journaled events awaiting delivery.
    pub async fn outbox_len(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns the number of processed-message receipts held.
    pub async fn receipt_count(&self) -> usize {
        self.state.read().await.receipts.len()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn seed(&self, resources: Vec<Resource>) -> Result<()> {
        self.state.write().await.resources = resources;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Resource>> {
        Ok(self.state.read().await.resources.clone())
    }

    async fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>> {
        let state = self.state.read().await;
        Ok(state.resources.iter().find(|r| &r.id == resource_id).cloned())
    }

    async fn claim(
        &self,
        order_id: OrderId,
        resource_id: &ResourceId,
        render: ClaimRender<'_>,
    ) -> Result<ClaimOutcome> {
        let mut state = self.state.write().await;

        if state.receipts.contains(order_id, Topic::OrderCreated) {
            return Ok(ClaimOutcome::Duplicate);
        }

        let position = state.resources.iter().position(|r| &r.id == resource_id);
        let outcome = if state.receipts.contains(order_id, Topic::OrderCancelled) {
            ClaimOutcome::OrderCancelled
        } else {
            match position {
                None => ClaimOutcome::Rejected(ConflictCause::NotFound),
                Some(index) if state.resources[index].is_assigned => {
                    ClaimOutcome::Rejected(ConflictCause::AlreadyAssigned)
                }
                Some(_) => ClaimOutcome::Assigned,
            }
        };

        let events = render(outcome)?;

        if let (ClaimOutcome::Assigned, Some(index)) = (outcome, position) {
            let resource = &mut state.resources[index];
            resource.is_assigned = true;
            resource.assigned_order = Some(order_id);
        }
        state.receipts.insert(order_id, Topic::OrderCreated);
        state.outbox.append(events);
        Ok(outcome)
    }

    async fn release(&self, order_id: OrderId) -> Result<Release> {
        let mut state = self.state.write().await;

        if !state.receipts.insert(order_id, Topic::OrderCancelled) {
            return Ok(Release::Duplicate);
        }

        match state.resources.iter_mut().find(|r| r.is_held_by(order_id)) {
            Some(resource) => {
                resource.is_assigned = false;
                resource.assigned_order = None;
                Ok(Release::Released(resource.id.clone()))
            }
            None => Ok(Release::NotHeld),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryResourceStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        Ok(self.state.read().await.outbox.pending(limit))
    }

    async fn mark_delivered(&self, sequence: i64) -> Result<()> {
        self.state.write().await.outbox.mark_delivered(sequence);
        Ok(())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<Purged> {
        let receipts = self.state.write().await.receipts.purge_before(before);
        Ok(Purged {
            outbox: 0,
            receipts,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use domain::StatusCode;

    use super::*;
    use crate::StoreError;

    fn envelope(topic: &str, order_id: OrderId) -> EventEnvelope {
        EventEnvelope::new(topic, order_id.to_string(), serde_json::json!({}))
    }

    fn trucks() -> InMemoryResourceStore {
        InMemoryResourceStore::with_resources(
            ResourceKind::Truck,
            vec![
                Resource::new(ResourceKind::Truck, "T1", "F 3453 D"),
                Resource::new(ResourceKind::Truck, "T2", "F 4335 A"),
            ],
        )
    }

    fn announce(
        order_id: OrderId,
    ) -> impl Fn(ClaimOutcome) -> Result<Vec<EventEnvelope>> + Send + Sync {
        move |outcome| {
            Ok(match outcome {
                ClaimOutcome::Assigned => vec![envelope("truck-assigned", order_id)],
                ClaimOutcome::Rejected(_) => vec![envelope("truck-conflicted", order_id)],
                _ => Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn create_and_list_in_placement_order() {
        let store = InMemoryOrderStore::new();
        let first = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        let second = Order::place(ResourceId::new("T2"), ResourceId::new("D2"));

        store.create(&first, vec![envelope("order-created", first.id())]).await.unwrap();
        store.create(&second, Vec::new()).await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().iter().map(Order::id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert_eq!(store.version(first.id()).await, Some(Version::first()));
        assert_eq!(store.pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_existing_order() {
        let store = InMemoryOrderStore::new();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        store.create(&order, Vec::new()).await.unwrap();

        let result = store.create(&order, Vec::new()).await;
        assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn modify_skips_duplicate_receipt() {
        let store = InMemoryOrderStore::new();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        store.create(&order, Vec::new()).await.unwrap();

        let change = |order: &mut Order| -> Result<Vec<EventEnvelope>> {
            order.record_assignment(ResourceKind::Truck);
            Ok(Vec::new())
        };

        let first = store
            .modify(order.id(), Some(Topic::TruckAssigned), &change)
            .await
            .unwrap();
        assert!(matches!(first, Modification::Applied(ref o) if o.fulfillment().is_truck_assigned));

        let again = store
            .modify(order.id(), Some(Topic::TruckAssigned), &change)
            .await
            .unwrap();
        assert_eq!(again, Modification::Duplicate);
        assert_eq!(store.version(order.id()).await, Some(Version::new(2)));
    }

    #[tokio::test]
    async fn modify_unknown_order() {
        let store = InMemoryOrderStore::new();
        let result = store
            .modify(OrderId::new(), Some(Topic::DriverAssigned), &|_| Ok(Vec::new()))
            .await
            .unwrap();
        assert_eq!(result, Modification::NotFound);
    }

    #[tokio::test]
    async fn failed_change_leaves_order_untouched() {
        let store = InMemoryOrderStore::new();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        store.create(&order, Vec::new()).await.unwrap();

        let result = store
            .modify(order.id(), Some(Topic::TruckAssigned), &|order: &mut Order| {
                order.record_assignment(ResourceKind::Truck);
                Err(StoreError::CorruptRow("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let stored = store.get(order.id()).await.unwrap().unwrap();
        assert!(!stored.fulfillment().is_truck_assigned);

        // the receipt was not recorded, so a redelivery still applies
        let retried = store
            .modify(order.id(), Some(Topic::TruckAssigned), &|order: &mut Order| {
                order.record_assignment(ResourceKind::Truck);
                Ok(Vec::new())
            })
            .await
            .unwrap();
        assert!(matches!(retried, Modification::Applied(_)));
    }

    #[tokio::test]
    async fn stale_pending_ignores_settled_orders() {
        let store = InMemoryOrderStore::new();
        let pending = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        let mut cancelled = Order::place(ResourceId::new("T2"), ResourceId::new("D2"));
        cancelled.record_conflict(ResourceKind::Truck, "truck T2 not found");
        store.create(&pending, Vec::new()).await.unwrap();
        store.create(&cancelled, Vec::new()).await.unwrap();

        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(store.stale_pending(later).await.unwrap(), vec![pending.id()]);

        let earlier = Utc::now() - Duration::hours(1);
        assert!(store.stale_pending(earlier).await.unwrap().is_empty());
        assert_eq!(cancelled.current_status(), StatusCode::Conflicted);
    }

    #[tokio::test]
    async fn outbox_pending_and_delivery() {
        let store = InMemoryOrderStore::new();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        store
            .create(
                &order,
                vec![envelope("a", order.id()), envelope("b", order.id())],
            )
            .await
            .unwrap();

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].sequence < pending[1].sequence);

        store.mark_delivered(pending[0].sequence).await.unwrap();
        store.mark_delivered(pending[0].sequence).await.unwrap();
        let rest = store.pending(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].envelope.topic, "b");
    }

    #[tokio::test]
    async fn delivered_entries_leave_the_journal() {
        let store = InMemoryOrderStore::new();
        for _ in 0..1000 {
            let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
            store
                .create(&order, vec![envelope("order-created", order.id())])
                .await
                .unwrap();
        }
        assert_eq!(store.outbox_len().await, 1000);

        loop {
            let batch = store.pending(100).await.unwrap();
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                store.mark_delivered(entry.sequence).await.unwrap();
            }
        }
        assert_eq!(store.outbox_len().await, 0);
    }

    #[tokio::test]
    async fn out_of_order_delivery_keeps_the_rest() {
        let store = InMemoryOrderStore::new();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        store
            .create(
                &order,
                vec![
                    envelope("a", order.id()),
                    envelope("b", order.id()),
                    envelope("c", order.id()),
                ],
            )
            .await
            .unwrap();

        let pending = store.pending(10).await.unwrap();
        store.mark_delivered(pending[1].sequence).await.unwrap();

        let topics: Vec<_> = store
            .pending(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.envelope.topic)
            .collect();
        assert_eq!(topics, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn purge_drops_old_receipts() {
        let store = InMemoryOrderStore::new();
        let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
        store.create(&order, Vec::new()).await.unwrap();
        store
            .modify(order.id(), Some(Topic::TruckAssigned), &|_: &mut Order| Ok(Vec::new()))
            .await
            .unwrap();
        assert_eq!(store.receipt_count().await, 1);

        let past = Utc::now() - Duration::hours(1);
        assert_eq!(store.purge(past).await.unwrap(), Purged::default());
        assert_eq!(store.receipt_count().await, 1);

        let later = Utc::now() + Duration::seconds(1);
        let purged = store.purge(later).await.unwrap();
        assert_eq!(purged.receipts, 1);
        assert_eq!(store.receipt_count().await, 0);
    }

    #[tokio::test]
    async fn purge_resource_receipts() {
        let store = trucks();
        let order = OrderId::new();
        store.claim(order, &ResourceId::new("T1"), &announce(order)).await.unwrap();
        store.release(order).await.unwrap();
        assert_eq!(store.receipt_count().await, 2);

        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(store.purge(later).await.unwrap().receipts, 2);
        assert_eq!(store.receipt_count().await, 0);
    }

    #[tokio::test]
    async fn claim_assigns_free_resource_once() {
        let store = trucks();
        let first = OrderId::new();
        let second = OrderId::new();

        let outcome = store.claim(first, &ResourceId::new("T1"), &announce(first)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Assigned);

        let outcome = store.claim(second, &ResourceId::new("T1"), &announce(second)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Rejected(ConflictCause::AlreadyAssigned));

        let truck = store.get(&ResourceId::new("T1")).await.unwrap().unwrap();
        assert!(truck.is_held_by(first));
        assert_eq!(store.outbox_len().await, 2);
    }

    #[tokio::test]
    async fn claim_unknown_resource() {
        let store = trucks();
        let order = OrderId::new();
        let outcome = store.claim(order, &ResourceId::new("T9"), &announce(order)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Rejected(ConflictCause::NotFound));
    }

    #[tokio::test]
    async fn duplicate_claim_does_nothing() {
        let store = trucks();
        let order = OrderId::new();
        store.claim(order, &ResourceId::new("T1"), &announce(order)).await.unwrap();

        let outcome = store.claim(order, &ResourceId::new("T1"), &announce(order)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Duplicate);
        assert_eq!(store.outbox_len().await, 1);
    }

    #[tokio::test]
    async fn release_only_frees_holder() {
        let store = trucks();
        let holder = OrderId::new();
        let other = OrderId::new();
        store.claim(holder, &ResourceId::new("T1"), &announce(holder)).await.unwrap();

        assert_eq!(store.release(other).await.unwrap(), Release::NotHeld);
        assert!(store.get(&ResourceId::new("T1")).await.unwrap().unwrap().is_assigned);

        assert_eq!(
            store.release(holder).await.unwrap(),
            Release::Released(ResourceId::new("T1"))
        );
        assert_eq!(store.release(holder).await.unwrap(), Release::Duplicate);
        assert!(!store.get(&ResourceId::new("T1")).await.unwrap().unwrap().is_assigned);
    }

    #[tokio::test]
    async fn claim_after_cancellation_is_skipped() {
        let store = trucks();
        let order = OrderId::new();
        store.release(order).await.unwrap();

        let outcome = store.claim(order, &ResourceId::new("T1"), &announce(order)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::OrderCancelled);
        assert!(!store.get(&ResourceId::new("T1")).await.unwrap().unwrap().is_assigned);
        assert_eq!(store.outbox_len().await, 0);
    }

    #[tokio::test]
    async fn seed_replaces_collection() {
        let store = trucks();
        store
            .seed(vec![Resource::new(ResourceKind::Truck, "T7", "B 1 X")])
            .await
            .unwrap();
        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ResourceId::new("T7")]);
    }
}
