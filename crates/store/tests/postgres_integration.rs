//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use common::{OrderId, ResourceId, ResourceKind};
use domain::{ConflictCause, Order, Resource, Topic};
use event_channel::EventEnvelope;
use serial_test::serial;
use sqlx::PgPool;
use store::{
    ClaimOutcome, Modification, OrderStore, OutboxStore, PostgresOrderStore,
    PostgresResourceStore, Purged, Release, ResourceStore, StoreError,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            for migration in [
                include_str!("../../../migrations/001_create_dispatch_tables.sql"),
                include_str!("../../../migrations/002_retention_indexes.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE orders, resources, processed_messages, outbox")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

async fn get_truck_store(pool: PgPool) -> PostgresResourceStore {
    let store = PostgresResourceStore::new(pool, ResourceKind::Truck);
    store
        .seed(vec![
            Resource::new(ResourceKind::Truck, "T1", "F 3453 D"),
            Resource::new(ResourceKind::Truck, "T2", "F 4335 A"),
        ])
        .await
        .unwrap();
    store
}

fn envelope(topic: &str, order_id: OrderId) -> EventEnvelope {
    EventEnvelope::builder()
        .topic(topic)
        .key(order_id.to_string())
        .payload_raw(serde_json::json!({ "orderId": order_id }))
        .header("source", "test")
        .build()
}

fn announce(
    order_id: OrderId,
) -> impl Fn(ClaimOutcome) -> store::Result<Vec<EventEnvelope>> + Send + Sync {
    move |outcome| {
        Ok(match outcome {
            ClaimOutcome::Assigned => vec![envelope("truck-assigned", order_id)],
            ClaimOutcome::Rejected(_) => vec![envelope("truck-conflicted", order_id)],
            _ => Vec::new(),
        })
    }
}

#[tokio::test]
#[serial]
async fn create_get_and_list_orders() {
    let store = PostgresOrderStore::new(get_test_pool().await);
    let first = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
    let second = Order::place(ResourceId::new("T2"), ResourceId::new("D2"));

    store
        .create(&first, vec![envelope("order-created", first.id())])
        .await
        .unwrap();
    store.create(&second, Vec::new()).await.unwrap();

    assert_eq!(store.get(first.id()).await.unwrap(), Some(first.clone()));
    assert!(store.get(OrderId::new()).await.unwrap().is_none());

    let ids: Vec<_> = store.list().await.unwrap().iter().map(Order::id).collect();
    assert_eq!(ids, vec![first.id(), second.id()]);
}

#[tokio::test]
#[serial]
async fn create_twice_is_a_conflict() {
    let store = PostgresOrderStore::new(get_test_pool().await);
    let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
    store.create(&order, Vec::new()).await.unwrap();

    let result = store.create(&order, Vec::new()).await;
    assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
}

#[tokio::test]
#[serial]
async fn modify_records_receipt_and_outbox() {
    let store = PostgresOrderStore::new(get_test_pool().await);
    let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
    store.create(&order, Vec::new()).await.unwrap();

    let change = |order: &mut Order| -> store::Result<Vec<EventEnvelope>> {
        order.record_assignment(ResourceKind::Truck);
        order.record_assignment(ResourceKind::Driver);
        Ok(vec![envelope("order-ready", order.id())])
    };

    let applied = store
        .modify(order.id(), Some(Topic::DriverAssigned), &change)
        .await
        .unwrap();
    let Modification::Applied(updated) = applied else {
        panic!("Expected Applied");
    };
    assert!(updated.is_ready());

    let again = store
        .modify(order.id(), Some(Topic::DriverAssigned), &change)
        .await
        .unwrap();
    assert_eq!(again, Modification::Duplicate);

    let pending = store.pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].envelope.topic, "order-ready");
    assert_eq!(pending[0].envelope.header("source"), Some("test"));

    // a ready order is no longer pending
    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    assert!(store.stale_pending(later).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn modify_missing_order_leaves_no_receipt() {
    let store = PostgresOrderStore::new(get_test_pool().await);
    let order_id = OrderId::new();

    let result = store
        .modify(order_id, Some(Topic::TruckAssigned), &|_| Ok(Vec::new()))
        .await
        .unwrap();
    assert_eq!(result, Modification::NotFound);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
#[serial]
async fn outbox_is_scoped_per_service() {
    let pool = get_test_pool().await;
    let orders = PostgresOrderStore::new(pool.clone());
    let trucks = get_truck_store(pool).await;

    let order = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
    orders
        .create(&order, vec![envelope("order-created", order.id())])
        .await
        .unwrap();
    trucks
        .claim(order.id(), &ResourceId::new("T1"), &announce(order.id()))
        .await
        .unwrap();

    let order_outbox = orders.pending(10).await.unwrap();
    let truck_outbox = trucks.pending(10).await.unwrap();
    assert_eq!(order_outbox.len(), 1);
    assert_eq!(order_outbox[0].envelope.topic, "order-created");
    assert_eq!(truck_outbox.len(), 1);
    assert_eq!(truck_outbox[0].envelope.topic, "truck-assigned");

    orders.mark_delivered(order_outbox[0].sequence).await.unwrap();
    assert!(orders.pending(10).await.unwrap().is_empty());
    assert_eq!(trucks.pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn claim_outcomes() {
    let trucks = get_truck_store(get_test_pool().await).await;
    let first = OrderId::new();
    let second = OrderId::new();
    let third = OrderId::new();

    let outcome = trucks
        .claim(first, &ResourceId::new("T1"), &announce(first))
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::Assigned);

    let outcome = trucks
        .claim(second, &ResourceId::new("T1"), &announce(second))
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::Rejected(ConflictCause::AlreadyAssigned));

    let outcome = trucks
        .claim(third, &ResourceId::new("T9"), &announce(third))
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::Rejected(ConflictCause::NotFound));

    let outcome = trucks
        .claim(first, &ResourceId::new("T1"), &announce(first))
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::Duplicate);

    let truck = trucks.get(&ResourceId::new("T1")).await.unwrap().unwrap();
    assert!(truck.is_held_by(first));
}

#[tokio::test]
#[serial]
async fn concurrent_claims_have_one_winner() {
    let trucks = get_truck_store(get_test_pool().await).await;
    let orders: Vec<OrderId> = (0..8).map(|_| OrderId::new()).collect();

    let claims = orders.iter().map(|order_id| {
        let trucks = trucks.clone();
        let order_id = *order_id;
        async move {
            trucks
                .claim(order_id, &ResourceId::new("T2"), &announce(order_id))
                .await
                .unwrap()
        }
    });
    let outcomes = futures_util::future::join_all(claims).await;

    let winners = outcomes
        .iter()
        .filter(|o| **o == ClaimOutcome::Assigned)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ClaimOutcome::Rejected(ConflictCause::AlreadyAssigned))
            .count(),
        7
    );
}

#[tokio::test]
#[serial]
async fn release_is_holder_guarded_and_blocks_late_claims() {
    let trucks = get_truck_store(get_test_pool().await).await;
    let holder = OrderId::new();
    let loser = OrderId::new();

    trucks
        .claim(holder, &ResourceId::new("T1"), &announce(holder))
        .await
        .unwrap();
    trucks
        .claim(loser, &ResourceId::new("T1"), &announce(loser))
        .await
        .unwrap();

    // the loser's cancellation must not free the holder's truck
    assert_eq!(trucks.release(loser).await.unwrap(), Release::NotHeld);
    assert!(trucks.get(&ResourceId::new("T1")).await.unwrap().unwrap().is_held_by(holder));

    assert_eq!(
        trucks.release(holder).await.unwrap(),
        Release::Released(ResourceId::new("T1"))
    );
    assert_eq!(trucks.release(holder).await.unwrap(), Release::Duplicate);

    // order-created arriving after order-cancelled
    let late = OrderId::new();
    trucks.release(late).await.unwrap();
    let outcome = trucks
        .claim(late, &ResourceId::new("T2"), &announce(late))
        .await
        .unwrap();
    assert_eq!(outcome, ClaimOutcome::OrderCancelled);
    assert!(!trucks.get(&ResourceId::new("T2")).await.unwrap().unwrap().is_assigned);
}

#[tokio::test]
#[serial]
async fn seed_replaces_only_own_kind() {
    let pool = get_test_pool().await;
    let trucks = get_truck_store(pool.clone()).await;
    let drivers = PostgresResourceStore::new(pool, ResourceKind::Driver);
    drivers
        .seed(vec![Resource::new(ResourceKind::Driver, "D1", "Meong 1")])
        .await
        .unwrap();

    trucks
        .seed(vec![Resource::new(ResourceKind::Truck, "T3", "B 9 Z")])
        .await
        .unwrap();

    let truck_ids: Vec<_> = trucks.list().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(truck_ids, vec![ResourceId::new("T3")]);
    assert_eq!(drivers.list().await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn purge_removes_old_delivered_rows_and_receipts() {
    let pool = get_test_pool().await;
    let orders = PostgresOrderStore::new(pool.clone());
    let trucks = get_truck_store(pool).await;

    let delivered = Order::place(ResourceId::new("T1"), ResourceId::new("D1"));
    let waiting = Order::place(ResourceId::new("T2"), ResourceId::new("D2"));
    orders
        .create(&delivered, vec![envelope("order-created", delivered.id())])
        .await
        .unwrap();
    orders
        .create(&waiting, vec![envelope("order-created", waiting.id())])
        .await
        .unwrap();
    orders
        .modify(delivered.id(), Some(Topic::TruckAssigned), &|_: &mut Order| Ok(Vec::new()))
        .await
        .unwrap();

    let pending = orders.pending(10).await.unwrap();
    orders.mark_delivered(pending[0].sequence).await.unwrap();

    let order_id = OrderId::new();
    trucks.claim(order_id, &ResourceId::new("T1"), &announce(order_id)).await.unwrap();

    // nothing is old enough yet
    let past = chrono::Utc::now() - chrono::Duration::hours(1);
    assert_eq!(orders.purge(past).await.unwrap(), Purged::default());

    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    let purged = orders.purge(later).await.unwrap();
    assert_eq!(purged, Purged { outbox: 1, receipts: 1 });

    // the undelivered entry survives
    let rest = orders.pending(10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].envelope.key, waiting.id().to_string());

    // the truck service's receipt is in its own scope
    let purged = trucks.purge(later).await.unwrap();
    assert_eq!(purged, Purged { outbox: 0, receipts: 1 });
}
