use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ResourceId, ResourceKind};
use domain::{ConflictCause, Order, Resource, Topic};
use event_channel::{EventEnvelope, EventId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError, Version,
    store::{
        ClaimOutcome, ClaimRender, Modification, OrderChange, OrderStore, OutboxEntry,
        OutboxStore, Purged, Release, ResourceStore, Scope,
    },
};

/// Runs the database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Records a receipt for (order, topic) in `scope`.
///
/// Returns false if the receipt already existed.
async fn record_receipt(
    tx: &mut Transaction<'_, Postgres>,
    scope: Scope,
    order_id: OrderId,
    topic: Topic,
) -> Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO processed_messages (scope, order_id, topic)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(scope.as_str())
    .bind(order_id.as_uuid())
    .bind(topic.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(inserted.rows_affected() == 1)
}

async fn has_receipt(
    tx: &mut Transaction<'_, Postgres>,
    scope: Scope,
    order_id: OrderId,
    topic: Topic,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM processed_messages
            WHERE scope = $1 AND order_id = $2 AND topic = $3
        )
        "#,
    )
    .bind(scope.as_str())
    .bind(order_id.as_uuid())
    .bind(topic.as_str())
    .fetch_one(&mut **tx)
    .await?;

    Ok(exists)
}

/// Serializes claim and release for one order within a scope.
async fn lock_order(
    tx: &mut Transaction<'_, Postgres>,
    scope: Scope,
    order_id: OrderId,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("{scope}:{order_id}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn append_outbox(
    tx: &mut Transaction<'_, Postgres>,
    scope: Scope,
    envelopes: &[EventEnvelope],
) -> Result<()> {
    for envelope in envelopes {
        sqlx::query(
            r#"
            INSERT INTO outbox (scope, event_id, topic, key, timestamp, payload, headers)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(scope.as_str())
        .bind(envelope.event_id.as_uuid())
        .bind(&envelope.topic)
        .bind(&envelope.key)
        .bind(envelope.timestamp)
        .bind(&envelope.payload)
        .bind(serde_json::to_value(&envelope.headers)?)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn pending_entries(pool: &PgPool, scope: Scope, limit: usize) -> Result<Vec<OutboxEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT sequence, event_id, topic, key, timestamp, payload, headers
        FROM outbox
        WHERE scope = $1 AND delivered_at IS NULL
        ORDER BY sequence ASC
        LIMIT $2
        "#,
    )
    .bind(scope.as_str())
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_entry).collect()
}

async fn mark_entry_delivered(pool: &PgPool, scope: Scope, sequence: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE outbox SET delivered_at = NOW()
        WHERE scope = $1 AND sequence = $2 AND delivered_at IS NULL
        "#,
    )
    .bind(scope.as_str())
    .bind(sequence)
    .execute(pool)
    .await?;
    Ok(())
}

/// Deletes delivered outbox rows and receipts of `scope` older than `before`.
async fn purge_scope(pool: &PgPool, scope: Scope, before: DateTime<Utc>) -> Result<Purged> {
    let mut tx = pool.begin().await?;

    let outbox = sqlx::query(
        r#"
        DELETE FROM outbox
        WHERE scope = $1 AND delivered_at IS NOT NULL AND delivered_at < $2
        "#,
    )
    .bind(scope.as_str())
    .bind(before)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let receipts = sqlx::query(
        r#"
        DELETE FROM processed_messages
        WHERE scope = $1 AND processed_at < $2
        "#,
    )
    .bind(scope.as_str())
    .bind(before)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;
    Ok(Purged { outbox, receipts })
}

fn row_to_entry(row: PgRow) -> Result<OutboxEntry> {
    let headers: serde_json::Value = row.try_get("headers")?;

    Ok(OutboxEntry {
        sequence: row.try_get("sequence")?,
        envelope: EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            topic: row.try_get("topic")?,
            key: row.try_get("key")?,
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            headers: serde_json::from_value(headers)?,
        },
    })
}

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: &PgRow) -> Result<Order> {
        let body: serde_json::Value = row.try_get("body")?;
        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn create(&self, order: &Order, outbox: Vec<EventEnvelope>) -> Result<()> {
        let order_id = order.id();
        let placed_at = order
            .placed_at()
            .ok_or_else(|| StoreError::CorruptRow(format!("order {order_id} has no history")))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, body, version, is_pending, placed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(serde_json::to_value(order)?)
        .bind(Version::first().as_i64())
        .bind(order.is_pending())
        .bind(placed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::ConcurrencyConflict {
                    order_id,
                    expected: Version::default(),
                };
            }
            StoreError::Database(e)
        })?;

        append_outbox(&mut tx, Scope::Orders, &outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row: Option<PgRow> = sqlx::query("SELECT body FROM orders WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn list(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query("SELECT body FROM orders ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn modify(
        &self,
        order_id: OrderId,
        receipt: Option<Topic>,
        change: OrderChange<'_>,
    ) -> Result<Modification> {
        let mut tx = self.pool.begin().await?;

        if let Some(topic) = receipt
            && !record_receipt(&mut tx, Scope::Orders, order_id, topic).await?
        {
            return Ok(Modification::Duplicate);
        }

        let row: Option<PgRow> =
            sqlx::query("SELECT body, version FROM orders WHERE order_id = $1")
                .bind(order_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

        let Some(row) = row else {
            return Ok(Modification::NotFound);
        };

        let expected = Version::new(row.try_get("version")?);
        let mut order = Self::row_to_order(&row)?;
        let events = change(&mut order)?;

        let updated = sqlx::query(
            r#"
            UPDATE orders SET body = $1, version = $2, is_pending = $3
            WHERE order_id = $4 AND version = $5
            "#,
        )
        .bind(serde_json::to_value(&order)?)
        .bind(expected.next().as_i64())
        .bind(order.is_pending())
        .bind(order_id.as_uuid())
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::ConcurrencyConflict { order_id, expected });
        }

        append_outbox(&mut tx, Scope::Orders, &events).await?;
        tx.commit().await?;
        Ok(Modification::Applied(order))
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<OrderId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT order_id FROM orders
            WHERE is_pending AND placed_at <= $1
            ORDER BY seq ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(OrderId::from_uuid).collect())
    }
}

#[async_trait]
impl OutboxStore for PostgresOrderStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        pending_entries(&self.pool, Scope::Orders, limit).await
    }

    async fn mark_delivered(&self, sequence: i64) -> Result<()> {
        mark_entry_delivered(&self.pool, Scope::Orders, sequence).await
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<Purged> {
        purge_scope(&self.pool, Scope::Orders, before).await
    }
}

/// PostgreSQL-backed store for one resource service.
#[derive(Clone)]
pub struct PostgresResourceStore {
    pool: PgPool,
    kind: ResourceKind,
}

impl PostgresResourceStore {
    pub fn new(pool: PgPool, kind: ResourceKind) -> Self {
        Self { pool, kind }
    }

    fn scope(&self) -> Scope {
        Scope::Resources(self.kind)
    }

    fn row_to_resource(&self, row: PgRow) -> Result<Resource> {
        Ok(Resource {
            id: ResourceId::new(row.try_get::<String, _>("id")?),
            kind: self.kind,
            name: row.try_get("name")?,
            is_assigned: row.try_get("is_assigned")?,
            assigned_order: row
                .try_get::<Option<Uuid>, _>("assigned_order")?
                .map(OrderId::from_uuid),
        })
    }
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn seed(&self, resources: Vec<Resource>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM resources WHERE kind = $1")
            .bind(self.kind.as_str())
            .execute(&mut *tx)
            .await?;

        for resource in &resources {
            sqlx::query(
                r#"
                INSERT INTO resources (kind, id, name, is_assigned, assigned_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(self.kind.as_str())
            .bind(resource.id.as_str())
            .bind(&resource.name)
            .bind(resource.is_assigned)
            .bind(resource.assigned_order.map(|id| id.as_uuid()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(kind = %self.kind, count = resources.len(), "resources seeded");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Resource>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, is_assigned, assigned_order
            FROM resources
            WHERE kind = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(self.kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_resource(row)).collect()
    }

    async fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, name, is_assigned, assigned_order
            FROM resources
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(self.kind.as_str())
        .bind(resource_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_resource(row)).transpose()
    }

    async fn claim(
        &self,
        order_id: OrderId,
        resource_id: &ResourceId,
        render: ClaimRender<'_>,
    ) -> Result<ClaimOutcome> {
        let scope = self.scope();
        let mut tx = self.pool.begin().await?;
        lock_order(&mut tx, scope, order_id).await?;

        if !record_receipt(&mut tx, scope, order_id, Topic::OrderCreated).await? {
            return Ok(ClaimOutcome::Duplicate);
        }

        let outcome = if has_receipt(&mut tx, scope, order_id, Topic::OrderCancelled).await? {
            ClaimOutcome::OrderCancelled
        } else {
            let claimed = sqlx::query(
                r#"
                UPDATE resources SET is_assigned = TRUE, assigned_order = $1
                WHERE kind = $2 AND id = $3 AND is_assigned = FALSE
                "#,
            )
            .bind(order_id.as_uuid())
            .bind(self.kind.as_str())
            .bind(resource_id.as_str())
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 1 {
                ClaimOutcome::Assigned
            } else {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM resources WHERE kind = $1 AND id = $2)",
                )
                .bind(self.kind.as_str())
                .bind(resource_id.as_str())
                .fetch_one(&mut *tx)
                .await?;

                if exists {
                    ClaimOutcome::Rejected(ConflictCause::AlreadyAssigned)
                } else {
                    ClaimOutcome::Rejected(ConflictCause::NotFound)
                }
            }
        };

        let events = render(outcome)?;
        append_outbox(&mut tx, scope, &events).await?;
        tx.commit().await?;

        tracing::debug!(%order_id, resource = %resource_id, ?outcome, "claim committed");
        Ok(outcome)
    }

    async fn release(&self, order_id: OrderId) -> Result<Release> {
        let scope = self.scope();
        let mut tx = self.pool.begin().await?;
        lock_order(&mut tx, scope, order_id).await?;

        if !record_receipt(&mut tx, scope, order_id, Topic::OrderCancelled).await? {
            return Ok(Release::Duplicate);
        }

        let released: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE resources SET is_assigned = FALSE, assigned_order = NULL
            WHERE kind = $1 AND assigned_order = $2
            RETURNING id
            "#,
        )
        .bind(self.kind.as_str())
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match released {
            Some(id) => Release::Released(ResourceId::new(id)),
            None => Release::NotHeld,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresResourceStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        pending_entries(&self.pool, self.scope(), limit).await
    }

    async fn mark_delivered(&self, sequence: i64) -> Result<()> {
        mark_entry_delivered(&self.pool, self.scope(), sequence).await
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<Purged> {
        purge_scope(&self.pool, self.scope(), before).await
    }
}
