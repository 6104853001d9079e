use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::error::StorageError;
use crate::storage::{aggregate_stats, Storage};
use crate::types::{Delivery, DeliveryId, DeliveryStats, EventType, Subscription, SubscriptionId};

/// Postgres-backed registry and ledger.
///
/// Documents are kept as JSONB next to the columns that queries filter on.
/// Counters live in their own columns so outcome updates are single atomic
/// `UPDATE ... SET n = n + 1` statements.
pub struct PostgresStorage {
    client: Client,
}

fn backend(err: tokio_postgres::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    id UUID PRIMARY KEY,
                    events TEXT[] NOT NULL,
                    is_active BOOLEAN NOT NULL,
                    total_deliveries BIGINT NOT NULL DEFAULT 0,
                    successful_deliveries BIGINT NOT NULL DEFAULT 0,
                    failed_deliveries BIGINT NOT NULL DEFAULT 0,
                    last_triggered TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id UUID PRIMARY KEY,
                    subscription_id UUID NOT NULL
                        REFERENCES webhook_subscriptions (id) ON DELETE CASCADE,
                    status TEXT NOT NULL,
                    next_retry_at TIMESTAMPTZ,
                    claimed_until TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_deliveries_due
                    ON webhook_deliveries (next_retry_at) WHERE status = 'retrying'",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_deliveries_by_subscription
                    ON webhook_deliveries (subscription_id, created_at DESC)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    fn subscription_from_row(row: &Row) -> Result<Subscription, StorageError> {
        let payload: serde_json::Value = row.try_get("payload").map_err(backend)?;
        let mut subscription: Subscription = serde_json::from_value(payload)?;
        subscription.total_deliveries = row.try_get::<_, i64>("total_deliveries").map_err(backend)? as u64;
        subscription.successful_deliveries =
            row.try_get::<_, i64>("successful_deliveries").map_err(backend)? as u64;
        subscription.failed_deliveries = row.try_get::<_, i64>("failed_deliveries").map_err(backend)? as u64;
        subscription.last_triggered = row.try_get("last_triggered").map_err(backend)?;
        Ok(subscription)
    }

    fn delivery_from_row(row: &Row) -> Result<Delivery, StorageError> {
        let payload: serde_json::Value = row.try_get("payload").map_err(backend)?;
        Ok(serde_json::from_value(payload)?)
    }

    fn event_names(subscription: &Subscription) -> Vec<String> {
        subscription.events.iter().map(|e| e.as_str().to_string()).collect()
    }
}

const SUBSCRIPTION_COLUMNS: &str =
    "payload, total_deliveries, successful_deliveries, failed_deliveries, last_triggered";

#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let payload = serde_json::to_value(subscription)?;
        self.client
            .execute(
                "INSERT INTO webhook_subscriptions (id, events, is_active, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &subscription.id.0,
                    &Self::event_names(subscription),
                    &subscription.is_active,
                    &subscription.created_at,
                    &payload,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        let query = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1");
        let row = self.client.query_opt(&query, &[&id.0]).await.map_err(backend)?;
        row.as_ref().map(Self::subscription_from_row).transpose()
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let payload = serde_json::to_value(subscription)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_subscriptions
                 SET events = $2, is_active = $3, payload = $4
                 WHERE id = $1",
                &[
                    &subscription.id.0,
                    &Self::event_names(subscription),
                    &subscription.is_active,
                    &payload,
                ],
            )
            .await
            .map_err(backend)?;

        if updated == 0 {
            return Err(StorageError::SubscriptionNotFound(subscription.id));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: &SubscriptionId) -> Result<bool, StorageError> {
        let deleted = self
            .client
            .execute("DELETE FROM webhook_subscriptions WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let query = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions ORDER BY created_at DESC");
        let rows = self.client.query(&query, &[]).await.map_err(backend)?;
        rows.iter().map(Self::subscription_from_row).collect()
    }

    async fn find_active_subscriptions(&self, event_type: &EventType) -> Result<Vec<Subscription>, StorageError> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
             WHERE is_active AND $1 = ANY(events)
             ORDER BY created_at"
        );
        let rows = self
            .client
            .query(&query, &[&event_type.as_str()])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::subscription_from_row).collect()
    }

    async fn record_outcome(
        &self,
        id: &SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let (successful, failed): (i64, i64) = if success { (1, 0) } else { (0, 1) };
        let updated = self
            .client
            .execute(
                "UPDATE webhook_subscriptions
                 SET total_deliveries = total_deliveries + 1,
                     successful_deliveries = successful_deliveries + $2,
                     failed_deliveries = failed_deliveries + $3,
                     last_triggered = $4
                 WHERE id = $1",
                &[&id.0, &successful, &failed, &at],
            )
            .await
            .map_err(backend)?;
        Ok(updated > 0)
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        let payload = serde_json::to_value(delivery)?;
        self.client
            .execute(
                "INSERT INTO webhook_deliveries
                    (id, subscription_id, status, next_retry_at, claimed_until, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &delivery.id.0,
                    &delivery.subscription_id.0,
                    &delivery.status.as_str(),
                    &delivery.next_retry_at,
                    &delivery.claimed_until,
                    &delivery.created_at,
                    &payload,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM webhook_deliveries WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    async fn update_delivery(
        &self,
        delivery: &Delivery,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let payload = serde_json::to_value(delivery)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $2, next_retry_at = $3, claimed_until = $4, payload = $5
                 WHERE id = $1 AND claimed_until IS NOT DISTINCT FROM $6",
                &[
                    &delivery.id.0,
                    &delivery.status.as_str(),
                    &delivery.next_retry_at,
                    &delivery.claimed_until,
                    &payload,
                    &lease,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(updated > 0)
    }

    async fn list_deliveries(
        &self,
        subscription_id: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_deliveries
                 WHERE subscription_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
                &[&subscription_id.0, &limit],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        // SKIP LOCKED keeps concurrent sweepers off each other's rows.
        let rows = self
            .client
            .query(
                "UPDATE webhook_deliveries
                 SET claimed_until = $2
                 WHERE id IN (
                     SELECT id FROM webhook_deliveries
                     WHERE status = 'retrying'
                       AND next_retry_at <= $1
                       AND (claimed_until IS NULL OR claimed_until <= $1)
                     ORDER BY next_retry_at
                     LIMIT $3
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING payload",
                &[&now, &lease_until, &limit],
            )
            .await
            .map_err(backend)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut delivery = Self::delivery_from_row(row)?;
            delivery.claimed_until = Some(lease_until);
            claimed.push(delivery);
        }
        claimed.sort_by_key(|d| d.next_retry_at);
        Ok(claimed)
    }

    async fn delivery_stats(
        &self,
        subscription_id: Option<&SubscriptionId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryStats>, StorageError> {
        let rows = match subscription_id {
            Some(id) => self
                .client
                .query(
                    "SELECT payload FROM webhook_deliveries WHERE subscription_id = $1 AND created_at >= $2",
                    &[&id.0, &since],
                )
                .await
                .map_err(backend)?,
            None => self
                .client
                .query("SELECT payload FROM webhook_deliveries WHERE created_at >= $1", &[&since])
                .await
                .map_err(backend)?,
        };

        let deliveries = rows
            .iter()
            .map(Self::delivery_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(aggregate_stats(&deliveries))
    }
}
