use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use crate::error::StorageError;
use crate::storage::{aggregate_stats, Storage};
use crate::types::{
    Delivery, DeliveryId, DeliveryStats, DeliveryStatus, EventType, Subscription, SubscriptionId,
};

// KEYS[1] = subscription doc, KEYS[2] = counters hash
// ARGV[1] = outcome field, ARGV[2] = timestamp
const RECORD_OUTCOME: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HINCRBY', KEYS[2], 'total', 1)
redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
redis.call('HSET', KEYS[2], 'last_triggered', ARGV[2])
return 1
"#;

// KEYS[1] = delivery doc, KEYS[2] = due zset, KEYS[3] = leases hash
// ARGV[1] = doc, ARGV[2] = due score or '', ARGV[3] = delivery id,
// ARGV[4] = lease the writer holds or ''
const UPDATE_DELIVERY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local held = redis.call('HGET', KEYS[3], ARGV[3])
if (held or '') ~= ARGV[4] then return 0 end
redis.call('HDEL', KEYS[3], ARGV[3])
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[2] == '' then
  redis.call('ZREM', KEYS[2], ARGV[3])
else
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
end
return 1
"#;

// Re-scoring a claimed member to the lease end hides it from other sweeps
// until the lease lapses. The lease is also recorded so that only its holder
// can write the outcome.
// KEYS[1] = due zset, KEYS[2] = leases hash
// ARGV[1] = now, ARGV[2] = lease end, ARGV[3] = limit
const CLAIM_DUE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
for _, id in ipairs(ids) do
  redis.call('ZADD', KEYS[1], ARGV[2], id)
  redis.call('HSET', KEYS[2], id, ARGV[2])
end
return ids
"#;

/// Redis-backed registry and ledger.
///
/// Layout under `prefix`:
/// - `subscriptions`: set of subscription ids
/// - `subscription:<id>`: subscription document
/// - `subscription:<id>:counters`: outcome counters hash
/// - `subscription:<id>:deliveries`: delivery ids scored by creation time
/// - `delivery:<id>`: delivery document
/// - `due`: retrying delivery ids scored by the time they become claimable
/// - `leases`: delivery id to the end of its current claim, in epoch millis
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
    record_outcome: redis::Script,
    update_delivery: redis::Script,
    claim_due: redis::Script,
}

fn backend(err: redis::RedisError) -> StorageError {
    StorageError::Backend(err.to_string())
}

impl RedisStorage {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            record_outcome: redis::Script::new(RECORD_OUTCOME),
            update_delivery: redis::Script::new(UPDATE_DELIVERY),
            claim_due: redis::Script::new(CLAIM_DUE),
        }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StorageError> {
        self.client.get_tokio_connection().await.map_err(backend)
    }

    fn subscriptions_key(&self) -> String {
        format!("{}:subscriptions", self.prefix)
    }

    fn subscription_key(&self, id: &SubscriptionId) -> String {
        format!("{}:subscription:{}", self.prefix, id)
    }

    fn counters_key(&self, id: &SubscriptionId) -> String {
        format!("{}:subscription:{}:counters", self.prefix, id)
    }

    fn subscription_deliveries_key(&self, id: &SubscriptionId) -> String {
        format!("{}:subscription:{}:deliveries", self.prefix, id)
    }

    fn delivery_key(&self, id: &str) -> String {
        format!("{}:delivery:{}", self.prefix, id)
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn leases_key(&self) -> String {
        format!("{}:leases", self.prefix)
    }

    /// Score of a delivery in the due set, or `None` if it must not be there.
    fn due_score(delivery: &Delivery) -> Option<i64> {
        if delivery.status != DeliveryStatus::Retrying {
            return None;
        }
        let due = delivery.next_retry_at?;
        let at = match delivery.claimed_until {
            Some(lease) if lease > due => lease,
            _ => due,
        };
        Some(at.timestamp_millis())
    }

    async fn load_subscription(
        &self,
        conn: &mut redis::aio::Connection,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StorageError> {
        let doc: Option<String> = conn.get(self.subscription_key(id)).await.map_err(backend)?;
        let Some(doc) = doc else {
            return Ok(None);
        };
        let mut subscription: Subscription = serde_json::from_str(&doc)?;

        let counters: HashMap<String, String> = conn.hgetall(self.counters_key(id)).await.map_err(backend)?;
        let count = |field: &str| counters.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        subscription.total_deliveries = count("total");
        subscription.successful_deliveries = count("successful");
        subscription.failed_deliveries = count("failed");
        subscription.last_triggered = counters
            .get("last_triggered")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(Some(subscription))
    }

    async fn load_all_subscriptions(
        &self,
        conn: &mut redis::aio::Connection,
    ) -> Result<Vec<Subscription>, StorageError> {
        let ids: Vec<String> = conn.smembers(self.subscriptions_key()).await.map_err(backend)?;
        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(subscription) = self.load_subscription(conn, &SubscriptionId(uuid)).await? {
                subscriptions.push(subscription);
            }
        }
        subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subscriptions)
    }

    async fn load_deliveries(
        &self,
        conn: &mut redis::aio::Connection,
        ids: &[String],
    ) -> Result<Vec<Delivery>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.delivery_key(id)).collect();
        let docs: Vec<Option<String>> = conn.mget(keys).await.map_err(backend)?;
        docs.into_iter()
            .flatten()
            .map(|doc| serde_json::from_str::<Delivery>(&doc).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let doc = serde_json::to_string(subscription)?;
        redis::pipe()
            .atomic()
            .set(self.subscription_key(&subscription.id), doc)
            .ignore()
            .sadd(self.subscriptions_key(), subscription.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        let mut conn = self.connection().await?;
        self.load_subscription(&mut conn, id).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let doc = serde_json::to_string(subscription)?;
        // Counters live in their own hash, so overwriting the document keeps them.
        let replaced: Option<String> = redis::cmd("SET")
            .arg(self.subscription_key(&subscription.id))
            .arg(doc)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        if replaced.is_none() {
            return Err(StorageError::SubscriptionNotFound(subscription.id));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: &SubscriptionId) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let deliveries_key = self.subscription_deliveries_key(id);
        let delivery_ids: Vec<String> = conn.zrange(&deliveries_key, 0, -1).await.map_err(backend)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.subscription_key(id))
            .del(self.counters_key(id))
            .ignore()
            .srem(self.subscriptions_key(), id.to_string())
            .ignore()
            .del(&deliveries_key)
            .ignore();
        for delivery_id in &delivery_ids {
            pipe.del(self.delivery_key(delivery_id))
                .ignore()
                .zrem(self.due_key(), delivery_id)
                .ignore()
                .hdel(self.leases_key(), delivery_id)
                .ignore();
        }

        let (removed,): (u64,) = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let mut conn = self.connection().await?;
        self.load_all_subscriptions(&mut conn).await
    }

    async fn find_active_subscriptions(&self, event_type: &EventType) -> Result<Vec<Subscription>, StorageError> {
        let mut conn = self.connection().await?;
        let all = self.load_all_subscriptions(&mut conn).await?;
        Ok(all
            .into_iter()
            .filter(|s| s.is_active && s.is_subscribed_to(event_type))
            .collect())
    }

    async fn record_outcome(
        &self,
        id: &SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let field = if success { "successful" } else { "failed" };
        let updated: i64 = self
            .record_outcome
            .key(self.subscription_key(id))
            .key(self.counters_key(id))
            .arg(field)
            .arg(at.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let id = delivery.id.to_string();
        let doc = serde_json::to_string(delivery)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.delivery_key(&id), doc)
            .ignore()
            .zadd(
                self.subscription_deliveries_key(&delivery.subscription_id),
                &id,
                delivery.created_at.timestamp_millis(),
            )
            .ignore();
        if let Some(score) = Self::due_score(delivery) {
            pipe.zadd(self.due_key(), &id, score).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await.map_err(backend)
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        let mut conn = self.connection().await?;
        let doc: Option<String> = conn
            .get(self.delivery_key(&id.to_string()))
            .await
            .map_err(backend)?;
        doc.map(|doc| serde_json::from_str(&doc).map_err(StorageError::from))
            .transpose()
    }

    async fn update_delivery(
        &self,
        delivery: &Delivery,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let id = delivery.id.to_string();
        let doc = serde_json::to_string(delivery)?;
        let score = Self::due_score(delivery).map(|s| s.to_string()).unwrap_or_default();
        let lease = lease.map(|at| at.timestamp_millis().to_string()).unwrap_or_default();

        let updated: i64 = self
            .update_delivery
            .key(self.delivery_key(&id))
            .key(self.due_key())
            .key(self.leases_key())
            .arg(doc)
            .arg(score)
            .arg(&id)
            .arg(lease)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn list_deliveries(
        &self,
        subscription_id: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn
            .zrevrange(self.subscription_deliveries_key(subscription_id), 0, stop)
            .await
            .map_err(backend)?;
        self.load_deliveries(&mut conn, &ids).await
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let ids: Vec<String> = self
            .claim_due
            .key(self.due_key())
            .key(self.leases_key())
            .arg(now.timestamp_millis())
            .arg(lease_until.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let doc: Option<String> = conn.get(self.delivery_key(id)).await.map_err(backend)?;
            let Some(doc) = doc else {
                // Removed together with its subscription after being scheduled.
                let _: () = redis::pipe()
                    .zrem(self.due_key(), id)
                    .ignore()
                    .hdel(self.leases_key(), id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                continue;
            };
            let mut delivery: Delivery = serde_json::from_str(&doc)?;
            if delivery.status != DeliveryStatus::Retrying {
                let _: () = redis::pipe()
                    .zrem(self.due_key(), id)
                    .ignore()
                    .hdel(self.leases_key(), id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                continue;
            }
            delivery.claimed_until = Some(lease_until);
            claimed.push(delivery);
        }
        Ok(claimed)
    }

    async fn delivery_stats(
        &self,
        subscription_id: Option<&SubscriptionId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryStats>, StorageError> {
        let mut conn = self.connection().await?;
        let subscription_ids = match subscription_id {
            Some(id) => vec![*id],
            None => {
                let ids: Vec<String> = conn.smembers(self.subscriptions_key()).await.map_err(backend)?;
                ids.iter()
                    .filter_map(|id| uuid::Uuid::parse_str(id).ok())
                    .map(SubscriptionId)
                    .collect()
            }
        };

        let mut deliveries = Vec::new();
        for id in &subscription_ids {
            let ids: Vec<String> = conn
                .zrangebyscore(
                    self.subscription_deliveries_key(id),
                    since.timestamp_millis(),
                    "+inf",
                )
                .await
                .map_err(backend)?;
            deliveries.extend(self.load_deliveries(&mut conn, &ids).await?);
        }

        Ok(aggregate_stats(&deliveries))
    }
}
