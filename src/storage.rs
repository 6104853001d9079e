use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::StorageError;
use crate::types::{
    Delivery, DeliveryId, DeliveryStats, DeliveryStatus, EventType, Subscription, SubscriptionId,
};

/// Persistence for the subscription registry and the delivery ledger.
///
/// Implementations must make [`Storage::record_outcome`] atomic and
/// [`Storage::claim_due_deliveries`] exclusive: two concurrent claims never
/// return the same delivery while its lease is live.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError>;

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError>;

    /// Replace the configuration fields of a subscription.
    ///
    /// Running counters are owned by [`Storage::record_outcome`] and are left untouched.
    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StorageError>;

    /// Remove a subscription and every delivery it owns.
    ///
    /// Returns `false` when no such subscription existed.
    async fn delete_subscription(&self, id: &SubscriptionId) -> Result<bool, StorageError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError>;

    /// Active subscriptions whose event set contains `event_type`.
    async fn find_active_subscriptions(&self, event_type: &EventType) -> Result<Vec<Subscription>, StorageError>;

    /// Atomically bump the terminal-outcome counters and `last_triggered`.
    ///
    /// Returns `false` when the subscription no longer exists.
    async fn record_outcome(
        &self,
        id: &SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError>;

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError>;

    /// Overwrite a stored delivery held under `lease`.
    ///
    /// `lease` is the `claimed_until` the writer read the delivery with
    /// (`None` for first attempts). Returns `false`, writing nothing, when the
    /// delivery no longer exists or its stored claim differs.
    async fn update_delivery(
        &self,
        delivery: &Delivery,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError>;

    /// Deliveries of one subscription, newest first.
    async fn list_deliveries(
        &self,
        subscription_id: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError>;

    /// Claim up to `limit` retrying deliveries due at `now`, oldest due first.
    ///
    /// Claimed deliveries get `claimed_until = lease_until`.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError>;

    /// Per-status counts and mean response time of deliveries created since `since`.
    async fn delivery_stats(
        &self,
        subscription_id: Option<&SubscriptionId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryStats>, StorageError>;
}

/// Whether a delivery may be claimed by a sweep at `now`.
pub(crate) fn is_claimable(delivery: &Delivery, now: DateTime<Utc>) -> bool {
    delivery.status == DeliveryStatus::Retrying
        && delivery.next_retry_at.is_some_and(|due| due <= now)
        && delivery.claimed_until.map_or(true, |until| until <= now)
}

/// Group deliveries by status; the response time of a delivery is its latest attempt's.
pub(crate) fn aggregate_stats<'a, I>(deliveries: I) -> Vec<DeliveryStats>
where
    I: IntoIterator<Item = &'a Delivery>,
{
    let mut groups: BTreeMap<DeliveryStatus, (u64, u64, u64)> = BTreeMap::new();

    for delivery in deliveries {
        let entry = groups.entry(delivery.status).or_default();
        entry.0 += 1;
        if let Some(attempt) = delivery.last_attempt() {
            entry.1 += attempt.response_time_ms;
            entry.2 += 1;
        }
    }

    groups
        .into_iter()
        .map(|(status, (count, total_ms, timed))| DeliveryStats {
            status,
            count,
            avg_response_time_ms: (timed > 0).then(|| total_ms as f64 / timed as f64),
        })
        .collect()
}

/// Copy configuration fields, keeping the stored counters.
pub(crate) fn merge_config(stored: &mut Subscription, update: &Subscription) {
    stored.url = update.url.clone();
    stored.events = update.events.clone();
    stored.headers = update.headers.clone();
    stored.secret = update.secret.clone();
    stored.retry_policy = update.retry_policy;
    stored.timeout_ms = update.timeout_ms;
    stored.is_active = update.is_active;
    stored.description = update.description.clone();
    stored.updated_at = update.updated_at;
}

/// In-memory storage for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    deliveries: Mutex<HashMap<DeliveryId, Delivery>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let mut guard = self.subscriptions.write().await;
        let stored = guard
            .get_mut(&subscription.id)
            .ok_or(StorageError::SubscriptionNotFound(subscription.id))?;
        merge_config(stored, subscription);
        Ok(())
    }

    async fn delete_subscription(&self, id: &SubscriptionId) -> Result<bool, StorageError> {
        let mut subscriptions = self.subscriptions.write().await;
        let existed = subscriptions.remove(id).is_some();
        let mut deliveries = self.deliveries.lock().await;
        deliveries.retain(|_, d| &d.subscription_id != id);
        Ok(existed)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let mut all: Vec<Subscription> = self.subscriptions.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn find_active_subscriptions(&self, event_type: &EventType) -> Result<Vec<Subscription>, StorageError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.is_active && s.is_subscribed_to(event_type))
            .cloned()
            .collect())
    }

    async fn record_outcome(
        &self,
        id: &SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut guard = self.subscriptions.write().await;
        let Some(subscription) = guard.get_mut(id) else {
            return Ok(false);
        };
        subscription.total_deliveries += 1;
        if success {
            subscription.successful_deliveries += 1;
        } else {
            subscription.failed_deliveries += 1;
        }
        subscription.last_triggered = Some(at);
        Ok(true)
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StorageError> {
        self.deliveries.lock().await.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StorageError> {
        Ok(self.deliveries.lock().await.get(id).cloned())
    }

    async fn update_delivery(
        &self,
        delivery: &Delivery,
        lease: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let mut guard = self.deliveries.lock().await;
        match guard.get_mut(&delivery.id) {
            Some(stored) if stored.claimed_until == lease => {
                *stored = delivery.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_deliveries(
        &self,
        subscription_id: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        let guard = self.deliveries.lock().await;
        let mut found: Vec<Delivery> = guard
            .values()
            .filter(|d| &d.subscription_id == subscription_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>, StorageError> {
        let mut guard = self.deliveries.lock().await;

        let mut due: Vec<(DateTime<Utc>, DeliveryId)> = guard
            .values()
            .filter(|d| is_claimable(d, now))
            .filter_map(|d| d.next_retry_at.map(|at| (at, d.id)))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(delivery) = guard.get_mut(&id) {
                delivery.claimed_until = Some(lease_until);
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn delivery_stats(
        &self,
        subscription_id: Option<&SubscriptionId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryStats>, StorageError> {
        let guard = self.deliveries.lock().await;
        Ok(aggregate_stats(guard.values().filter(|d| {
            d.created_at >= since && subscription_id.map_or(true, |id| &d.subscription_id == id)
        })))
    }
}
