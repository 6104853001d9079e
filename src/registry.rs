use std::sync::Arc;

use chrono::Utc;

use crate::error::{RegistryError, StorageError};
use crate::sender::Sender;
use crate::signing::generate_secret;
use crate::storage::Storage;
use crate::types::{
    CreatedSubscription, Delivery, DeliveryStats, NewSubscription, ProbeResult, Subscription,
    SubscriptionId, SubscriptionUpdate, SubscriptionView,
};
use crate::validation::{validate_new_subscription, validate_update};

/// Administrative operations over subscriptions and their delivery history.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    storage: Arc<dyn Storage>,
    sender: Arc<Sender>,
}

impl SubscriptionRegistry {
    pub fn new(storage: Arc<dyn Storage>, sender: Arc<Sender>) -> Self {
        Self { storage, sender }
    }

    /// Validate and store a new subscription.
    ///
    /// The generated secret is returned here and nowhere else.
    pub async fn create(&self, request: NewSubscription) -> Result<CreatedSubscription, RegistryError> {
        validate_new_subscription(&request)?;

        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            url: request.url,
            events: request.events,
            headers: request.headers,
            secret: generate_secret(),
            retry_policy: request.retry_policy,
            timeout_ms: request.timeout_ms,
            is_active: request.is_active,
            description: request.description,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_triggered: None,
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_subscription(&subscription).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            url = %subscription.url,
            event_count = subscription.events.len(),
            "Subscription created"
        );

        Ok(CreatedSubscription {
            subscription: SubscriptionView::from(&subscription),
            secret: subscription.secret,
        })
    }

    pub async fn get(&self, id: &SubscriptionId) -> Result<Option<SubscriptionView>, RegistryError> {
        let subscription = self.storage.get_subscription(id).await?;
        Ok(subscription.as_ref().map(SubscriptionView::from))
    }

    pub async fn list(&self) -> Result<Vec<SubscriptionView>, RegistryError> {
        let subscriptions = self.storage.list_subscriptions().await?;
        Ok(subscriptions.iter().map(SubscriptionView::from).collect())
    }

    /// Apply a partial update. Counters and the secret are never touched.
    pub async fn update(
        &self,
        id: &SubscriptionId,
        update: SubscriptionUpdate,
    ) -> Result<SubscriptionView, RegistryError> {
        validate_update(&update)?;

        let mut subscription = self
            .storage
            .get_subscription(id)
            .await?
            .ok_or(StorageError::SubscriptionNotFound(*id))?;

        if update.is_empty() {
            return Ok(SubscriptionView::from(&subscription));
        }

        if let Some(url) = update.url {
            subscription.url = url;
        }
        if let Some(events) = update.events {
            subscription.events = events;
        }
        if let Some(headers) = update.headers {
            subscription.headers = headers;
        }
        if let Some(retry_policy) = update.retry_policy {
            subscription.retry_policy = retry_policy;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            subscription.timeout_ms = timeout_ms;
        }
        if let Some(is_active) = update.is_active {
            subscription.is_active = is_active;
        }
        if let Some(description) = update.description {
            subscription.description = description;
        }
        subscription.updated_at = Utc::now();

        self.storage.update_subscription(&subscription).await?;
        tracing::info!(subscription_id = %id, "Subscription updated");

        // Re-read so counters reflect the store, not our snapshot.
        let stored = self
            .storage
            .get_subscription(id)
            .await?
            .ok_or(StorageError::SubscriptionNotFound(*id))?;
        Ok(SubscriptionView::from(&stored))
    }

    /// Remove a subscription together with its delivery history.
    ///
    /// Returns `false` when the subscription did not exist.
    pub async fn delete(&self, id: &SubscriptionId) -> Result<bool, RegistryError> {
        let removed = self.storage.delete_subscription(id).await?;
        if removed {
            tracing::info!(subscription_id = %id, "Subscription deleted");
        } else {
            tracing::debug!(subscription_id = %id, "Delete of unknown subscription");
        }
        Ok(removed)
    }

    /// Send one unrecorded probe event to the subscription's endpoint.
    pub async fn test_subscription(&self, id: &SubscriptionId) -> Result<ProbeResult, RegistryError> {
        let subscription = self
            .storage
            .get_subscription(id)
            .await?
            .ok_or(StorageError::SubscriptionNotFound(*id))?;
        Ok(self.sender.probe(&subscription).await)
    }

    /// Delivery history of a subscription, newest first.
    pub async fn deliveries(&self, id: &SubscriptionId, limit: usize) -> Result<Vec<Delivery>, RegistryError> {
        Ok(self.storage.list_deliveries(id, limit).await?)
    }

    /// Per-status statistics over deliveries created within the trailing `window`.
    ///
    /// `None` aggregates over every subscription.
    pub async fn delivery_stats(
        &self,
        id: Option<&SubscriptionId>,
        window: chrono::Duration,
    ) -> Result<Vec<DeliveryStats>, RegistryError> {
        let since = Utc::now() - window;
        Ok(self.storage.delivery_stats(id, since).await?)
    }
}
