use std::sync::Arc;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::headers::build_delivery_headers;
use crate::sender::Sender;
use crate::signing::{canonical_json, compute_signature};
use crate::storage::Storage;
use crate::telemetry::metric_inc;
use crate::types::{Delivery, DeliveryId, EventEnvelope, EventType};

/// Fans a triggered event out to every matching subscription.
///
/// Triggering is a side effect of the caller's own business operation, so
/// nothing here ever returns an error to the caller: registry and ledger
/// failures are logged and the affected deliveries are skipped.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    sender: Arc<Sender>,
    config: Arc<EngineConfig>,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn Storage>, sender: Arc<Sender>, config: Arc<EngineConfig>) -> Self {
        Self {
            storage,
            sender,
            config,
        }
    }

    /// Create one delivery per active matching subscription and make the
    /// first attempt of each.
    ///
    /// Returns the ids of the created deliveries once their first attempts
    /// have finished; an event without subscribers yields an empty list. If
    /// the returned future is dropped early, the attempts still run to
    /// completion in the background.
    pub async fn trigger(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Vec<DeliveryId> {
        let event_type = event_type.into();

        let subscriptions = match self.storage.find_active_subscriptions(&event_type).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::error!(event = %event_type, error = %e, "Failed to query matching subscriptions");
                metric_inc("webhook.dispatch.lookup_failed");
                return Vec::new();
            }
        };

        if subscriptions.is_empty() {
            tracing::debug!(event = %event_type, "No active subscriptions match event type");
            return Vec::new();
        }

        let now = Utc::now();
        let envelope = EventEnvelope::new(event_type.clone(), now, data, metadata);

        // Serialized once: every delivery of this trigger carries identical bytes.
        let payload = match canonical_json(&envelope).map(String::from_utf8) {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                tracing::error!(event = %event_type, error = %e, "Serialized payload is not UTF-8");
                return Vec::new();
            }
            Err(e) => {
                tracing::error!(event = %event_type, error = %e, "Failed to serialize event payload");
                return Vec::new();
            }
        };

        tracing::info!(
            event = %event_type,
            subscription_count = subscriptions.len(),
            "Delivering event to matching subscriptions"
        );

        // Each delivery is created and attempted on its own task. Dropping a
        // JoinHandle detaches rather than aborts, so cancelling this call
        // never strands a delivery half way.
        let mut tasks = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let signature = compute_signature(&subscription.secret, payload.as_bytes());
            let headers = build_delivery_headers(
                &self.config.user_agent,
                event_type.as_str(),
                &envelope.timestamp,
                &signature,
                &subscription.headers,
            );
            let delivery = Delivery::new(subscription, event_type.clone(), payload.clone(), headers, now);

            let storage = self.storage.clone();
            let sender = self.sender.clone();
            tasks.push(tokio::spawn(async move {
                let delivery_id = delivery.id;
                if let Err(e) = storage.insert_delivery(&delivery).await {
                    tracing::error!(
                        event = %delivery.event,
                        subscription_id = %delivery.subscription_id,
                        error = %e,
                        "Failed to create delivery record"
                    );
                    metric_inc("webhook.dispatch.create_failed");
                    return None;
                }
                metric_inc("webhook.dispatch.enqueued");

                if let Err(e) = sender.attempt(delivery).await {
                    tracing::error!(%delivery_id, error = %e, "First delivery attempt could not be recorded");
                }
                Some(delivery_id)
            }));
        }

        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(Some(delivery_id)) => created.push(delivery_id),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Delivery task aborted"),
            }
        }

        created
    }

    /// Fire-and-forget variant of [`Dispatcher::trigger`] that never waits on the network.
    pub fn trigger_detached(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> tokio::task::JoinHandle<Vec<DeliveryId>> {
        let dispatcher = self.clone();
        let event_type = event_type.into();
        tokio::spawn(async move { dispatcher.trigger(event_type, data, metadata).await })
    }
}
