use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{AttemptFailure, StorageError};
use crate::headers::{
    build_delivery_headers, get_header, headers_to_map, set_header, HEADER_WEBHOOK_SIGNATURE,
    HEADER_WEBHOOK_TIMESTAMP,
};
use crate::signing::{canonical_json, compute_signature};
use crate::storage::Storage;
use crate::telemetry::{metric_inc, metric_inc_subscription};
use crate::types::{
    format_timestamp, Attempt, Delivery, DeliveryStatus, EventEnvelope, EventType, ProbeResult,
    Subscription,
};

/// Response of a completed HTTP exchange.
#[derive(Debug, Clone)]
struct HttpResponse {
    status: reqwest::StatusCode,
    headers: BTreeMap<String, String>,
    body: String,
}

/// Performs single HTTP attempts for deliveries and records their outcome.
///
/// One call to [`Sender::attempt`] makes at most one HTTP request; retry
/// scheduling happens by setting `next_retry_at` for the sweeper to pick up.
pub struct Sender {
    storage: Arc<dyn Storage>,
    http_client: reqwest::Client,
    config: Arc<EngineConfig>,
}

impl Sender {
    /// Build a sender whose client never follows redirects.
    pub fn new(storage: Arc<dyn Storage>, config: Arc<EngineConfig>) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::with_client(storage, config, http_client))
    }

    /// Use a preconfigured HTTP client (proxies, custom TLS roots, ...).
    pub fn with_client(
        storage: Arc<dyn Storage>,
        config: Arc<EngineConfig>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            storage,
            http_client,
            config,
        }
    }

    /// Make one delivery attempt and persist its outcome.
    ///
    /// Failures of the subscriber are recorded on the delivery, not returned;
    /// only storage failures surface as errors.
    ///
    /// The outcome is written only while the stored delivery still carries the
    /// claim `delivery` was handed out with. If another sweep re-claimed it in
    /// the meantime, this attempt's outcome is dropped.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            delivery_id = %delivery.id,
            subscription_id = %delivery.subscription_id,
            event = %delivery.event,
        )
    )]
    pub async fn attempt(&self, mut delivery: Delivery) -> Result<Delivery, StorageError> {
        if delivery.status.is_terminal() {
            tracing::debug!(status = %delivery.status, "Delivery already terminal, skipping attempt");
            return Ok(delivery);
        }

        let Some(subscription) = self.storage.get_subscription(&delivery.subscription_id).await? else {
            return self.fail_orphaned(delivery).await;
        };

        let lease = delivery.claimed_until;
        let attempt_number = delivery.next_attempt_number();

        // Signatures are a pure function of payload and secret; recompute so a
        // rotated secret is honoured on retries.
        let signature = compute_signature(&subscription.secret, delivery.payload.as_bytes());
        set_header(&mut delivery.headers, HEADER_WEBHOOK_SIGNATURE, &signature);

        let started_at = Utc::now();
        // Retries carry the time they are sent so receivers can bound replay
        // windows; the envelope keeps the time of the event.
        if attempt_number > 1 && get_header(&subscription.headers, HEADER_WEBHOOK_TIMESTAMP).is_none() {
            set_header(
                &mut delivery.headers,
                HEADER_WEBHOOK_TIMESTAMP,
                &format_timestamp(started_at),
            );
        }
        let start = Instant::now();
        let result = self
            .send(
                &delivery.url,
                &delivery.headers,
                delivery.payload.clone(),
                subscription.timeout_ms,
            )
            .await;
        let response_time_ms = start.elapsed().as_millis() as u64;
        let now = Utc::now();

        delivery.claimed_until = None;
        delivery.updated_at = now;

        let failure = match result {
            Ok(response) if response.status.is_success() => {
                let response_status = response.status.as_u16();
                delivery.attempts.push(Attempt {
                    attempt_number,
                    timestamp: started_at,
                    response_time_ms,
                    response_status: Some(response_status),
                    error_message: None,
                });
                self.store_response(&mut delivery, response);
                delivery.status = DeliveryStatus::Success;
                delivery.delivered_at = Some(now);
                delivery.next_retry_at = None;
                delivery.error_message = None;

                tracing::info!(
                    attempt_number,
                    response_status,
                    response_time_ms,
                    "Webhook delivery succeeded"
                );
                metric_inc("webhook.delivery.success");
                metric_inc_subscription("webhook.delivery.success.subscription", &subscription.id);

                if self.persist(&delivery, lease).await? {
                    self.record_outcome(&subscription, true, now).await;
                }
                return Ok(delivery);
            }
            Ok(response) => {
                let failure = AttemptFailure::http(response.status);
                self.store_response(&mut delivery, response);
                failure
            }
            Err(failure) => {
                delivery.response_status = None;
                delivery.response_headers.clear();
                delivery.response_body = None;
                failure
            }
        };

        let error_message = failure.to_string();
        delivery.attempts.push(Attempt {
            attempt_number,
            timestamp: started_at,
            response_time_ms,
            response_status: delivery.response_status,
            error_message: Some(error_message.clone()),
        });
        delivery.error_message = Some(error_message.clone());

        if subscription.retry_policy.should_retry(attempt_number) {
            let next_retry_at = now + subscription.retry_policy.delay_after(attempt_number);
            delivery.status = DeliveryStatus::Retrying;
            delivery.next_retry_at = Some(next_retry_at);

            tracing::warn!(
                attempt_number,
                error = %error_message,
                %next_retry_at,
                "Webhook delivery failed, retry scheduled"
            );
            metric_inc("webhook.delivery.retry_scheduled");

            self.persist(&delivery, lease).await?;
        } else {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at = None;

            tracing::warn!(
                attempt_number,
                error = %error_message,
                max_retries = subscription.retry_policy.max_retries,
                "Webhook delivery failed permanently"
            );
            metric_inc("webhook.delivery.failed");
            metric_inc_subscription("webhook.delivery.failed.subscription", &subscription.id);

            if self.persist(&delivery, lease).await? {
                self.record_outcome(&subscription, false, now).await;
            }
        }

        Ok(delivery)
    }

    /// Send a synthetic, unrecorded event to check that a subscription is reachable.
    pub async fn probe(&self, subscription: &Subscription) -> ProbeResult {
        let now = Utc::now();
        let envelope = EventEnvelope::new(
            EventType::new(self.config.probe_event_type.clone()),
            now,
            serde_json::json!({
                "subscriptionId": subscription.id,
                "message": "This is a test delivery",
            }),
            None,
        );

        let payload = match canonical_json(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ProbeResult {
                    success: false,
                    message: format!("failed to serialize probe payload: {e}"),
                    response_time_ms: 0,
                }
            }
        };

        let signature = compute_signature(&subscription.secret, &payload);
        let headers = build_delivery_headers(
            &self.config.user_agent,
            envelope.event.as_str(),
            &envelope.timestamp,
            &signature,
            &subscription.headers,
        );

        let start = Instant::now();
        let result = self
            .send(
                &subscription.url,
                &headers,
                String::from_utf8_lossy(&payload).into_owned(),
                subscription.timeout_ms,
            )
            .await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (success, message) = match result {
            Ok(response) if response.status.is_success() => (
                true,
                format!(
                    "endpoint responded with HTTP {}",
                    response.status.as_u16()
                ),
            ),
            Ok(response) => (false, AttemptFailure::http(response.status).to_string()),
            Err(failure) => (false, failure.to_string()),
        };

        tracing::debug!(
            subscription_id = %subscription.id,
            success,
            response_time_ms,
            "Connectivity probe finished"
        );

        ProbeResult {
            success,
            message,
            response_time_ms,
        }
    }

    /// Issue the POST, cancelling it once `timeout_ms` elapses.
    async fn send(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: String,
        timeout_ms: u64,
    ) -> Result<HttpResponse, AttemptFailure> {
        let timeout = Duration::from_millis(timeout_ms);

        let mut request = self.http_client.post(url).timeout(timeout).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| AttemptFailure::from_reqwest(&e, timeout_ms))?;
            let status = response.status();
            let headers = headers_to_map(response.headers());
            let body = response.text().await.unwrap_or_default();
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AttemptFailure::Timeout { timeout_ms }),
        }
    }

    fn store_response(&self, delivery: &mut Delivery, response: HttpResponse) {
        delivery.response_status = Some(response.status.as_u16());
        delivery.response_headers = response.headers;
        delivery.response_body = Some(truncate_body(
            response.body,
            self.config.max_response_body_bytes,
        ));
    }

    /// The owning subscription is gone: there is no policy to consult.
    async fn fail_orphaned(&self, mut delivery: Delivery) -> Result<Delivery, StorageError> {
        let lease = delivery.claimed_until;
        let message = format!("subscription {} no longer exists", delivery.subscription_id);
        tracing::warn!(error = %message, "Failing delivery of a deleted subscription");

        delivery.status = DeliveryStatus::Failed;
        delivery.error_message = Some(message);
        delivery.next_retry_at = None;
        delivery.claimed_until = None;
        delivery.updated_at = Utc::now();

        metric_inc("webhook.delivery.orphaned");
        self.persist(&delivery, lease).await?;
        Ok(delivery)
    }

    /// Returns `false` when the outcome was discarded.
    async fn persist(&self, delivery: &Delivery, lease: Option<DateTime<Utc>>) -> Result<bool, StorageError> {
        match self.storage.update_delivery(delivery, lease).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!("Delivery was removed or re-claimed while in flight, outcome discarded");
                metric_inc("webhook.delivery.stale_outcome");
                Ok(false)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist delivery outcome");
                Err(e)
            }
        }
    }

    async fn record_outcome(&self, subscription: &Subscription, success: bool, at: DateTime<Utc>) {
        match self.storage.record_outcome(&subscription.id, success, at).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Subscription was removed while in flight, counters not updated");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to update subscription counters");
            }
        }
    }
}

/// Cut a response body down to at most `max` bytes on a char boundary.
fn truncate_body(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
