use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a subscription.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscription IDs with delivery IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a domain event, e.g. `ticket.created`.
///
/// Event types are an open set: subscriptions match by membership,
/// so new event types need no code changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EventType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Retry behaviour for failed deliveries of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts are retried while `attempt_number < max_retries`.
    pub max_retries: u32,

    /// Delay before the second attempt, in milliseconds.
    pub retry_delay_ms: u64,

    /// Factor applied to the delay for each further attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            backoff_multiplier,
        }
    }

    /// Whether a failed attempt with this number may be followed by another.
    pub fn should_retry(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_retries
    }

    /// Delay between the failed attempt `attempt_number` and the next one.
    ///
    /// `retry_delay * backoff_multiplier^(attempt_number - 1)`, saturating.
    pub fn delay_after(&self, attempt_number: u32) -> chrono::Duration {
        let exponent = attempt_number.saturating_sub(1) as i32;
        let millis = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let millis = if millis.is_finite() {
            millis.min(MAX_RETRY_DELAY_MS as f64) as i64
        } else {
            MAX_RETRY_DELAY_MS
        };
        chrono::Duration::milliseconds(millis)
    }
}

impl Default for RetryPolicy {
    /// Defaults:
    /// - max_retries: 3
    /// - retry_delay: 1 second
    /// - backoff_multiplier: 2
    fn default() -> Self {
        Self::new(3, 1_000, 2.0)
    }
}

/// Upper bound for a single computed retry delay (30 days).
const MAX_RETRY_DELAY_MS: i64 = 30 * 24 * 60 * 60 * 1_000;

/// Default bound on a single HTTP attempt.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A registered destination and its delivery policy.
///
/// This is the stored form and carries the signing secret. It never leaves
/// the crate's public read paths; callers see [`SubscriptionView`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,

    /// Destination endpoint.
    pub url: String,

    /// Event types this subscription receives.
    pub events: BTreeSet<EventType>,

    /// Extra static headers sent with every delivery.
    pub headers: BTreeMap<String, String>,

    /// HMAC signing key.
    pub secret: String,

    pub retry_policy: RetryPolicy,

    /// Bound on a single HTTP attempt, in milliseconds.
    pub timeout_ms: u64,

    /// Inactive subscriptions are skipped during fan-out.
    pub is_active: bool,

    pub description: Option<String>,

    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub last_triggered: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_subscribed_to(&self, event_type: &EventType) -> bool {
        self.events.contains(event_type)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Read model of a subscription, without the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: SubscriptionId,
    pub url: String,
    pub events: BTreeSet<EventType>,
    pub headers: BTreeMap<String, String>,
    pub retry_policy: RetryPolicy,
    pub timeout_ms: u64,
    pub is_active: bool,
    pub description: Option<String>,
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Subscription> for SubscriptionView {
    fn from(s: &Subscription) -> Self {
        Self {
            id: s.id,
            url: s.url.clone(),
            events: s.events.clone(),
            headers: s.headers.clone(),
            retry_policy: s.retry_policy,
            timeout_ms: s.timeout_ms,
            is_active: s.is_active,
            description: s.description.clone(),
            total_deliveries: s.total_deliveries,
            successful_deliveries: s.successful_deliveries,
            failed_deliveries: s.failed_deliveries,
            last_triggered: s.last_triggered,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

/// Response of a successful create: the only place the secret is returned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSubscription {
    pub subscription: SubscriptionView,
    pub secret: String,
}

/// Request to register a new subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub url: String,
    pub events: BTreeSet<EventType>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_active() -> bool {
    true
}

impl NewSubscription {
    /// Create a subscription request with default delivery settings.
    ///
    /// Defaults:
    /// - timeout: 30 seconds
    /// - retry policy: [`RetryPolicy::default`]
    /// - active
    pub fn new<I, E>(url: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EventType>,
    {
        Self {
            url: url.into(),
            events: events.into_iter().map(Into::into).collect(),
            headers: BTreeMap::new(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            is_active: true,
            description: None,
        }
    }

    /// Add a static header sent with every delivery.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the per-attempt timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update of a subscription. `None` leaves a field untouched.
///
/// `description` is doubly optional: `Some(None)` (JSON `null`) clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    pub url: Option<String>,
    pub events: Option<BTreeSet<EventType>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout_ms: Option<u64>,
    pub is_active: Option<bool>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
}

/// Distinguish an explicit `null` from an absent field.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl SubscriptionUpdate {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.events.is_none()
            && self.headers.is_none()
            && self.retry_policy.is_none()
            && self.timeout_ms.is_none()
            && self.is_active.is_none()
            && self.description.is_none()
    }
}

/// Envelope sent to subscribers as the request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: EventType,
    /// RFC 3339 timestamp of the trigger.
    pub timestamp: String,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
}

impl EventEnvelope {
    pub fn new(
        event: EventType,
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event,
            timestamp: format_timestamp(timestamp),
            data,
            metadata,
        }
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Retrying,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "success" => Some(DeliveryStatus::Success),
            "retrying" => Some(DeliveryStatus::Retrying),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP try within a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// 1-based, strictly increasing within a delivery.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    pub response_status: Option<u16>,
    pub error_message: Option<String>,
}

/// The notification of one triggered event to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event: EventType,

    /// Exact request body; immutable after creation.
    pub payload: String,

    pub url: String,
    pub http_method: String,

    /// Outgoing request headers, including the signature.
    pub headers: BTreeMap<String, String>,

    pub status: DeliveryStatus,
    pub attempts: Vec<Attempt>,

    pub response_status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,

    /// Set only while `status == Retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,

    /// Sweeper lease; a claimed delivery is skipped by other sweeps until it lapses.
    pub claimed_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(
        subscription: &Subscription,
        event: EventType,
        payload: String,
        headers: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id: subscription.id,
            event,
            payload,
            url: subscription.url.clone(),
            http_method: "POST".to_string(),
            headers,
            status: DeliveryStatus::Pending,
            attempts: Vec::new(),
            response_status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            next_retry_at: None,
            delivered_at: None,
            error_message: None,
            claimed_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number the next attempt will carry.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Parse the stored payload back into JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Per-status aggregate over recent deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub status: DeliveryStatus,
    pub count: u64,
    /// Mean response time of the latest attempt, over deliveries that have one.
    pub avg_response_time_ms: Option<f64>,
}

/// Outcome of a connectivity probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
    pub response_time_ms: u64,
}
