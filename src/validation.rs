//! Synchronous checks applied to subscriptions before they are stored.

use std::collections::{BTreeMap, BTreeSet};

use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::error::ValidationError;
use crate::types::{EventType, NewSubscription, RetryPolicy, SubscriptionUpdate};

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MIN_RETRY_DELAY_MS: u64 = 100;

const MAX_EVENT_TYPE_LEN: usize = 128;

pub fn validate_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidUrl(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::UnsupportedScheme(other.to_string())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::InvalidUrl(format!("{raw}: missing host")));
    }

    Ok(url)
}

/// Event types are matched by exact name, so patterns such as `ticket.*`
/// are rejected rather than stored as names nothing will ever trigger.
pub fn validate_events(events: &BTreeSet<EventType>) -> Result<(), ValidationError> {
    if events.is_empty() {
        return Err(ValidationError::NoEvents);
    }

    for event in events {
        let name = event.as_str();
        let well_formed = !name.is_empty()
            && name.len() <= MAX_EVENT_TYPE_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));
        if !well_formed {
            return Err(ValidationError::InvalidEventType(name.to_string()));
        }
    }

    Ok(())
}

pub fn validate_headers(headers: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| ValidationError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        HeaderValue::from_str(value).map_err(|e| ValidationError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), ValidationError> {
    if policy.retry_delay_ms < MIN_RETRY_DELAY_MS {
        return Err(ValidationError::InvalidRetryPolicy(format!(
            "retryDelay must be at least {MIN_RETRY_DELAY_MS} ms, got {}",
            policy.retry_delay_ms
        )));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(ValidationError::InvalidRetryPolicy(format!(
            "backoffMultiplier must be at least 1, got {}",
            policy.backoff_multiplier
        )));
    }
    Ok(())
}

pub fn validate_timeout(timeout_ms: u64) -> Result<(), ValidationError> {
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
        return Err(ValidationError::InvalidTimeout {
            min: MIN_TIMEOUT_MS,
            max: MAX_TIMEOUT_MS,
            actual: timeout_ms,
        });
    }
    Ok(())
}

pub fn validate_new_subscription(request: &NewSubscription) -> Result<(), ValidationError> {
    validate_url(&request.url)?;
    validate_events(&request.events)?;
    validate_headers(&request.headers)?;
    validate_retry_policy(&request.retry_policy)?;
    validate_timeout(request.timeout_ms)
}

pub fn validate_update(update: &SubscriptionUpdate) -> Result<(), ValidationError> {
    if let Some(url) = &update.url {
        validate_url(url)?;
    }
    if let Some(events) = &update.events {
        validate_events(events)?;
    }
    if let Some(headers) = &update.headers {
        validate_headers(headers)?;
    }
    if let Some(policy) = &update.retry_policy {
        validate_retry_policy(policy)?;
    }
    if let Some(timeout_ms) = update.timeout_ms {
        validate_timeout(timeout_ms)?;
    }
    Ok(())
}
