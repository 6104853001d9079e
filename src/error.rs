use crate::types::{DeliveryId, SubscriptionId};

/// Configuration errors, rejected when a subscription is created or updated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("at least one event type is required")]
    NoEvents,

    #[error("invalid event type: {0:?}")]
    InvalidEventType(String),

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("timeout must be between {min} and {max} ms, got {actual}")]
    InvalidTimeout { min: u64, max: u64, actual: u64 },
}

/// Errors surfaced by a [`Storage`](crate::Storage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by administrative registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while assembling an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Reasons why a single HTTP attempt failed.
///
/// The `Display` form is what gets recorded as the attempt's error message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptFailure {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("{0}")]
    Transport(String),
}

impl AttemptFailure {
    pub fn http(status: reqwest::StatusCode) -> Self {
        AttemptFailure::Http {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            AttemptFailure::Timeout { timeout_ms }
        } else if err.is_connect() {
            AttemptFailure::Transport(format!("connection failed: {err}"))
        } else {
            AttemptFailure::Transport(format!("request error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_failure_messages() {
        assert_eq!(
            AttemptFailure::http(reqwest::StatusCode::SERVICE_UNAVAILABLE).to_string(),
            "HTTP 503: Service Unavailable"
        );
        assert_eq!(
            AttemptFailure::Timeout { timeout_ms: 1_000 }.to_string(),
            "request timed out after 1000ms"
        );
    }
}
