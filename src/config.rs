use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::headers::DEFAULT_USER_AGENT;
use crate::validation::MAX_TIMEOUT_MS;

/// Slack kept between the longest possible attempt and a sweeper claim.
pub const CLAIM_TTL_MARGIN: Duration = Duration::from_secs(60);

/// Engine-wide settings shared by the dispatcher, sender and sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Value of the `User-Agent` header on every delivery.
    pub user_agent: String,

    /// How often the background sweeper looks for due retries.
    pub sweep_interval: Duration,

    /// Maximum number of deliveries re-driven per sweep.
    pub sweep_batch_size: usize,

    /// How long a sweeper claim on a delivery stays valid.
    ///
    /// Never shorter than the longest attempt timeout plus
    /// [`CLAIM_TTL_MARGIN`], so a claim cannot lapse while its attempt runs.
    pub claim_ttl: Duration,

    /// Response bodies are truncated to this many bytes before being stored.
    pub max_response_body_bytes: usize,

    /// Event type used by connectivity probes.
    pub probe_event_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            sweep_interval: Duration::from_secs(5),
            sweep_batch_size: 100,
            claim_ttl: Duration::from_millis(MAX_TIMEOUT_MS) + CLAIM_TTL_MARGIN,
            max_response_body_bytes: 4_096,
            probe_event_type: "webhook.test".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_batch_size(mut self, batch_size: usize) -> Self {
        self.sweep_batch_size = batch_size;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_max_response_body_bytes(mut self, max: usize) -> Self {
        self.max_response_body_bytes = max;
        self
    }

    /// The claim TTL actually used: `claim_ttl`, raised to the floor if needed.
    pub fn effective_claim_ttl(&self) -> Duration {
        self.claim_ttl
            .max(Duration::from_millis(MAX_TIMEOUT_MS) + CLAIM_TTL_MARGIN)
    }

    pub(crate) fn claim_ttl_chrono(&self) -> chrono::Duration {
        let ttl = self.effective_claim_ttl();
        chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(6))
    }
}
