//! An outbound webhook delivery engine.
//!
//! Domain events are fanned out to every active subscription whose event set
//! contains the event type. Each (subscription, event) pair becomes a
//! [`Delivery`] in the ledger, signed with HMAC-SHA256 over the exact body
//! bytes and retried with exponential backoff until it succeeds or the
//! subscription's retry policy is exhausted.
//!
//! ## Guarantees
//! - At-least-once delivery per subscription, bounded by the retry policy
//! - Every attempt is recorded on the delivery
//! - Triggering never fails the caller
//! - Retries survive restarts with a persistent [`Storage`] backend
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across deliveries
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use webhook_engine::{EngineConfig, NewSubscription, WebhookEngine};
//!
//! let mut engine = WebhookEngine::new(EngineConfig::default())?;
//! let created = engine
//!     .registry()
//!     .create(NewSubscription::new("https://example.com/hooks", ["ticket.created"]))
//!     .await?;
//! println!("secret: {}", created.secret);
//!
//! engine.start_sweeper();
//! engine
//!     .trigger("ticket.created", serde_json::json!({ "id": 42 }), None)
//!     .await;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod engine;
mod error;
mod headers;
mod registry;
mod sender;
mod signing;
mod storage;
mod sweeper;
mod telemetry;
mod types;
mod validation;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::{EngineConfig, CLAIM_TTL_MARGIN};
pub use dispatcher::Dispatcher;
pub use engine::WebhookEngine;
pub use error::{AttemptFailure, EngineError, RegistryError, StorageError, ValidationError};
pub use headers::{
    build_delivery_headers, get_header, CONTENT_TYPE_JSON, DEFAULT_USER_AGENT, HEADER_CONTENT_TYPE,
    HEADER_USER_AGENT, HEADER_WEBHOOK_EVENT, HEADER_WEBHOOK_SIGNATURE, HEADER_WEBHOOK_TIMESTAMP,
};
pub use registry::SubscriptionRegistry;
pub use sender::Sender;
pub use signing::{
    canonical_json,
    compute_signature,
    generate_secret,
    is_timestamp_fresh,
    parse_signature_headers,
    sign,
    verify_signature,
    verify_webhook_request,
    ParsedSignature,
    VerificationError,
    SECRET_PREFIX,
};
pub use storage::{InMemoryStorage, Storage};
pub use sweeper::{RetrySweeper, SweepReport, SweeperHandle};
pub use types::{
    format_timestamp, Attempt, CreatedSubscription, Delivery, DeliveryId, DeliveryStats,
    DeliveryStatus, EventEnvelope, EventType, NewSubscription, ProbeResult, RetryPolicy,
    Subscription, SubscriptionId, SubscriptionUpdate, SubscriptionView, DEFAULT_TIMEOUT_MS,
};
pub use validation::{MAX_TIMEOUT_MS, MIN_RETRY_DELAY_MS, MIN_TIMEOUT_MS};

#[cfg(feature = "redis")]
pub use storage_redis::RedisStorage;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
