use std::sync::Arc;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::registry::SubscriptionRegistry;
use crate::sender::Sender;
use crate::storage::{InMemoryStorage, Storage};
use crate::sweeper::{RetrySweeper, SweepReport, SweeperHandle};
use crate::types::{DeliveryId, EventType};

/// Wires storage, sender, dispatcher, sweeper and registry together.
pub struct WebhookEngine {
    config: Arc<EngineConfig>,
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    sender: Arc<Sender>,
    sweeper: RetrySweeper,
    registry: SubscriptionRegistry,
    sweeper_handle: Option<SweeperHandle>,
}

impl WebhookEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        Self::new_with_storage(config, storage)
    }

    pub fn new_with_storage(config: EngineConfig, storage: Arc<dyn Storage>) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let sender = Arc::new(Sender::new(storage.clone(), config.clone())?);
        Ok(Self::assemble(config, storage, sender))
    }

    /// Like [`WebhookEngine::new_with_storage`] but sending through `http_client`.
    pub fn new_with_client(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        http_client: reqwest::Client,
    ) -> Self {
        let config = Arc::new(config);
        let sender = Arc::new(Sender::with_client(storage.clone(), config.clone(), http_client));
        Self::assemble(config, storage, sender)
    }

    fn assemble(config: Arc<EngineConfig>, storage: Arc<dyn Storage>, sender: Arc<Sender>) -> Self {
        Self {
            dispatcher: Dispatcher::new(storage.clone(), sender.clone(), config.clone()),
            sweeper: RetrySweeper::new(storage.clone(), sender.clone(), config.clone()),
            registry: SubscriptionRegistry::new(storage.clone(), sender.clone()),
            sender,
            config,
            storage,
            sweeper_handle: None,
        }
    }

    /// Deliver an event to every active subscriber. Never fails.
    pub async fn trigger(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Vec<DeliveryId> {
        self.dispatcher.trigger(event_type, data, metadata).await
    }

    /// Run one sweep with the configured batch size.
    pub async fn sweep(&self) -> SweepReport {
        self.sweeper.sweep(self.config.sweep_batch_size).await
    }

    /// Start the background sweeper; a no-op if it is already running.
    pub fn start_sweeper(&mut self) {
        if self.sweeper_handle.as_ref().is_some_and(SweeperHandle::is_running) {
            return;
        }
        tracing::info!(interval = ?self.config.sweep_interval, "Starting retry sweeper");
        self.sweeper_handle = Some(self.sweeper.spawn(self.config.sweep_interval));
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper_handle.as_ref().is_some_and(SweeperHandle::is_running)
    }

    /// Stop the background sweeper, letting an in-progress sweep finish.
    pub async fn shutdown(&mut self) {
        if let Some(mut handle) = self.sweeper_handle.take() {
            handle.shutdown().await;
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn sweeper(&self) -> &RetrySweeper {
        &self.sweeper
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
