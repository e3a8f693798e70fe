//! Application state management.

use std::sync::Arc;

use crate::domain::{AlertSink, ChainRpcClient, ExchangeClient, LedgerStore, MetadataStore};

use super::queue::SettlementQueue;
use super::service::SettlementService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SettlementService>,
    pub store: Arc<dyn LedgerStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub chain_rpc: Arc<dyn ChainRpcClient>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub alerts: Arc<dyn AlertSink>,
    pub queue: SettlementQueue,
    /// Exchange callback secret for authentication (optional)
    pub callback_secret: Option<String>,
}

impl AppState {
    /// Create a new application state
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        metadata: Arc<dyn MetadataStore>,
        chain_rpc: Arc<dyn ChainRpcClient>,
        exchange: Arc<dyn ExchangeClient>,
        alerts: Arc<dyn AlertSink>,
        queue: SettlementQueue,
    ) -> Self {
        let service = Arc::new(SettlementService::new(
            Arc::clone(&store),
            Arc::clone(&metadata),
            Arc::clone(&chain_rpc),
            queue.clone(),
        ));
        Self {
            service,
            store,
            metadata,
            chain_rpc,
            exchange,
            alerts,
            queue,
            callback_secret: None,
        }
    }

    /// Add an exchange callback secret (builder pattern)
    #[must_use]
    pub fn with_callback_secret(mut self, secret: Option<String>) -> Self {
        self.callback_secret = secret;
        self
    }

    /// Set the chain pinged by the health check (builder pattern)
    /// This rebuilds the service with the configured chain
    #[must_use]
    pub fn with_health_chain(mut self, chain: impl Into<String>) -> Self {
        self.service = Arc::new(
            SettlementService::new(
                Arc::clone(&self.store),
                Arc::clone(&self.metadata),
                Arc::clone(&self.chain_rpc),
                self.queue.clone(),
            )
            .with_health_chain(chain),
        );
        self
    }
}
