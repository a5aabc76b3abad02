use std::sync::Arc;
use tracing::info;

use crate::app::config::{GatewayConfig, LedgerBackend};
use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::chat::{ChatService, ChatServiceConfig};
use crate::error::Result;
use crate::models::{ModelRegistry, ProviderRouter};
use crate::storage::{CreditLedger, LedgerSettings, LedgerStore, MemoryLedgerStore, SqliteLedgerStore};

/// Every long-lived component, built once from one configuration.
pub struct AppState {
    config: Arc<GatewayConfig>,
    router: Arc<ProviderRouter>,
    ledger: Arc<CreditLedger>,
    chat: Arc<ChatService>,
    authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        info!("Initializing gateway state");

        let store: Arc<dyn LedgerStore> = match config.ledger.backend {
            LedgerBackend::Sqlite => Arc::new(
                SqliteLedgerStore::connect(&config.ledger.database_url, config.ledger.max_connections).await?,
            ),
            LedgerBackend::Memory => {
                info!("Using in-memory ledger, balances will not persist");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let registry = Arc::new(ModelRegistry::new(config.models.clone()));
        let router = Arc::new(ProviderRouter::new(registry, config.request_timeout()));
        let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config));

        Ok(Self::with_components(config, router, store, authenticator))
    }

    /// Assemble state from prebuilt parts, e.g. a router with a test factory.
    pub fn with_components(
        config: GatewayConfig,
        router: Arc<ProviderRouter>,
        store: Arc<dyn LedgerStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let ledger = Arc::new(CreditLedger::new(
            store,
            LedgerSettings {
                free_credits: config.billing.free_credits,
                max_commit_attempts: config.billing.max_commit_attempts,
            },
        ));
        let chat = Arc::new(ChatService::new(
            router.clone(),
            ledger.clone(),
            ChatServiceConfig::from_billing(&config.billing, config.request_timeout()),
        ));

        info!(
            "Gateway state ready: {} models, environment {}",
            router.registry().len(),
            config.environment
        );

        Self {
            config: Arc::new(config),
            router,
            ledger,
            chat,
            authenticator,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.chat
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }
}
