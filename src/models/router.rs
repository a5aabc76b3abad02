use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::anthropic::AnthropicProvider;
use crate::models::deepseek::DeepSeekProvider;
use crate::models::gemini::GeminiProvider;
use crate::models::grok::GrokProvider;
use crate::models::openai::OpenAIProvider;
use crate::models::provider::ModelProvider;
use crate::models::registry::{ModelConfig, ModelRegistry, ProviderKind};

/// Builds the adapter for one registry entry.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, model_name: &str, config: &ModelConfig) -> Result<Arc<dyn ModelProvider>>;
}

/// Builds HTTP adapters selected by the entry's provider family.
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    request_timeout: Duration,
}

impl HttpProviderFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, _model_name: &str, config: &ModelConfig) -> Result<Arc<dyn ModelProvider>> {
        let config = config.clone();
        let timeout = self.request_timeout;
        let provider: Arc<dyn ModelProvider> = match config.provider_kind()? {
            ProviderKind::OpenAI => Arc::new(OpenAIProvider::new(config, timeout)?),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config, timeout)?),
            ProviderKind::Google => Arc::new(GeminiProvider::new(config, timeout)?),
            ProviderKind::DeepSeek => Arc::new(DeepSeekProvider::new(config, timeout)?),
            ProviderKind::XAi => Arc::new(GrokProvider::new(config, timeout)?),
        };
        Ok(provider)
    }
}

/// Resolves model names to adapters, constructing each adapter at most once.
pub struct ProviderRouter {
    registry: Arc<ModelRegistry>,
    factory: Arc<dyn ProviderFactory>,
    adapters: RwLock<HashMap<String, Arc<dyn ModelProvider>>>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ModelRegistry>, request_timeout: Duration) -> Self {
        Self::with_factory(registry, Arc::new(HttpProviderFactory::new(request_timeout)))
    }

    pub fn with_factory(registry: Arc<ModelRegistry>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            registry,
            factory,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Cached adapter for `model_name`. Unknown models and unknown providers fail
    /// without touching the cache.
    pub fn get_adapter(&self, model_name: &str) -> Result<Arc<dyn ModelProvider>> {
        let key = model_name.to_lowercase();
        if let Some(adapter) = self.adapters.read().get(&key) {
            debug!("Reusing cached adapter for model: {}", key);
            return Ok(Arc::clone(adapter));
        }

        let config = self.registry.get_config(&key)?;

        let mut adapters = self.adapters.write();
        if let Some(adapter) = adapters.get(&key) {
            return Ok(Arc::clone(adapter));
        }
        let adapter = self.factory.build(&key, config)?;
        info!(
            "Constructed {} adapter for model {} ({})",
            adapter.provider_label(),
            key,
            config.wire_model_id
        );
        adapters.insert(key, Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Configured cost of one call, without constructing an adapter.
    pub fn get_cost(&self, model_name: &str) -> Result<Decimal> {
        self.registry.get_cost(model_name)
    }

    pub fn cached_adapters(&self) -> usize {
        self.adapters.read().len()
    }
}
