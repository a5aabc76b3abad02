use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Provider families the gateway can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Google,
    DeepSeek,
    #[serde(rename = "xai")]
    XAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::XAi => "xai",
        }
    }

    /// Base URL used when the model entry carries no `api_base` override.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::DeepSeek => "https://api.deepseek.com",
            ProviderKind::XAi => "https://api.x.ai/v1",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "xai" | "grok" => Ok(ProviderKind::XAi),
            other => Err(Error::configuration(format!("Unknown provider: {}", other))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static configuration of one model entry. Immutable once loaded.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    #[serde(alias = "model")]
    pub wire_model_id: String,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub reasoning_model: bool,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_web_search_max_uses")]
    pub web_search_max_uses: u32,
    #[serde(default = "default_thinking_budget_tokens")]
    pub thinking_budget_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_web_search_max_uses() -> u32 {
    5
}

fn default_thinking_budget_tokens() -> u32 {
    1024
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, wire_model_id: impl Into<String>, cost: Decimal) -> Self {
        Self {
            provider: provider.into(),
            wire_model_id: wire_model_id.into(),
            cost,
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            reasoning_model: false,
            web_search: false,
            vision: false,
            priority: false,
            api_key: None,
            api_key_env: None,
            api_base: None,
            web_search_max_uses: default_web_search_max_uses(),
            thinking_budget_tokens: default_thinking_budget_tokens(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_reasoning(mut self) -> Self {
        self.reasoning_model = true;
        self
    }

    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }

    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn provider_kind(&self) -> Result<ProviderKind> {
        self.provider.parse()
    }

    /// Resolve the provider API key, preferring the inline value over the environment.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        if let Some(var) = &self.api_key_env {
            return std::env::var(var)
                .ok()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::configuration(format!("Environment variable {} is not set", var)));
        }
        Err(Error::configuration(format!(
            "No API key configured for model '{}'",
            self.wire_model_id
        )))
    }

    pub fn base_url(&self, kind: ProviderKind) -> String {
        self.api_base
            .as_deref()
            .unwrap_or_else(|| kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("wire_model_id", &self.wire_model_id)
            .field("cost", &self.cost)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("reasoning_model", &self.reasoning_model)
            .field("web_search", &self.web_search)
            .field("vision", &self.vision)
            .field("priority", &self.priority)
            .field("api_key", &self.api_key.as_deref().map(mask_api_key))
            .field("api_key_env", &self.api_key_env)
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Mask all but the first and last four characters of a secret.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Process-wide, read-only map from model name to its configuration.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    pub fn new(models: HashMap<String, ModelConfig>) -> Self {
        let models = models
            .into_iter()
            .map(|(name, config)| (name.to_lowercase(), config))
            .collect();
        Self { models }
    }

    /// Look up a model's configuration. Unknown names and providers are errors, never defaults.
    pub fn get_config(&self, model_name: &str) -> Result<&ModelConfig> {
        let config = self
            .models
            .get(&model_name.to_lowercase())
            .ok_or_else(|| Error::configuration(format!("Unknown model: {}", model_name)))?;
        config.provider_kind()?;
        Ok(config)
    }

    pub fn get_cost(&self, model_name: &str) -> Result<Decimal> {
        Ok(self.get_config(model_name)?.cost)
    }

    pub fn contains(&self, model_name: &str) -> bool {
        self.models.contains_key(&model_name.to_lowercase())
    }

    /// Model names in sorted order.
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> ModelRegistry {
        let mut models = HashMap::new();
        models.insert(
            "LlmOpenAiGpt".to_string(),
            ModelConfig::new("openai", "gpt-4o", Decimal::new(2, 0)),
        );
        models.insert(
            "llmclaudehaiku35".to_string(),
            ModelConfig::new("anthropic", "claude-3-5-haiku-20241022", Decimal::new(15, 1)),
        );
        models.insert(
            "llmmystery".to_string(),
            ModelConfig::new("mystery-ai", "m-1", Decimal::ONE),
        );
        ModelRegistry::new(models)
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = test_registry();
        let config = registry.get_config("llmopenaigpt").unwrap();
        assert_eq!(config.wire_model_id, "gpt-4o");
        assert_eq!(registry.get_cost("LLMOPENAIGPT").unwrap(), Decimal::new(2, 0));
    }

    #[test]
    fn test_unknown_model_is_configuration_error() {
        let registry = test_registry();
        assert!(matches!(registry.get_config("nope"), Err(Error::Configuration(_))));
        assert!(matches!(registry.get_cost("nope"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_unknown_provider_is_configuration_error() {
        let registry = test_registry();
        assert!(registry.contains("llmmystery"));
        assert!(matches!(registry.get_config("llmmystery"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAI);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!("xai".parse::<ProviderKind>().unwrap(), ProviderKind::XAi);
        assert!("cohere".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_api_key_resolution() {
        let config = ModelConfig::new("openai", "gpt-4o", Decimal::ONE);
        assert!(config.resolve_api_key().is_err());

        let config = config.with_api_key("sk-test-1234567890");
        assert_eq!(config.resolve_api_key().unwrap(), "sk-test-1234567890");

        let mut config = ModelConfig::new("openai", "gpt-4o", Decimal::ONE);
        config.api_key_env = Some("LEXI_GATEWAY_TEST_KEY_THAT_IS_NOT_SET".to_string());
        assert!(matches!(config.resolve_api_key(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_debug_masks_api_key() {
        let config = ModelConfig::new("openai", "gpt-4o", Decimal::ONE).with_api_key("sk-proj-1234567890abcdef");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("1234567890"));
        assert!(debug.contains("sk-p...cdef"));
    }

    #[test]
    fn test_base_url_override() {
        let config = ModelConfig::new("deepseek", "deepseek-chat", Decimal::ONE);
        assert_eq!(config.base_url(ProviderKind::DeepSeek), "https://api.deepseek.com");

        let config = config.with_api_base("http://127.0.0.1:9000/");
        assert_eq!(config.base_url(ProviderKind::DeepSeek), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_model_config_defaults_from_toml_like_source() {
        let config: ModelConfig = serde_json::from_value(serde_json::json!({
            "provider": "google",
            "model": "gemini-2.0-flash",
            "cost": 1
        }))
        .unwrap();
        assert_eq!(config.wire_model_id, "gemini-2.0-flash");
        assert_eq!(config.max_tokens, 4000);
        assert_eq!(config.temperature, 0.0);
        assert!(!config.vision);
        assert_eq!(config.cost, Decimal::ONE);
    }
}
