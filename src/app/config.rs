use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::ModelConfig;

/// Defaults compiled into the binary so the gateway starts without any file on disk.
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Environment variable selecting `config/{name}.toml`.
pub const ENVIRONMENT_VAR: &str = "GATEWAY_ENV";

pub const LOCAL_ENVIRONMENT: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
    /// Allowed CORS origins outside the local environment.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted chat request body; base64 images make these large.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub free_credits: Decimal,
    pub billable_query_types: Vec<String>,
    pub insufficient_credits_message: String,
    pub charge_on_provider_error: bool,
    pub max_commit_attempts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let users: Vec<&str> = self.tokens.iter().map(|t| t.user_id.as_str()).collect();
        f.debug_struct("AuthConfig").field("users", &users).finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stdout only when unset.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_environment() -> String {
    LOCAL_ENVIRONMENT.to_string()
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_max_connections() -> u32 {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 120,
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            free_credits: Decimal::new(10, 0),
            billable_query_types: vec![
                "agent_listening_from".to_string(),
                "query_from_func_exec".to_string(),
            ],
            insufficient_credits_message:
                "You don't have enough **Lexi Credit**, Please **Recharge Credits** under **More Options**"
                    .to_string(),
            charge_on_provider_error: true,
            max_commit_attempts: 16,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            database_url: "sqlite://lexi-gateway.db".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            billing: BillingConfig::default(),
            ledger: LedgerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            models: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load layered configuration: embedded defaults, `config/default`,
    /// `config/{GATEWAY_ENV}`, the explicit file, then `GATEWAY_*` variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let environment = std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| LOCAL_ENVIRONMENT.to_string());

        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false));

        if let Some(path) = explicit {
            info!("Loading configuration from: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: GatewayConfig = builder
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("billing.billable_query_types")
                    .with_list_parse_key("server.cors_origins"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        info!(
            "Configuration loaded: environment={}, {} models",
            config.environment,
            config.models.len()
        );
        Ok(config)
    }

    /// Parse a single TOML document on top of the embedded defaults.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config: GatewayConfig = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, model) in &self.models {
            if model.wire_model_id.trim().is_empty() {
                return Err(Error::validation(format!("Model {} has empty model id", name)));
            }
            if model.cost < Decimal::ZERO {
                return Err(Error::validation(format!("Model {} has negative cost", name)));
            }
            model
                .provider_kind()
                .map_err(|e| Error::validation(format!("Model {}: {}", name, e)))?;
            if let Some(api_base) = &model.api_base {
                url::Url::parse(api_base)
                    .map_err(|e| Error::validation(format!("Model {} has invalid api_base: {}", name, e)))?;
            }
        }

        if self.billing.free_credits < Decimal::ZERO {
            return Err(Error::validation("Free credits must not be negative"));
        }
        if self.billing.max_commit_attempts == 0 {
            return Err(Error::validation("max_commit_attempts must be at least 1"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(Error::validation("request_timeout_secs must be at least 1"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(Error::validation("max_body_bytes must be at least 1"));
        }
        if self.auth.tokens.iter().any(|t| t.token.is_empty() || t.user_id.is_empty()) {
            return Err(Error::validation("Auth token entries need both token and user_id"));
        }

        Ok(())
    }

    pub fn is_local(&self) -> bool {
        self.environment == LOCAL_ENVIRONMENT
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}
