use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use crate::app::config::{AuthConfig, GatewayConfig};
use crate::error::{Error, Result};

/// Bearer credential accepted in the local environment only.
pub const DEV_TOKEN: &str = "test-token";
pub const DEV_USER: &str = "test-user";

/// Turns a bearer credential into a verified user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String>;
}

/// Verifies bearer tokens against a fixed table loaded from configuration.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(auth: &AuthConfig, allow_dev_token: bool) -> Self {
        let mut tokens: HashMap<String, String> = auth
            .tokens
            .iter()
            .map(|entry| (entry.token.clone(), entry.user_id.clone()))
            .collect();
        if allow_dev_token {
            tokens
                .entry(DEV_TOKEN.to_string())
                .or_insert_with(|| DEV_USER.to_string());
        }
        Self { tokens }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.auth, config.is_local())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify(&self, token: &str) -> Result<String> {
        match self.tokens.get(token) {
            Some(user_id) => {
                debug!("Authenticated request for {}", user_id);
                Ok(user_id.clone())
            }
            None => Err(Error::auth("Invalid token")),
        }
    }
}

/// Pull the credential out of an `Authorization: Bearer <token>` header value.
pub fn extract_bearer(header: Option<&str>) -> Result<&str> {
    let header = header.ok_or_else(|| Error::auth("Unauthorized"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::auth("Unauthorized"))?
        .trim();
    if token.is_empty() {
        return Err(Error::auth("Unauthorized"));
    }
    Ok(token)
}
