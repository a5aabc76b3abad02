#![allow(dead_code)]

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lexi_gateway::app::{AppState, GatewayConfig, TokenEntry};
use lexi_gateway::auth::StaticTokenAuthenticator;
use lexi_gateway::models::{ModelConfig, ModelRegistry, ProviderRouter};
use lexi_gateway::storage::MemoryLedgerStore;

pub const MODEL: &str = "llmtestgpt";
pub const USER_TOKEN: &str = "tok-alice";
pub const USER: &str = "alice";

pub struct TestGateway {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryLedgerStore>,
    pub server: MockServer,
}

/// Gateway wired to a mock OpenAI endpoint and an in-memory ledger.
pub async fn test_gateway(free_credits: Decimal, charge_on_provider_error: bool) -> TestGateway {
    let server = MockServer::start().await;

    let mut config = GatewayConfig::default();
    config.billing.free_credits = free_credits;
    config.billing.charge_on_provider_error = charge_on_provider_error;
    config.auth.tokens.push(TokenEntry {
        token: USER_TOKEN.to_string(),
        user_id: USER.to_string(),
    });
    config.models.insert(
        MODEL.to_string(),
        ModelConfig::new("openai", "gpt-4o", Decimal::new(2, 0))
            .with_api_key("sk-test")
            .with_api_base(server.uri())
            .with_vision(),
    );

    let registry = Arc::new(ModelRegistry::new(config.models.clone()));
    let router = Arc::new(ProviderRouter::new(registry, Duration::from_secs(5)));
    let store = Arc::new(MemoryLedgerStore::new());
    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config));
    let state = Arc::new(AppState::with_components(config, router, store.clone(), authenticator));

    TestGateway { state, store, server }
}

pub async fn mount_chat_reply(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-test",
            "choices": [{
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }]
        })))
        .mount(server)
        .await;
}

pub async fn mount_chat_failure(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "error": {"message": "upstream unavailable"}
        })))
        .mount(server)
        .await;
}

