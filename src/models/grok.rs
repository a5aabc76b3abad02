use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::error::Result;
use crate::models::canonical::{CanonicalRequest, CanonicalResponse};
use crate::models::deepseek::IMAGE_LEAD_TEXT;
use crate::models::openai_compat::{self, ChatCompletionRequest};
use crate::models::provider::{build_http_client, ModelProvider};
use crate::models::registry::{ModelConfig, ProviderKind};

/// xAI Grok over the Chat Completions dialect, with live search as its native web search.
pub struct GrokProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

impl GrokProvider {
    pub fn new(config: ModelConfig, timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let base_url = config.base_url(ProviderKind::XAi);
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url,
            config,
        })
    }

    fn build_request(&self, request: &CanonicalRequest) -> Result<ChatCompletionRequest> {
        let instruction_role = if self.config.reasoning_model { "developer" } else { "system" };
        let mut messages = openai_compat::convert_messages(request, instruction_role)?;
        if self.config.vision {
            openai_compat::attach_images(&mut messages, &request.img_data, Some(IMAGE_LEAD_TEXT));
        }

        Ok(ChatCompletionRequest {
            model: self.config.wire_model_id.clone(),
            messages,
            tools: openai_compat::convert_tools(&request.available_functions, self.config.web_search),
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            search_parameters: self
                .config
                .web_search
                .then(|| serde_json::json!({ "mode": "auto" })),
        })
    }
}

#[async_trait]
impl ModelProvider for GrokProvider {
    fn provider_label(&self) -> &str {
        "Grok"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn send(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let body = self.build_request(request)?;
        let response =
            openai_compat::create_chat_completion("Grok", &self.client, &self.base_url, &self.api_key, &body).await?;
        openai_compat::parse_response(response)
    }
}
