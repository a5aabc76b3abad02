use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::models::canonical::{CanonicalRequest, CanonicalResponse};
use crate::models::openai_compat::{self, ChatCompletionRequest};
use crate::models::provider::{build_http_client, ModelProvider};
use crate::models::registry::{ModelConfig, ProviderKind};

pub(crate) const IMAGE_LEAD_TEXT: &str = "Please analyze the attached image(s):";

/// DeepSeek speaks the Chat Completions dialect and has no native web search.
pub struct DeepSeekProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

impl DeepSeekProvider {
    pub fn new(config: ModelConfig, timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let base_url = config.base_url(ProviderKind::DeepSeek);
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url,
            config,
        })
    }

    fn build_request(&self, request: &CanonicalRequest) -> Result<ChatCompletionRequest> {
        let mut messages = openai_compat::convert_messages(request, "system")?;
        if self.config.vision {
            openai_compat::attach_images(&mut messages, &request.img_data, Some(IMAGE_LEAD_TEXT));
        } else if !request.img_data.is_empty() {
            debug!("Dropping {} image(s) for non-vision DeepSeek model", request.img_data.len());
        }

        Ok(ChatCompletionRequest {
            model: self.config.wire_model_id.clone(),
            messages,
            tools: openai_compat::convert_tools(&request.available_functions, false),
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            search_parameters: None,
        })
    }
}

#[async_trait]
impl ModelProvider for DeepSeekProvider {
    fn provider_label(&self) -> &str {
        "DeepSeek"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn send(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let body = self.build_request(request)?;
        let response =
            openai_compat::create_chat_completion("DeepSeek", &self.client, &self.base_url, &self.api_key, &body)
                .await?;
        openai_compat::parse_response(response)
    }
}
