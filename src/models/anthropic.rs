use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::canonical::{
    normalize_arguments, offered_functions, CanonicalMessage, CanonicalRequest, CanonicalResponse,
    FunctionCall, Role,
};
use crate::models::openai_compat::call_id_or_default;
use crate::models::provider::{build_http_client, send_json, vision_images, ModelProvider};
use crate::models::registry::{ModelConfig, ProviderKind};

const API_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

impl AnthropicProvider {
    pub fn new(config: ModelConfig, timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let base_url = config.base_url(ProviderKind::Anthropic);
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url,
            config,
        })
    }

    /// Instruction and system turns both land in the top-level `system` field.
    fn convert_messages(&self, request: &CanonicalRequest) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut system_parts: Vec<String> = request.instruction().map(str::to_string).into_iter().collect();
        let mut messages = Vec::with_capacity(request.conversation_history.len() + 1);

        for message in &request.conversation_history {
            match message {
                CanonicalMessage::Text { role: Role::System, content } => {
                    if !content.is_empty() {
                        system_parts.push(content.clone());
                    }
                }
                CanonicalMessage::Text { role, content } => {
                    let role = if *role == Role::User { "user" } else { "assistant" };
                    messages.push(AnthropicMessage {
                        role: role.to_string(),
                        content: vec![ContentBlock::Text { text: content.clone() }],
                    });
                }
                CanonicalMessage::FunctionCall { name, arguments, call_id } => {
                    messages.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: vec![ContentBlock::ToolUse {
                            id: call_id_or_default(call_id, name),
                            name: name.clone(),
                            input: Value::Object(arguments.clone()),
                        }],
                    });
                }
                CanonicalMessage::FunctionCallOutput { name, call_id, output } => {
                    messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: vec![ContentBlock::ToolResult {
                            tool_use_id: call_id_or_default(call_id, name),
                            content: output.clone(),
                        }],
                    });
                }
            }
        }

        let images = vision_images("Claude", &self.config, &request.img_data);
        if !images.is_empty() {
            if messages.last().map(|m| m.role.as_str()) != Some("user") {
                messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: Vec::new(),
                });
            }
            if let Some(last) = messages.last_mut() {
                last.content.extend(images.iter().map(|image| ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64".to_string(),
                        media_type: image.mime_type().to_string(),
                        data: image.to_base64(),
                    },
                }));
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, messages)
    }

    fn convert_tools(&self, request: &CanonicalRequest) -> Option<Vec<AnthropicTool>> {
        let mut tools: Vec<AnthropicTool> = offered_functions(&request.available_functions, self.config.web_search)
            .map(|function| AnthropicTool::Custom {
                name: function.name.clone(),
                description: function.description.clone(),
                input_schema: function.parameters_schema(),
            })
            .collect();

        if self.config.web_search {
            tools.push(AnthropicTool::WebSearch {
                name: "web_search".to_string(),
                max_uses: self.config.web_search_max_uses,
            });
        }

        if tools.is_empty() {
            None
        } else {
            Some(tools)
        }
    }

    fn build_request(&self, request: &CanonicalRequest, thinking: bool) -> AnthropicRequest {
        let (system, messages) = self.convert_messages(request);
        AnthropicRequest {
            model: self.config.wire_model_id.clone(),
            max_tokens: self.config.max_tokens,
            system,
            messages,
            // Extended thinking rejects any temperature other than the default.
            temperature: (!thinking).then_some(self.config.temperature),
            tools: self.convert_tools(request),
            thinking: thinking.then(|| Thinking {
                kind: "enabled".to_string(),
                budget_tokens: self.config.thinking_budget_tokens,
            }),
        }
    }

    async fn make_request(&self, request: &AnthropicRequest) -> Result<AnthropicResponse> {
        debug!(
            "Making Anthropic API request to model: {} (thinking: {})",
            request.model,
            request.thinking.is_some()
        );

        let builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request);

        send_json("Anthropic", builder).await
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn provider_label(&self) -> &str {
        "Claude"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn send(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let response = if self.config.reasoning_model {
            match self.make_request(&self.build_request(request, true)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Anthropic request with extended thinking failed, retrying without: {}", e);
                    self.make_request(&self.build_request(request, false)).await?
                }
            }
        } else {
            self.make_request(&self.build_request(request, false)).await?
        };

        parse_response(response)
    }
}

/// Concatenate text blocks and take the first tool use. Thinking and server-side
/// search blocks are skipped.
fn parse_response(response: AnthropicResponse) -> Result<CanonicalResponse> {
    let mut text = String::new();
    let mut function_call = None;

    for block in response.content {
        match block {
            ResponseContentBlock::Text { text: chunk } => text.push_str(&chunk),
            ResponseContentBlock::ToolUse { id, name, input } if function_call.is_none() => {
                let arguments = normalize_arguments(input)
                    .map_err(|e| Error::model_provider(format!("Malformed tool input: {}", e)))?;
                function_call = Some(FunctionCall {
                    name,
                    arguments,
                    call_id: Some(id),
                });
            }
            _ => {}
        }
    }

    Ok(CanonicalResponse::from_parts(text.trim().to_string(), function_call))
}

// Anthropic API request/response structures
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicTool {
    #[serde(rename = "custom")]
    Custom {
        name: String,
        description: String,
        input_schema: Value,
    },
    #[serde(rename = "web_search_20250305")]
    WebSearch { name: String, max_uses: u32 },
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: String,
    budget_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ResponseContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::{
        FunctionArguments, FunctionDeclaration, ImageData, ParameterSpec, ResponseStatus, SEARCH_INTERNET_FUNCTION,
    };
    use rust_decimal::Decimal;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ModelConfig {
        ModelConfig::new("anthropic", "claude-3-5-haiku-20241022", Decimal::new(15, 1))
            .with_api_key("sk-ant-test")
            .with_api_base(server.uri())
    }

    async fn request_bodies(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_tool_use_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Let me check."},
                    {"type": "tool_use", "id": "toolu_01", "name": "get_weather", "input": {"location": "NYC"}}
                ],
                "stop_reason": "tool_use"
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(config(&server), Duration::from_secs(5)).unwrap();
        let mut args = FunctionArguments::new();
        args.insert("location".to_string(), json!("Boston"));
        let request = CanonicalRequest::new(vec![
            CanonicalMessage::system("Prefer Fahrenheit."),
            CanonicalMessage::user("What is the weather in Boston?"),
            CanonicalMessage::function_call("get_weather", args, "call_123"),
            CanonicalMessage::function_output("get_weather", "call_123", "72F and sunny"),
            CanonicalMessage::user("And in NYC?"),
        ])
        .with_instruction("You are a weather bot.")
        .with_functions(vec![FunctionDeclaration::new("get_weather", "Weather")
            .with_parameter("location", ParameterSpec::new("string", "City", true))]);

        let response = provider.respond(&request).await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.message.as_deref(), Some("Let me check."));
        let call = response.function_call.unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.call_id.as_deref(), Some("toolu_01"));
        assert_eq!(call.arguments.get("location"), Some(&json!("NYC")));

        let body = &request_bodies(&server).await[0];
        assert_eq!(body["system"], "You are a weather bot.\n\nPrefer Fahrenheit.");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(body["messages"][1]["content"][0]["id"], "call_123");
        assert_eq!(body["messages"][1]["content"][0]["input"]["location"], "Boston");
        assert_eq!(body["messages"][2]["role"], "user");
        assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(body["messages"][2]["content"][0]["tool_use_id"], "call_123");
        assert_eq!(body["tools"][0]["type"], "custom");
        assert_eq!(body["tools"][0]["input_schema"]["required"], json!(["location"]));
    }

    #[tokio::test]
    async fn test_web_search_tool_replaces_declared_search() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "server_tool_use", "id": "srv_1", "name": "web_search", "input": {"query": "news"}},
                    {"type": "web_search_tool_result", "tool_use_id": "srv_1", "content": []},
                    {"type": "text", "text": "Here is the news."}
                ]
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(config(&server).with_web_search(), Duration::from_secs(5)).unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("News?")])
            .with_functions(vec![FunctionDeclaration::new(SEARCH_INTERNET_FUNCTION, "Search")]);

        let response = provider.respond(&request).await;
        assert_eq!(response.message.as_deref(), Some("Here is the news."));

        let body = &request_bodies(&server).await[0];
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], WEB_SEARCH_TOOL_TYPE);
        assert_eq!(tools[0]["max_uses"], 5);
    }

    #[tokio::test]
    async fn test_thinking_failure_retries_without_thinking() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({"thinking": {"type": "enabled"}})))
            .respond_with(ResponseTemplate::new(400).set_body_string("thinking not supported"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "Answer without thinking."}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(config(&server).with_reasoning(), Duration::from_secs(5)).unwrap();
        let response = provider.respond(&CanonicalRequest::new(vec![CanonicalMessage::user("hi")])).await;
        assert_eq!(response.message.as_deref(), Some("Answer without thinking."));

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["thinking"]["budget_tokens"], 1024);
        assert!(bodies[0].get("temperature").is_none());
        assert!(bodies[1].get("thinking").is_none());
    }

    #[tokio::test]
    async fn test_error_uses_claude_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(config(&server), Duration::from_secs(5)).unwrap();
        let response = provider.respond(&CanonicalRequest::new(vec![CanonicalMessage::user("hi")])).await;
        assert!(response.is_provider_error());
        assert!(response.message.unwrap().starts_with("Claude Error: "));
    }

    #[test]
    fn test_images_go_on_last_user_turn() {
        let provider = AnthropicProvider::new(
            ModelConfig::new("anthropic", "claude", Decimal::ONE)
                .with_api_key("k")
                .with_vision(),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("What is this?")])
            .with_images(vec![ImageData::new(vec![b'G', b'I', b'F', b'8', b'9', b'a'])]);

        let body = serde_json::to_value(provider.build_request(&request, false)).unwrap();
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["type"], "base64");
        assert_eq!(content[1]["source"]["media_type"], "image/gif");
    }

    #[test]
    fn test_non_vision_model_drops_images() {
        let provider = AnthropicProvider::new(
            ModelConfig::new("anthropic", "claude", Decimal::ONE).with_api_key("k"),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::assistant("Send it over.")])
            .with_images(vec![ImageData::new(vec![b'G', b'I', b'F', b'8', b'9', b'a'])]);

        let body = serde_json::to_value(provider.build_request(&request, false)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 1);
    }
}
