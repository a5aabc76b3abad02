use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::canonical::{
    normalize_arguments, offered_functions, CanonicalMessage, CanonicalRequest, CanonicalResponse,
    FunctionCall, Role,
};
use crate::models::openai_compat::{self, call_id_or_default, ChatCompletionRequest};
use crate::models::provider::{build_http_client, send_json, vision_images, ModelProvider};
use crate::models::registry::{ModelConfig, ProviderKind};

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

impl OpenAIProvider {
    pub fn new(config: ModelConfig, timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let base_url = config.base_url(ProviderKind::OpenAI);
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url,
            config,
        })
    }

    fn instruction_role(&self) -> &'static str {
        if self.config.reasoning_model {
            "developer"
        } else {
            "system"
        }
    }

    /// Reasoning, priority and web-search models go through the Responses API.
    fn uses_responses_api(&self) -> bool {
        self.config.reasoning_model || self.config.priority || self.config.web_search
    }

    fn build_chat_request(&self, request: &CanonicalRequest) -> Result<ChatCompletionRequest> {
        let mut messages = openai_compat::convert_messages(request, self.instruction_role())?;
        let images = vision_images("OpenAI", &self.config, &request.img_data);
        openai_compat::attach_images(&mut messages, images, None);

        Ok(ChatCompletionRequest {
            model: self.config.wire_model_id.clone(),
            messages,
            tools: openai_compat::convert_tools(&request.available_functions, false),
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            search_parameters: None,
        })
    }

    fn build_responses_request(&self, request: &CanonicalRequest) -> Result<ResponsesRequest> {
        let role = self.instruction_role();
        let mut input = Vec::with_capacity(request.conversation_history.len() + 2);

        if let Some(instruction) = request.instruction() {
            input.push(InputItem::message(role, instruction));
        }

        for message in &request.conversation_history {
            match message {
                CanonicalMessage::Text { role: message_role, content } => {
                    let message_role = match message_role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => role,
                    };
                    input.push(InputItem::message(message_role, content));
                }
                CanonicalMessage::FunctionCall { name, arguments, call_id } => {
                    input.push(InputItem::FunctionCall {
                        call_id: call_id_or_default(call_id, name),
                        name: name.clone(),
                        arguments: serde_json::to_string(arguments)?,
                    });
                }
                CanonicalMessage::FunctionCallOutput { name, call_id, output } => {
                    input.push(InputItem::FunctionCallOutput {
                        call_id: call_id_or_default(call_id, name),
                        output: output.clone(),
                    });
                }
            }
        }

        let images = vision_images("OpenAI", &self.config, &request.img_data);
        if !images.is_empty() {
            let images = images.iter().map(|image| InputPart::InputImage {
                image_url: image.data_url(),
            });
            let ends_with_user = matches!(input.last(), Some(InputItem::Message { role, .. }) if role == "user");
            if !ends_with_user {
                input.push(InputItem::Message {
                    role: "user".to_string(),
                    content: InputContent::Parts(Vec::new()),
                });
            }
            if let Some(InputItem::Message { content, .. }) = input.last_mut() {
                let mut parts = match std::mem::replace(content, InputContent::Parts(Vec::new())) {
                    InputContent::Text(text) if !text.is_empty() => vec![InputPart::InputText { text }],
                    InputContent::Parts(parts) => parts,
                    InputContent::Text(_) => Vec::new(),
                };
                parts.extend(images);
                *content = InputContent::Parts(parts);
            }
        }

        let mut tools: Vec<ResponsesTool> = offered_functions(&request.available_functions, self.config.web_search)
            .map(|function| {
                let strict = function.all_parameters_required();
                let mut parameters = function.parameters_schema();
                if strict {
                    parameters["additionalProperties"] = Value::Bool(false);
                }
                ResponsesTool::Function {
                    name: function.name.clone(),
                    description: function.description.clone(),
                    parameters,
                    strict,
                }
            })
            .collect();

        if self.config.web_search {
            tools.push(ResponsesTool::WebSearchPreview {
                user_location: serde_json::json!({"type": "approximate"}),
                search_context_size: "medium".to_string(),
            });
        }

        Ok(ResponsesRequest {
            model: self.config.wire_model_id.clone(),
            input,
            text: serde_json::json!({"format": {"type": "text"}}),
            reasoning: self
                .config
                .reasoning_model
                .then(|| serde_json::json!({"effort": "medium"})),
            tools: if tools.is_empty() { None } else { Some(tools) },
            service_tier: self.config.priority.then(|| "priority".to_string()),
            temperature: (!self.config.reasoning_model).then_some(self.config.temperature),
            max_output_tokens: Some(self.config.max_tokens),
            store: false,
        })
    }

    async fn make_chat_request(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let body = self.build_chat_request(request)?;
        debug!(
            "Sending chat completion to OpenAI: model={}, messages={}",
            body.model,
            body.messages.len()
        );
        let response =
            openai_compat::create_chat_completion("OpenAI", &self.client, &self.base_url, &self.api_key, &body)
                .await?;
        openai_compat::parse_response(response)
    }

    async fn make_responses_request(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let body = self.build_responses_request(request)?;
        debug!(
            "Sending Responses API request to OpenAI: model={}, items={}",
            body.model,
            body.input.len()
        );
        let url = format!("{}/responses", self.base_url);
        let response: ResponsesResponse =
            send_json("OpenAI", self.client.post(&url).bearer_auth(&self.api_key).json(&body)).await?;
        parse_responses_output(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    fn provider_label(&self) -> &str {
        "OpenAI"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn send(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        if self.uses_responses_api() {
            self.make_responses_request(request).await
        } else {
            self.make_chat_request(request).await
        }
    }
}

fn parse_responses_output(response: ResponsesResponse) -> Result<CanonicalResponse> {
    let mut text = String::new();
    let mut function_call = None;

    for item in response.output {
        match item {
            OutputItem::Message { content } => {
                for part in content {
                    match part {
                        OutputContent::OutputText { text: chunk } => text.push_str(&chunk),
                        OutputContent::Refusal { refusal } => text.push_str(&refusal),
                        OutputContent::Other => {}
                    }
                }
            }
            OutputItem::FunctionCall { name, arguments, call_id } if function_call.is_none() => {
                let arguments = normalize_arguments(Value::String(arguments))
                    .map_err(|e| Error::model_provider(format!("Malformed function arguments: {}", e)))?;
                function_call = Some(FunctionCall { name, arguments, call_id });
            }
            _ => {}
        }
    }

    Ok(CanonicalResponse::from_parts(text.trim().to_string(), function_call))
}

// Responses API request/response structures
#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputItem>,
    text: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    store: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message { role: String, content: InputContent },
    FunctionCall { call_id: String, name: String, arguments: String },
    FunctionCallOutput { call_id: String, output: String },
}

impl InputItem {
    fn message(role: &str, content: &str) -> Self {
        InputItem::Message {
            role: role.to_string(),
            content: InputContent::Text(content.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum InputContent {
    Text(String),
    Parts(Vec<InputPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputPart {
    InputText { text: String },
    InputImage { image_url: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesTool {
    Function {
        name: String,
        description: String,
        parameters: Value,
        strict: bool,
    },
    WebSearchPreview {
        user_location: Value,
        search_context_size: String,
    },
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        name: String,
        #[serde(default)]
        arguments: String,
        #[serde(default)]
        call_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText { text: String },
    Refusal { refusal: String },
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
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ModelConfig {
        ModelConfig::new("openai", "gpt-4o", Decimal::new(2, 0))
            .with_api_key("sk-test-openai")
            .with_api_base(server.uri())
    }

    fn weather_function() -> FunctionDeclaration {
        FunctionDeclaration::new("get_weather", "Get current weather for a location")
            .with_parameter("location", ParameterSpec::new("string", "City name", true))
    }

    async fn last_body(server: &MockServer) -> Value {
        let requests = server.received_requests().await.unwrap();
        serde_json::from_slice(&requests.last().unwrap().body).unwrap()
    }

    #[tokio::test]
    async fn test_chat_completion_tool_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test-openai"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_123",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"location\": \"NYC\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new(config(&server), Duration::from_secs(5)).unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("What is the weather in NYC?")])
            .with_instruction("You are a weather bot.")
            .with_functions(vec![weather_function()]);

        let response = provider.respond(&request).await;
        assert_eq!(response.status, ResponseStatus::Ok);
        let call = response.function_call.unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.call_id.as_deref(), Some("call_123"));
        assert_eq!(call.arguments.get("location"), Some(&json!("NYC")));

        let body = last_body(&server).await;
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "You are a weather bot.");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
    }

    #[tokio::test]
    async fn test_function_output_follow_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "It is 72F and sunny in NYC."}}]
            })))
            .mount(&server)
            .await;

        let mut args = FunctionArguments::new();
        args.insert("location".to_string(), json!("NYC"));
        let request = CanonicalRequest::new(vec![
            CanonicalMessage::user("What is the weather in NYC?"),
            CanonicalMessage::function_call("get_weather", args, "call_123"),
            CanonicalMessage::function_output("get_weather", "call_123", "72F and sunny"),
        ])
        .with_functions(vec![weather_function()]);

        let provider = OpenAIProvider::new(config(&server), Duration::from_secs(5)).unwrap();
        let response = provider.respond(&request).await;
        assert_eq!(response.message.as_deref(), Some("It is 72F and sunny in NYC."));
        assert!(response.function_call.is_none());

        let body = last_body(&server).await;
        assert_eq!(body["messages"][1]["tool_calls"][0]["id"], "call_123");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_123");
    }

    #[tokio::test]
    async fn test_api_error_becomes_prefixed_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"invalid api key\"}"))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new(config(&server), Duration::from_secs(5)).unwrap();
        let response = provider.respond(&CanonicalRequest::new(vec![CanonicalMessage::user("hi")])).await;

        assert!(response.is_provider_error());
        let message = response.message.unwrap();
        assert!(message.starts_with("OpenAI Error: "), "{}", message);
        assert!(message.contains("401"));
    }

    #[tokio::test]
    async fn test_reasoning_model_uses_responses_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "output": [
                    {"type": "reasoning", "summary": []},
                    {"type": "function_call", "name": "get_weather", "arguments": "{\"location\":\"NYC\"}", "call_id": "call_abc"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new(config(&server).with_reasoning(), Duration::from_secs(5)).unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("Weather in NYC?")])
            .with_instruction("Think first.")
            .with_functions(vec![weather_function()]);

        let response = provider.respond(&request).await;
        let call = response.function_call.unwrap();
        assert_eq!(call.call_id.as_deref(), Some("call_abc"));
        assert_eq!(call.arguments.get("location"), Some(&json!("NYC")));

        let body = last_body(&server).await;
        assert_eq!(body["input"][0]["role"], "developer");
        assert_eq!(body["reasoning"]["effort"], "medium");
        assert_eq!(body["store"], false);
        assert_eq!(body["tools"][0]["strict"], true);
        assert_eq!(body["tools"][0]["parameters"]["additionalProperties"], false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("service_tier").is_none());
    }

    #[tokio::test]
    async fn test_web_search_model_replaces_declared_search() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": [{
                    "type": "message",
                    "content": [{"type": "output_text", "text": "Top story today...", "annotations": []}]
                }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new(
            config(&server).with_web_search().with_priority(),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("News?")]).with_functions(vec![
            FunctionDeclaration::new(SEARCH_INTERNET_FUNCTION, "Search")
                .with_parameter("query", ParameterSpec::new("string", "Query", true)),
            FunctionDeclaration::new("get_weather", "Weather")
                .with_parameter("location", ParameterSpec::new("string", "City", true))
                .with_parameter("unit", ParameterSpec::new("string", "Unit", false)),
        ]);

        let response = provider.respond(&request).await;
        assert_eq!(response.message.as_deref(), Some("Top story today..."));

        let body = last_body(&server).await;
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "get_weather");
        assert_eq!(tools[0]["strict"], false);
        assert_eq!(tools[1]["type"], "web_search_preview");
        assert_eq!(body["service_tier"], "priority");
        assert_eq!(body["input"][0]["role"], "user");
    }

    #[test]
    fn test_responses_images_attach_to_user_turn() {
        let provider = OpenAIProvider::new(
            ModelConfig::new("openai", "o3", Decimal::ONE)
                .with_api_key("k")
                .with_reasoning()
                .with_vision(),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("Describe this")])
            .with_images(vec![ImageData::new(vec![0x89, b'P', b'N', b'G'])]);

        let body = serde_json::to_value(provider.build_responses_request(&request).unwrap()).unwrap();
        let content = &body["input"][0]["content"];
        assert_eq!(content[0]["type"], "input_text");
        assert_eq!(content[0]["text"], "Describe this");
        assert_eq!(content[1]["type"], "input_image");
        assert!(content[1]["image_url"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_non_vision_models_drop_images() {
        let request = CanonicalRequest::new(vec![CanonicalMessage::user("Describe this")])
            .with_images(vec![ImageData::new(vec![0x89, b'P', b'N', b'G'])]);

        let chat = OpenAIProvider::new(
            ModelConfig::new("openai", "gpt-4o-mini", Decimal::ONE).with_api_key("k"),
            Duration::from_secs(5),
        )
        .unwrap();
        let body = serde_json::to_value(chat.build_chat_request(&request).unwrap()).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"], "Describe this");

        let reasoning = OpenAIProvider::new(
            ModelConfig::new("openai", "o3", Decimal::ONE)
                .with_api_key("k")
                .with_reasoning(),
            Duration::from_secs(5),
        )
        .unwrap();
        let body = serde_json::to_value(reasoning.build_responses_request(&request).unwrap()).unwrap();
        assert_eq!(body["input"].as_array().unwrap().len(), 1);
        assert_eq!(body["input"][0]["content"], "Describe this");
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let result = OpenAIProvider::new(ModelConfig::new("openai", "gpt-4o", Decimal::ONE), Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
