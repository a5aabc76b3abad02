use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::canonical::{
    normalize_arguments, offered_functions, CanonicalMessage, CanonicalRequest, CanonicalResponse,
    FunctionCall as CanonicalFunctionCall, Role,
};
use crate::models::provider::{build_http_client, send_json, vision_images, ModelProvider};
use crate::models::registry::{ModelConfig, ProviderKind};

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    config: ModelConfig,
}

impl GeminiProvider {
    pub fn new(config: ModelConfig, timeout: Duration) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let base_url = config.base_url(ProviderKind::Google);
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key,
            base_url,
            config,
        })
    }

    /// Returns the system instruction separately; empty text turns are dropped.
    fn convert_messages(&self, request: &CanonicalRequest) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut system_parts: Vec<GeminiPart> = request.instruction().map(GeminiPart::text).into_iter().collect();
        let mut gemini_contents: Vec<GeminiContent> = Vec::new();

        for message in &request.conversation_history {
            match message {
                CanonicalMessage::Text { content, .. } if content.is_empty() => {}
                CanonicalMessage::Text { role: Role::System, content } => {
                    system_parts.push(GeminiPart::text(content));
                }
                CanonicalMessage::Text { role, content } => {
                    let role = if *role == Role::User { "user" } else { "model" };
                    gemini_contents.push(GeminiContent::new(role, vec![GeminiPart::text(content)]));
                }
                CanonicalMessage::FunctionCall { name, arguments, .. } => {
                    gemini_contents.push(GeminiContent::new(
                        "model",
                        vec![GeminiPart {
                            function_call: Some(GeminiFunctionCall {
                                name: name.clone(),
                                args: Value::Object(arguments.clone()),
                            }),
                            ..Default::default()
                        }],
                    ));
                }
                CanonicalMessage::FunctionCallOutput { name, output, .. } => {
                    gemini_contents.push(GeminiContent::new(
                        "user",
                        vec![GeminiPart {
                            function_response: Some(FunctionResponse {
                                name: name.clone(),
                                response: serde_json::json!({ "content": output }),
                            }),
                            ..Default::default()
                        }],
                    ));
                }
            }
        }

        let images = vision_images("Gemini", &self.config, &request.img_data);
        if !images.is_empty() {
            if gemini_contents.last().and_then(|c| c.role.as_deref()) != Some("user") {
                gemini_contents.push(GeminiContent::new("user", Vec::new()));
            }
            if let Some(last) = gemini_contents.last_mut() {
                last.parts.extend(images.iter().map(|image| GeminiPart {
                    inline_data: Some(InlineData {
                        mime_type: image.mime_type().to_string(),
                        data: image.to_base64(),
                    }),
                    ..Default::default()
                }));
            }
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: system_parts,
            })
        };
        (system_instruction, gemini_contents)
    }

    fn convert_tools(&self, request: &CanonicalRequest) -> Option<Vec<GeminiTool>> {
        let declarations: Vec<FunctionDeclarationWire> =
            offered_functions(&request.available_functions, self.config.web_search)
                .map(|function| FunctionDeclarationWire {
                    name: function.name.clone(),
                    description: function.description.clone(),
                    parameters: function.parameters_schema(),
                })
                .collect();

        let mut tools = Vec::new();
        if !declarations.is_empty() {
            tools.push(GeminiTool {
                function_declarations: Some(declarations),
                google_search: None,
            });
        }
        if self.config.web_search {
            tools.push(GeminiTool {
                function_declarations: None,
                google_search: Some(serde_json::json!({})),
            });
        }

        if tools.is_empty() {
            None
        } else {
            Some(tools)
        }
    }

    fn build_request(&self, request: &CanonicalRequest) -> GeminiRequest {
        let (system_instruction, contents) = self.convert_messages(request);
        GeminiRequest {
            contents,
            system_instruction,
            tools: self.convert_tools(request),
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: category.to_string(),
                    threshold: "BLOCK_NONE".to_string(),
                })
                .collect(),
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_tokens,
            },
        }
    }

    async fn make_request(&self, request: &GeminiRequest) -> Result<GeminiResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.config.wire_model_id);
        debug!(
            "Making Gemini API request to model: {} ({} contents)",
            self.config.wire_model_id,
            request.contents.len()
        );

        let builder = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request);

        send_json("Gemini", builder).await
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn provider_label(&self) -> &str {
        "Gemini"
    }

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn send(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let response = self.make_request(&self.build_request(request)).await?;
        parse_response(response)
    }
}

fn parse_response(response: GeminiResponse) -> Result<CanonicalResponse> {
    let candidate = match response.candidates.into_iter().next() {
        Some(candidate) => candidate,
        None => {
            let reason = response
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .unwrap_or_else(|| "no candidates returned".to_string());
            return Err(Error::model_provider(format!("Model response blocked: {}", reason)));
        }
    };

    let mut text = String::new();
    let mut function_call = None;

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if function_call.is_some() {
            continue;
        }
        if let Some(call) = part.function_call {
            let arguments = normalize_arguments(call.args)
                .map_err(|e| Error::model_provider(format!("Malformed function arguments: {}", e)))?;
            function_call = Some(CanonicalFunctionCall {
                name: call.name,
                arguments,
                call_id: None,
            });
        }
    }

    let text = text.trim().to_string();
    if text.is_empty() && function_call.is_none() {
        if let Some(reason) = candidate.finish_reason.filter(|r| r != "STOP") {
            warn!("Gemini returned no content, finish reason: {}", reason);
            return Ok(CanonicalResponse::text(format!("Model stopped. Reason: {}.", reason)));
        }
    }

    Ok(CanonicalResponse::from_parts(text, function_call))
}

// Gemini API request/response structures
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    safety_settings: Vec<SafetySetting>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn new(role: &str, parts: Vec<GeminiPart>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl GeminiPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    #[serde(skip_serializing_if = "Option::is_none")]
    function_declarations: Option<Vec<FunctionDeclarationWire>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    google_search: Option<Value>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclarationWire {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: String,
    threshold: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
