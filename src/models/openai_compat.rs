//! Chat Completions wire format shared by the OpenAI-compatible providers.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::canonical::{
    normalize_arguments, offered_functions, CanonicalMessage, CanonicalRequest, CanonicalResponse,
    FunctionCall, FunctionDeclaration, ImageData, Role,
};
use crate::models::provider::send_json;

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: Option<ChatContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(ChatContent::Text(content.into())),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub(crate) enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ChatFunctionDefinition,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

fn function_type() -> String {
    "function".to_string()
}

/// Id used when the caller's history omits one; identical for a call and its output.
pub(crate) fn call_id_or_default(call_id: &Option<String>, name: &str) -> String {
    call_id.clone().unwrap_or_else(|| format!("call_{}", name))
}

/// Translate the instruction and history. `system_role` is `system` or `developer`.
pub(crate) fn convert_messages(request: &CanonicalRequest, system_role: &str) -> Result<Vec<ChatMessage>> {
    let mut messages = Vec::with_capacity(request.conversation_history.len() + 1);

    if let Some(instruction) = request.instruction() {
        messages.push(ChatMessage::text(system_role, instruction));
    }

    for message in &request.conversation_history {
        match message {
            CanonicalMessage::Text { role, content } => {
                let role = match role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => system_role,
                };
                messages.push(ChatMessage::text(role, content.clone()));
            }
            CanonicalMessage::FunctionCall { name, arguments, call_id } => {
                messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: vec![ChatToolCall {
                        id: call_id_or_default(call_id, name),
                        kind: function_type(),
                        function: ChatFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(arguments)?,
                        },
                    }],
                    tool_call_id: None,
                });
            }
            CanonicalMessage::FunctionCallOutput { name, call_id, output } => {
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(output.clone())),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(call_id_or_default(call_id, name)),
                });
            }
        }
    }

    Ok(messages)
}

/// Put images on the latest user turn, or on a synthesized one when the history
/// does not end with the user speaking.
pub(crate) fn attach_images(messages: &mut Vec<ChatMessage>, images: &[ImageData], lead_text: Option<&str>) {
    if images.is_empty() {
        return;
    }

    let image_parts = images.iter().map(|image| ChatContentPart::ImageUrl {
        image_url: ImageUrl { url: image.data_url() },
    });

    if let Some(last) = messages.last_mut().filter(|m| m.role == "user") {
        let mut parts = match last.content.take() {
            Some(ChatContent::Text(text)) if !text.is_empty() => vec![ChatContentPart::Text { text }],
            Some(ChatContent::Parts(parts)) => parts,
            _ => Vec::new(),
        };
        parts.extend(image_parts);
        last.content = Some(ChatContent::Parts(parts));
        return;
    }

    let mut parts: Vec<ChatContentPart> = lead_text
        .map(|text| ChatContentPart::Text { text: text.to_string() })
        .into_iter()
        .collect();
    parts.extend(image_parts);
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: Some(ChatContent::Parts(parts)),
        tool_calls: Vec::new(),
        tool_call_id: None,
    });
}

pub(crate) fn convert_tools(functions: &[FunctionDeclaration], native_search: bool) -> Option<Vec<ChatTool>> {
    let tools: Vec<ChatTool> = offered_functions(functions, native_search)
        .map(|function| ChatTool {
            kind: "function",
            function: ChatFunctionDefinition {
                name: function.name.clone(),
                description: function.description.clone(),
                parameters: function.parameters_schema(),
            },
        })
        .collect();

    if tools.is_empty() {
        None
    } else {
        Some(tools)
    }
}

/// Extract text and at most one function call from the first choice.
pub(crate) fn parse_response(response: ChatCompletionResponse) -> Result<CanonicalResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::model_provider("No choices in response"))?;

    let function_call = match choice.message.tool_calls.and_then(|calls| calls.into_iter().next()) {
        Some(call) => Some(FunctionCall {
            arguments: normalize_arguments(Value::String(call.function.arguments))
                .map_err(|e| Error::model_provider(format!("Malformed function arguments: {}", e)))?,
            name: call.function.name,
            call_id: Some(call.id),
        }),
        None => None,
    };

    let text = choice.message.content.unwrap_or_default();
    Ok(CanonicalResponse::from_parts(text.trim().to_string(), function_call))
}

pub(crate) async fn create_chat_completion(
    provider: &str,
    client: &Client,
    base_url: &str,
    api_key: &str,
    request: &ChatCompletionRequest,
) -> Result<ChatCompletionResponse> {
    let url = format!("{}/chat/completions", base_url);
    send_json(provider, client.post(&url).bearer_auth(api_key).json(request)).await
}
