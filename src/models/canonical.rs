//! Provider-independent conversation shapes exchanged between the gateway and every adapter.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// Name of the caller-declared search function superseded by native web search.
pub const SEARCH_INTERNET_FUNCTION: &str = "search_internet";

/// Placeholder used when a provider legitimately returned neither text nor a function call.
pub const NO_RESPONSE_PLACEHOLDER: &str = "No response generated";

/// Function arguments, always a plain key/value map at the canonical boundary.
pub type FunctionArguments = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the conversation history. Ordering is conversation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum CanonicalMessage {
    Text {
        role: Role,
        content: String,
    },
    FunctionCall {
        name: String,
        arguments: FunctionArguments,
        call_id: Option<String>,
    },
    FunctionCallOutput {
        name: String,
        call_id: Option<String>,
        output: String,
    },
}

impl CanonicalMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::Text { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Text { role: Role::Assistant, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::Text { role: Role::System, content: content.into() }
    }

    pub fn function_call(name: impl Into<String>, arguments: FunctionArguments, call_id: impl Into<String>) -> Self {
        Self::FunctionCall {
            name: name.into(),
            arguments,
            call_id: Some(call_id.into()),
        }
    }

    pub fn function_output(name: impl Into<String>, call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            name: name.into(),
            call_id: Some(call_id.into()),
            output: output.into(),
        }
    }
}

/// Wire shape accepted from callers: either `{role, content}` or `{type, ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

impl TryFrom<RawMessage> for CanonicalMessage {
    type Error = Error;

    fn try_from(raw: RawMessage) -> Result<Self> {
        match raw.kind.as_deref() {
            Some("function_call") => Ok(Self::FunctionCall {
                name: raw
                    .name
                    .ok_or_else(|| Error::validation("function_call message is missing 'name'"))?,
                arguments: normalize_arguments(raw.arguments.unwrap_or(Value::Null))?,
                call_id: raw.call_id,
            }),
            Some("function_call_output") => Ok(Self::FunctionCallOutput {
                name: raw
                    .name
                    .ok_or_else(|| Error::validation("function_call_output message is missing 'name'"))?,
                call_id: raw.call_id,
                output: raw.output.unwrap_or_default(),
            }),
            None | Some("message") => {
                let role = raw
                    .role
                    .ok_or_else(|| Error::validation("message is missing a valid 'role'"))?;
                Ok(Self::Text {
                    role,
                    content: raw.content.unwrap_or_default(),
                })
            }
            Some(other) => Err(Error::validation(format!("Unsupported message type: {}", other))),
        }
    }
}

impl From<CanonicalMessage> for RawMessage {
    fn from(message: CanonicalMessage) -> Self {
        match message {
            CanonicalMessage::Text { role, content } => RawMessage {
                role: Some(role),
                content: Some(content),
                ..Default::default()
            },
            CanonicalMessage::FunctionCall { name, arguments, call_id } => RawMessage {
                kind: Some("function_call".to_string()),
                name: Some(name),
                arguments: Some(Value::Object(arguments)),
                call_id,
                ..Default::default()
            },
            CanonicalMessage::FunctionCallOutput { name, call_id, output } => RawMessage {
                kind: Some("function_call_output".to_string()),
                name: Some(name),
                call_id,
                output: Some(output),
                ..Default::default()
            },
        }
    }
}

/// Decode function arguments from whatever encoding a caller or provider used.
///
/// Accepts a structured object, a string holding a JSON object, or nothing at all.
pub fn normalize_arguments(value: Value) -> Result<FunctionArguments> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(FunctionArguments::new()),
        Value::String(encoded) if encoded.trim().is_empty() => Ok(FunctionArguments::new()),
        Value::String(encoded) => match serde_json::from_str::<Value>(&encoded)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::validation(format!(
                "Function arguments must be a JSON object, got {}",
                json_kind(&other)
            ))),
        },
        other => Err(Error::validation(format!(
            "Function arguments must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A caller-declared parameter of a callable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type", default = "default_parameter_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

fn default_parameter_type() -> String {
    "string".to_string()
}

impl ParameterSpec {
    pub fn new(param_type: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            param_type: param_type.into(),
            description: description.into(),
            required,
        }
    }
}

/// A callable capability the model may invoke instead of answering directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

impl FunctionDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn all_parameters_required(&self) -> bool {
        self.parameters.values().all(|spec| spec.required)
    }

    /// JSON-schema object describing the parameters, with type and description carried verbatim.
    pub fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": spec.param_type,
                        "description": spec.description,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required_parameters(),
        })
    }
}

/// Declarations that should be offered to the provider, dropping `search_internet`
/// when the model's native web search replaces it.
pub fn offered_functions(functions: &[FunctionDeclaration], native_search: bool) -> impl Iterator<Item = &FunctionDeclaration> {
    functions
        .iter()
        .filter(move |f| !(native_search && f.name == SEARCH_INTERNET_FUNCTION))
}

/// Decoded image bytes attached to a request. Opaque to the canonical layer.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData(Vec<u8>);

impl ImageData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode a base64 payload, tolerating a `data:<mime>;base64,` prefix.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let payload = match encoded.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => encoded,
        };
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::validation(format!("Invalid base64 image data: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }

    /// MIME type sniffed from magic bytes; PNG when unrecognised.
    pub fn mime_type(&self) -> &'static str {
        let bytes = self.0.as_slice();
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            "image/jpeg"
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            "image/gif"
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            "image/webp"
        } else {
            "image/png"
        }
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageData({} bytes, {})", self.0.len(), self.mime_type())
    }
}

impl Serialize for ImageData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ImageData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        ImageData::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A complete provider-independent request, owned by a single in-flight call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<CanonicalMessage>,
    #[serde(default)]
    pub available_functions: Vec<FunctionDeclaration>,
    #[serde(default)]
    pub img_data: Vec<ImageData>,
}

impl CanonicalRequest {
    pub fn new(conversation_history: Vec<CanonicalMessage>) -> Self {
        Self {
            conversation_history,
            ..Default::default()
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionDeclaration>) -> Self {
        self.available_functions = functions;
        self
    }

    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.img_data = images;
        self
    }

    /// Instruction text, treating an empty string as absent.
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref().filter(|i| !i.trim().is_empty())
    }
}

/// A function invocation extracted from a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: FunctionArguments,
    #[serde(default)]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    #[default]
    Ok,
    ProviderError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub message: Option<String>,
    pub function_call: Option<FunctionCall>,
    #[serde(default)]
    pub status: ResponseStatus,
}

impl CanonicalResponse {
    /// Assemble a successful response; never leaves both fields empty.
    pub fn from_parts(text: String, function_call: Option<FunctionCall>) -> Self {
        let message = if text.is_empty() { None } else { Some(text) };
        let message = match (&message, &function_call) {
            (None, None) => Some(NO_RESPONSE_PLACEHOLDER.to_string()),
            _ => message,
        };
        Self {
            message,
            function_call,
            status: ResponseStatus::Ok,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::from_parts(text.into(), None)
    }

    /// Conversational rendering of a provider fault: `"<Provider> Error: <detail>"`.
    pub fn provider_error(provider: &str, detail: impl fmt::Display) -> Self {
        Self {
            message: Some(format!("{} Error: {}", provider, detail)),
            function_call: None,
            status: ResponseStatus::ProviderError,
        }
    }

    pub fn is_provider_error(&self) -> bool {
        self.status == ResponseStatus::ProviderError
    }
}
