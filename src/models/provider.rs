use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::models::canonical::{CanonicalRequest, CanonicalResponse, ImageData};
use crate::models::registry::ModelConfig;

/// Log target carrying the structured provider fault signal.
pub const PROVIDER_FAULT_TARGET: &str = "lexi_gateway::provider_fault";

const MAX_ERROR_BODY_CHARS: usize = 512;

/// One configured model behind a specific provider API.
///
/// Implementations translate a [`CanonicalRequest`] into the provider's wire format in
/// [`send`](ModelProvider::send). Callers normally go through [`respond`](ModelProvider::respond),
/// which never fails: provider faults are folded into a conversational error response.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Label used as the prefix of error messages, e.g. `OpenAI`.
    fn provider_label(&self) -> &str;

    fn model_config(&self) -> &ModelConfig;

    fn get_cost(&self) -> Decimal {
        self.model_config().cost
    }

    async fn send(&self, request: &CanonicalRequest) -> Result<CanonicalResponse>;

    async fn respond(&self, request: &CanonicalRequest) -> CanonicalResponse {
        let started = Instant::now();
        match self.send(request).await {
            Ok(response) => {
                debug!(
                    provider = self.provider_label(),
                    model = %self.model_config().wire_model_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    has_function_call = response.function_call.is_some(),
                    "Provider call completed"
                );
                response
            }
            Err(e) => {
                let detail = fault_detail(&e);
                warn!(
                    target: PROVIDER_FAULT_TARGET,
                    provider = self.provider_label(),
                    model = %self.model_config().wire_model_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %detail,
                    "Provider call failed"
                );
                CanonicalResponse::provider_error(self.provider_label(), detail)
            }
        }
    }
}

/// Per-call view of an adapter. Holds the instruction for this call only, so a shared
/// adapter never carries state from one request into another.
pub struct ProviderCall<'a> {
    provider: &'a dyn ModelProvider,
    instruction: Option<String>,
    deadline: Option<Duration>,
}

impl<'a> ProviderCall<'a> {
    pub fn new(provider: &'a dyn ModelProvider) -> Self {
        Self {
            provider,
            instruction: None,
            deadline: None,
        }
    }

    pub fn set_instruction(&mut self, instruction: impl Into<String>) {
        self.instruction = Some(instruction.into());
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn get_cost(&self) -> Decimal {
        self.provider.get_cost()
    }

    /// Invoke the provider. Exceeding the deadline yields a provider error response.
    pub async fn respond(self, mut request: CanonicalRequest) -> CanonicalResponse {
        if let Some(instruction) = self.instruction {
            request.instruction = Some(instruction);
        }

        let Some(deadline) = self.deadline else {
            return self.provider.respond(&request).await;
        };

        match tokio::time::timeout(deadline, self.provider.respond(&request)).await {
            Ok(response) => response,
            Err(_) => {
                let detail = format!("Request timed out after {}s", deadline.as_secs_f32());
                warn!(
                    target: PROVIDER_FAULT_TARGET,
                    provider = self.provider.provider_label(),
                    model = %self.provider.model_config().wire_model_id,
                    error = %detail,
                    "Provider call timed out"
                );
                CanonicalResponse::provider_error(self.provider.provider_label(), detail)
            }
        }
    }
}

/// The part of an error worth showing after the `"<Provider> Error:"` prefix.
fn fault_detail(err: &Error) -> String {
    match err {
        Error::ModelProvider(msg) | Error::Validation(msg) | Error::Configuration(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Images the model may receive: all of them for vision models, none otherwise.
pub(crate) fn vision_images<'a>(provider: &str, config: &ModelConfig, images: &'a [ImageData]) -> &'a [ImageData] {
    if config.vision {
        return images;
    }
    if !images.is_empty() {
        debug!("Dropping {} image(s) for non-vision {} model {}", images.len(), provider, config.wire_model_id);
    }
    &[]
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))
}

/// Send a prepared request and decode a JSON body, mapping transport and API failures
/// into provider errors.
pub(crate) async fn send_json<T: DeserializeOwned>(provider: &str, request: RequestBuilder) -> Result<T> {
    let start_time = Instant::now();

    let response = request
        .send()
        .await
        .map_err(|e| Error::model_provider(format!("HTTP request failed: {}", e.without_url())))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::model_provider(format!("Failed to read response body: {}", e.without_url())))?;

    debug!("{} request completed in {:?} with status {}", provider, start_time.elapsed(), status);

    if !status.is_success() {
        error!("{} API error: {} - {}", provider, status, truncate(&body));
        return Err(Error::model_provider(format!("API error {}: {}", status, truncate(&body))));
    }

    serde_json::from_str(&body).map_err(|e| Error::model_provider(format!("Failed to parse response: {}", e)))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
