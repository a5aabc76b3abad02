use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::{CanonicalRequest, CanonicalResponse, FunctionCall, ResponseStatus};

pub const DEFAULT_QUERY_TYPE: &str = "default";

/// One chat call as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatSubmission {
    #[serde(alias = "llm_class_name")]
    #[validate(length(min = 1, message = "Missing model_name"))]
    pub model_name: String,
    #[serde(default = "default_query_type")]
    pub query_type: String,
    #[serde(flatten)]
    pub request: CanonicalRequest,
}

fn default_query_type() -> String {
    DEFAULT_QUERY_TYPE.to_string()
}

impl ChatSubmission {
    pub fn new(model_name: impl Into<String>, query_type: impl Into<String>, request: CanonicalRequest) -> Self {
        Self {
            model_name: model_name.into(),
            query_type: query_type.into(),
            request,
        }
    }

    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|e| Error::validation(e.to_string()))?;
        if self.model_name.trim().is_empty() {
            return Err(Error::validation("Missing model_name"));
        }
        Ok(())
    }
}

/// Whether a query type is metered against the caller's credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Billing {
    Billable,
    Free,
}

/// Result of a settled chat call. Running out of credit is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Completed {
        response: CanonicalResponse,
        credit_remaining: Decimal,
        charged: Option<Decimal>,
    },
    InsufficientCredits {
        message: String,
        credit_remaining: Decimal,
    },
}

impl ChatOutcome {
    pub fn credit_remaining(&self) -> Decimal {
        match self {
            ChatOutcome::Completed { credit_remaining, .. } => *credit_remaining,
            ChatOutcome::InsufficientCredits { credit_remaining, .. } => *credit_remaining,
        }
    }

    pub fn charged(&self) -> Option<Decimal> {
        match self {
            ChatOutcome::Completed { charged, .. } => *charged,
            ChatOutcome::InsufficientCredits { .. } => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ChatOutcome::Completed { response, .. } => response.message.as_deref(),
            ChatOutcome::InsufficientCredits { message, .. } => Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    ProviderError,
    InsufficientCredits,
}

/// Wire shape of a chat call's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub message: Option<String>,
    pub function_call: Option<FunctionCall>,
    #[serde(with = "rust_decimal::serde::float")]
    pub credit_remaining: Decimal,
    pub status: ReplyStatus,
}

impl From<ChatOutcome> for ChatReply {
    fn from(outcome: ChatOutcome) -> Self {
        match outcome {
            ChatOutcome::Completed {
                response,
                credit_remaining,
                ..
            } => ChatReply {
                status: match response.status {
                    ResponseStatus::Ok => ReplyStatus::Ok,
                    ResponseStatus::ProviderError => ReplyStatus::ProviderError,
                },
                message: response.message,
                function_call: response.function_call,
                credit_remaining,
            },
            ChatOutcome::InsufficientCredits {
                message,
                credit_remaining,
            } => ChatReply {
                message: Some(message),
                function_call: None,
                credit_remaining,
                status: ReplyStatus::InsufficientCredits,
            },
        }
    }
}
