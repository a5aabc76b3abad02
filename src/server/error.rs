use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::error;

use crate::error::Error;

/// An [`Error`] rendered as `{error}` with a status code, plus the caller's
/// balance when it could still be read.
#[derive(Debug)]
pub struct ApiError {
    pub error: Error,
    pub credit_remaining: Option<Decimal>,
}

impl ApiError {
    pub fn with_credit(mut self, credit_remaining: Option<Decimal>) -> Self {
        self.credit_remaining = credit_remaining;
        self
    }

    pub fn status(&self) -> StatusCode {
        match &self.error {
            Error::Validation(_) | Error::Configuration(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            credit_remaining: None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Error::validation(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.error {
            Error::Auth(msg) | Error::Validation(msg) | Error::Configuration(msg) => msg.clone(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.error);
        }

        let mut body = json!({ "error": message });
        if let Some(credit) = self.credit_remaining.and_then(|c| c.to_f64()) {
            body["credit_remaining"] = json!(credit);
        }
        (status, Json(body)).into_response()
    }
}
