use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{header, request::Parts},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;
use crate::auth::extract_bearer;
use crate::chat::{ChatReply, ChatSubmission};
use crate::error::Error;
use crate::server::error::ApiError;

/// The user id resolved from the request's bearer credential.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let token = extract_bearer(header)?;
        let user_id = state.authenticator().verify(token).await.map_err(|e| {
            warn!("Rejected bearer credential: {}", e);
            e
        })?;
        Ok(Self(user_id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub environment: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        environment: state.config().environment.clone(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
}

pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.chat().balance(&user_id).await?;
    Ok(Json(BalanceResponse { balance }))
}

pub async fn get_llm_response(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<ChatSubmission>, JsonRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let Json(submission) = payload?;

    match state.chat().submit(&user_id, submission).await {
        Ok(outcome) => Ok(Json(ChatReply::from(outcome))),
        Err(e) if e.is_client_error() => Err(e.into()),
        Err(e) => {
            let credit_remaining = state.ledger().get_balance(&user_id).await.ok();
            Err(ApiError::from(e).with_credit(credit_remaining))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RechargeRequest {
    pub amount: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RechargeResponse {
    #[serde(with = "rust_decimal::serde::float")]
    pub new_balance: Decimal,
}

pub async fn recharge(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<RechargeRequest>, JsonRejection>,
) -> Result<Json<RechargeResponse>, ApiError> {
    let Json(request) = payload?;
    let amount = parse_amount(&request.amount)?;
    let new_balance = state.chat().recharge(&user_id, amount).await?;
    Ok(Json(RechargeResponse { new_balance }))
}

/// Accept an amount given either as a JSON number or a numeric string.
pub fn parse_amount(value: &Value) -> Result<Decimal, Error> {
    let amount = match value {
        Value::Number(number) => Decimal::from_str(&number.to_string())
            .or_else(|_| Decimal::from_scientific(&number.to_string()))
            .ok()
            .or_else(|| number.as_f64().and_then(Decimal::from_f64_retain)),
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
    .ok_or_else(|| Error::validation(format!("Invalid amount: {}", value)))?;

    if amount < Decimal::ZERO {
        return Err(Error::validation(format!("Amount must not be negative: {}", amount)));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(&json!(5)).unwrap(), Decimal::new(5, 0));
        assert_eq!(parse_amount(&json!(2.5)).unwrap(), Decimal::new(25, 1));
        assert_eq!(parse_amount(&json!("12.75")).unwrap(), Decimal::new(1275, 2));
        assert_eq!(parse_amount(&json!("0")).unwrap(), Decimal::ZERO);
        assert!(matches!(parse_amount(&json!(-1)), Err(Error::Validation(_))));
        assert!(parse_amount(&json!("ten")).is_err());
        assert!(parse_amount(&json!(null)).is_err());
        assert!(parse_amount(&json!([1])).is_err());
    }
}
