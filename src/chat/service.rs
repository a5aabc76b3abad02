use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::app::config::BillingConfig;
use crate::chat::types::{Billing, ChatOutcome, ChatSubmission};
use crate::error::Result;
use crate::models::{ProviderCall, ProviderRouter};
use crate::storage::{CreditLedger, UsageMetadata};

/// Settings that govern how chat calls are metered.
#[derive(Debug, Clone)]
pub struct ChatServiceConfig {
    pub billable_query_types: HashSet<String>,
    pub insufficient_credits_message: String,
    pub charge_on_provider_error: bool,
    pub request_timeout: Duration,
}

impl ChatServiceConfig {
    pub fn from_billing(billing: &BillingConfig, request_timeout: Duration) -> Self {
        Self {
            billable_query_types: billing.billable_query_types.iter().cloned().collect(),
            insufficient_credits_message: billing.insufficient_credits_message.clone(),
            charge_on_provider_error: billing.charge_on_provider_error,
            request_timeout,
        }
    }
}

impl Default for ChatServiceConfig {
    fn default() -> Self {
        Self::from_billing(&BillingConfig::default(), Duration::from_secs(120))
    }
}

/// Runs one chat call from classification to settlement.
pub struct ChatService {
    router: Arc<ProviderRouter>,
    ledger: Arc<CreditLedger>,
    config: ChatServiceConfig,
}

impl ChatService {
    pub fn new(router: Arc<ProviderRouter>, ledger: Arc<CreditLedger>, config: ChatServiceConfig) -> Self {
        Self { router, ledger, config }
    }

    pub fn config(&self) -> &ChatServiceConfig {
        &self.config
    }

    pub fn classify(&self, query_type: &str) -> Billing {
        if self.config.billable_query_types.contains(query_type) {
            Billing::Billable
        } else {
            Billing::Free
        }
    }

    /// Route a submission to its model and settle credit for it.
    ///
    /// Unknown models fail before the ledger is touched. Billable calls are debited only
    /// after the provider has answered.
    #[instrument(skip(self, submission), fields(model = %submission.model_name, query_type = %submission.query_type))]
    pub async fn submit(&self, user_id: &str, submission: ChatSubmission) -> Result<ChatOutcome> {
        submission.check()?;
        let ChatSubmission {
            model_name,
            query_type,
            mut request,
        } = submission;

        let billing = self.classify(&query_type);
        let cost = self.router.get_cost(&model_name)?;
        let adapter = self.router.get_adapter(&model_name)?;

        if billing == Billing::Billable {
            // Check and report the same balance read.
            let credit_remaining = self.ledger.get_balance(user_id).await?;
            if credit_remaining < cost {
                info!(
                    "Insufficient credit for {}: balance {} below cost {}",
                    user_id, credit_remaining, cost
                );
                return Ok(ChatOutcome::InsufficientCredits {
                    message: self.config.insufficient_credits_message.clone(),
                    credit_remaining,
                });
            }
        }

        let mut call = ProviderCall::new(adapter.as_ref()).with_deadline(self.config.request_timeout);
        if let Some(instruction) = request.instruction.take().filter(|i| !i.trim().is_empty()) {
            call.set_instruction(instruction);
        }
        let response = call.respond(request).await;

        let chargeable = billing == Billing::Billable
            && (!response.is_provider_error() || self.config.charge_on_provider_error);

        let (credit_remaining, charged) = if chargeable {
            let metadata = UsageMetadata::new(model_name.as_str(), query_type.as_str());
            let balance = self.ledger.debit(user_id, cost, &metadata).await?;
            (balance, Some(cost))
        } else {
            debug!("No charge for {} ({:?}, status {:?})", user_id, billing, response.status);
            (self.ledger.get_balance(user_id).await?, None)
        };

        Ok(ChatOutcome::Completed {
            response,
            credit_remaining,
            charged,
        })
    }

    pub async fn balance(&self, user_id: &str) -> Result<Decimal> {
        self.ledger.get_balance(user_id).await
    }

    pub async fn recharge(&self, user_id: &str, amount: Decimal) -> Result<Decimal> {
        self.ledger.credit(user_id, amount).await
    }
}
