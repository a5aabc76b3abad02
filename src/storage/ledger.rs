use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A user's credit balance. `version` increases by one with every committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: String,
    pub balance: Decimal,
    pub total_used: Decimal,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
}

impl CreditAccount {
    pub fn new(user_id: impl Into<String>, free_credits: Decimal) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            balance: free_credits,
            total_used: Decimal::ZERO,
            created_at: now,
            last_updated: now,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Usage,
    Recharge,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Usage => "usage",
            TransactionKind::Recharge => "recharge",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "usage" => Ok(TransactionKind::Usage),
            "recharge" => Ok(TransactionKind::Recharge),
            other => Err(Error::ledger(format!("Unknown transaction kind: {}", other))),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record of one balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub model: Option<String>,
    pub query_type: Option<String>,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// What a debit is being charged for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageMetadata {
    pub model: String,
    pub query_type: Option<String>,
}

impl UsageMetadata {
    pub fn new(model: impl Into<String>, query_type: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            query_type: Some(query_type.into()),
        }
    }
}

/// A proposed account state plus its audit record, valid only against `expected_version`.
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub expected_version: u64,
    pub account: CreditAccount,
    pub transaction: Transaction,
}

/// Persistence behind the ledger. Implementations must apply `commit` atomically:
/// either the account matches `expected_version` and both the new state and the
/// transaction are stored, or nothing changes.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>>;

    /// Insert if absent. Returns whether this call created the account.
    async fn create_account(&self, account: &CreditAccount) -> Result<bool>;

    /// Compare-and-swap on the account version. Returns `false` on conflict.
    async fn commit(&self, update: &AccountUpdate) -> Result<bool>;

    /// Transactions for one user, oldest first.
    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>>;
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub free_credits: Decimal,
    pub max_commit_attempts: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            free_credits: Decimal::new(10, 0),
            max_commit_attempts: 16,
        }
    }
}

enum CommitFailure {
    Conflict,
    Fatal(Error),
}

/// Credit balances with atomic debit and credit over any [`LedgerStore`].
///
/// Nothing is cached: every read goes to the store.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    settings: LedgerSettings,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, settings: LedgerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Current balance; a missing account is created with the free starting balance.
    pub async fn get_balance(&self, user_id: &str) -> Result<Decimal> {
        Ok(self.account(user_id).await?.balance)
    }

    pub async fn has_sufficient(&self, user_id: &str, amount: Decimal) -> Result<bool> {
        Ok(self.get_balance(user_id).await? >= amount)
    }

    #[instrument(skip(self, metadata), fields(model = %metadata.model))]
    pub async fn debit(&self, user_id: &str, amount: Decimal, metadata: &UsageMetadata) -> Result<Decimal> {
        let new_balance = self
            .apply(user_id, amount, TransactionKind::Usage, Some(metadata))
            .await?;
        info!("Debited {} credits from {}, balance now {}", amount, user_id, new_balance);
        Ok(new_balance)
    }

    #[instrument(skip(self))]
    pub async fn credit(&self, user_id: &str, amount: Decimal) -> Result<Decimal> {
        let new_balance = self.apply(user_id, amount, TransactionKind::Recharge, None).await?;
        info!("Credited {} credits to {}, balance now {}", amount, user_id, new_balance);
        Ok(new_balance)
    }

    pub async fn account(&self, user_id: &str) -> Result<CreditAccount> {
        if let Some(account) = self.store.get_account(user_id).await? {
            return Ok(account);
        }

        let fresh = CreditAccount::new(user_id, self.settings.free_credits);
        if self.store.create_account(&fresh).await? {
            info!("Initialized credit account for {} with {} free credits", user_id, fresh.balance);
            return Ok(fresh);
        }

        // Lost the creation race; the winner's record is authoritative.
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| Error::ledger(format!("Account for {} vanished after creation", user_id)))
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.store.list_transactions(user_id).await
    }

    async fn apply(
        &self,
        user_id: &str,
        amount: Decimal,
        kind: TransactionKind,
        metadata: Option<&UsageMetadata>,
    ) -> Result<Decimal> {
        if amount < Decimal::ZERO {
            return Err(Error::validation(format!("Amount must not be negative: {}", amount)));
        }

        let retries = self.settings.max_commit_attempts.saturating_sub(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .max_delay(Duration::from_millis(50))
            .map(jitter)
            .take(retries);

        let outcome = RetryIf::spawn(
            strategy,
            || self.try_apply(user_id, amount, kind, metadata),
            |failure: &CommitFailure| matches!(failure, CommitFailure::Conflict),
        )
        .await;

        match outcome {
            Ok(balance) => Ok(balance),
            Err(CommitFailure::Fatal(e)) => {
                error!("Ledger {} for {} failed: {}", kind, user_id, e);
                Err(e)
            }
            Err(CommitFailure::Conflict) => {
                error!(
                    "Ledger {} for {} gave up after {} conflicting attempts",
                    kind, user_id, self.settings.max_commit_attempts
                );
                Err(Error::ledger(format!(
                    "Could not commit {} for {} after {} attempts due to concurrent updates",
                    kind, user_id, self.settings.max_commit_attempts
                )))
            }
        }
    }

    async fn try_apply(
        &self,
        user_id: &str,
        amount: Decimal,
        kind: TransactionKind,
        metadata: Option<&UsageMetadata>,
    ) -> std::result::Result<Decimal, CommitFailure> {
        let current = self.account(user_id).await.map_err(CommitFailure::Fatal)?;
        let now = Utc::now();

        let mut next = current.clone();
        match kind {
            TransactionKind::Usage => {
                next.balance -= amount;
                next.total_used += amount;
            }
            TransactionKind::Recharge => next.balance += amount,
        }
        next.last_updated = now;
        next.version = current.version + 1;

        let update = AccountUpdate {
            expected_version: current.version,
            transaction: Transaction {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                kind,
                model: metadata.map(|m| m.model.clone()),
                query_type: metadata.and_then(|m| m.query_type.clone()),
                amount,
                balance_after: next.balance,
                timestamp: now,
            },
            account: next,
        };

        match self.store.commit(&update).await {
            Ok(true) => Ok(update.account.balance),
            Ok(false) => {
                warn!("Version conflict on account {} at version {}, retrying", user_id, current.version);
                Err(CommitFailure::Conflict)
            }
            Err(e) => Err(CommitFailure::Fatal(e)),
        }
    }
}

impl fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreditLedger").field("settings", &self.settings).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryLedgerStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ledger_with(store: Arc<dyn LedgerStore>) -> CreditLedger {
        CreditLedger::new(store, LedgerSettings::default())
    }

    /// Store wrapper that reports a version conflict on the first `n` commits.
    struct ConflictingStore {
        inner: MemoryLedgerStore,
        conflicts_left: AtomicUsize,
    }

    #[async_trait]
    impl LedgerStore for ConflictingStore {
        async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>> {
            self.inner.get_account(user_id).await
        }

        async fn create_account(&self, account: &CreditAccount) -> Result<bool> {
            self.inner.create_account(account).await
        }

        async fn commit(&self, update: &AccountUpdate) -> Result<bool> {
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.commit(update).await
        }

        async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
            self.inner.list_transactions(user_id).await
        }
    }

    #[tokio::test]
    async fn test_first_read_initializes_free_credits() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = ledger_with(store.clone());

        assert_eq!(ledger.get_balance("alice").await.unwrap(), Decimal::new(10, 0));
        assert_eq!(ledger.get_balance("alice").await.unwrap(), Decimal::new(10, 0));
        assert_eq!(store.account_count(), 1);
        assert!(ledger.transactions("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debit_updates_balance_and_logs_usage() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let metadata = UsageMetadata::new("llmopenaigpt", "agent_listening_from");

        let balance = ledger.debit("bob", Decimal::new(25, 1), &metadata).await.unwrap();
        assert_eq!(balance, Decimal::new(75, 1));

        let account = ledger.account("bob").await.unwrap();
        assert_eq!(account.total_used, Decimal::new(25, 1));
        assert_eq!(account.version, 1);

        let transactions = ledger.transactions("bob").await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].kind, TransactionKind::Usage);
        assert_eq!(transactions[0].model.as_deref(), Some("llmopenaigpt"));
        assert_eq!(transactions[0].query_type.as_deref(), Some("agent_listening_from"));
        assert_eq!(transactions[0].balance_after, Decimal::new(75, 1));
    }

    #[tokio::test]
    async fn test_credit_logs_recharge() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let balance = ledger.credit("carol", Decimal::new(5, 0)).await.unwrap();
        assert_eq!(balance, Decimal::new(15, 0));

        let transactions = ledger.transactions("carol").await.unwrap();
        assert_eq!(transactions[0].kind, TransactionKind::Recharge);
        assert!(transactions[0].model.is_none());
        assert_eq!(ledger.account("carol").await.unwrap().total_used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_negative_amounts_rejected() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let metadata = UsageMetadata::new("m", "q");
        assert!(matches!(
            ledger.debit("dave", Decimal::new(-1, 0), &metadata).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(ledger.credit("dave", Decimal::new(-1, 0)).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_has_sufficient_boundary() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        assert!(ledger.has_sufficient("erin", Decimal::new(10, 0)).await.unwrap());
        assert!(!ledger.has_sufficient("erin", Decimal::new(1001, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryLedgerStore::new(),
            conflicts_left: AtomicUsize::new(3),
        });
        let ledger = ledger_with(store);

        let balance = ledger.credit("frank", Decimal::ONE).await.unwrap();
        assert_eq!(balance, Decimal::new(11, 0));
        assert_eq!(ledger.transactions("frank").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_ledger_errors() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryLedgerStore::new(),
            conflicts_left: AtomicUsize::new(usize::MAX),
        });
        let ledger = CreditLedger::new(
            store,
            LedgerSettings {
                max_commit_attempts: 3,
                ..LedgerSettings::default()
            },
        );

        let err = ledger.credit("grace", Decimal::ONE).await.unwrap_err();
        assert!(err.is_ledger());
        assert_eq!(ledger.get_balance("grace").await.unwrap(), Decimal::new(10, 0));
    }
}
