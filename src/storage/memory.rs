use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::Result;
use crate::storage::ledger::{AccountUpdate, CreditAccount, LedgerStore, Transaction};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, CreditAccount>,
    transactions: Vec<Transaction>,
}

/// Process-local ledger store. Data is lost when the process exits.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account_count(&self) -> usize {
        self.state.lock().accounts.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>> {
        Ok(self.state.lock().accounts.get(user_id).cloned())
    }

    async fn create_account(&self, account: &CreditAccount) -> Result<bool> {
        let mut state = self.state.lock();
        if state.accounts.contains_key(&account.user_id) {
            return Ok(false);
        }
        state.accounts.insert(account.user_id.clone(), account.clone());
        Ok(true)
    }

    async fn commit(&self, update: &AccountUpdate) -> Result<bool> {
        let mut state = self.state.lock();
        match state.accounts.get_mut(&update.account.user_id) {
            Some(current) if current.version == update.expected_version => {
                *current = update.account.clone();
            }
            _ => return Ok(false),
        }
        state.transactions.push(update.transaction.clone());
        Ok(true)
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}
