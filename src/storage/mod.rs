// Credit ledger and its persistence backends

pub mod ledger;
pub mod memory;
pub mod sqlite;

pub use ledger::{
    AccountUpdate, CreditAccount, CreditLedger, LedgerSettings, LedgerStore, Transaction, TransactionKind,
    UsageMetadata,
};
pub use memory::MemoryLedgerStore;
pub use sqlite::{decimal_helpers, SqliteLedgerStore};
