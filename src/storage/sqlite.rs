use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::ledger::{AccountUpdate, CreditAccount, LedgerStore, Transaction, TransactionKind};

/// Ledger store backed by SQLite through sqlx.
///
/// Each commit runs in one transaction whose first statement is the guarded
/// `UPDATE`, so the write lock is taken before anything is read.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Opening ledger database at: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Ledger database migrations completed successfully");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get_account(&self, user_id: &str) -> Result<Option<CreditAccount>> {
        let row = sqlx::query(
            "SELECT user_id, balance, total_used, created_at, last_updated, version
             FROM credit_accounts WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_account(&row)).transpose()
    }

    async fn create_account(&self, account: &CreditAccount) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO credit_accounts (user_id, balance, total_used, created_at, last_updated, version)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(&account.user_id)
        .bind(decimal_helpers::decimal_to_string(account.balance))
        .bind(decimal_helpers::decimal_to_string(account.total_used))
        .bind(account.created_at.timestamp_millis())
        .bind(account.last_updated.timestamp_millis())
        .bind(version_to_i64(account.version)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit(&self, update: &AccountUpdate) -> Result<bool> {
        let account = &update.account;
        let transaction = &update.transaction;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE credit_accounts
             SET balance = ?, total_used = ?, last_updated = ?, version = ?
             WHERE user_id = ? AND version = ?",
        )
        .bind(decimal_helpers::decimal_to_string(account.balance))
        .bind(decimal_helpers::decimal_to_string(account.total_used))
        .bind(account.last_updated.timestamp_millis())
        .bind(version_to_i64(account.version)?)
        .bind(&account.user_id)
        .bind(version_to_i64(update.expected_version)?)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(
                "Commit for {} rejected, version {} is stale",
                account.user_id, update.expected_version
            );
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO credit_transactions
             (id, user_id, kind, model, query_type, amount, balance_after, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transaction.id)
        .bind(&transaction.user_id)
        .bind(transaction.kind.as_str())
        .bind(&transaction.model)
        .bind(&transaction.query_type)
        .bind(decimal_helpers::decimal_to_string(transaction.amount))
        .bind(decimal_helpers::decimal_to_string(transaction.balance_after))
        .bind(transaction.timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT id, user_id, kind, model, query_type, amount, balance_after, timestamp
             FROM credit_transactions WHERE user_id = ? ORDER BY seq ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transaction).collect()
    }
}

fn row_to_account(row: &SqliteRow) -> Result<CreditAccount> {
    let balance: String = row.try_get("balance")?;
    let total_used: String = row.try_get("total_used")?;
    let version: i64 = row.try_get("version")?;

    Ok(CreditAccount {
        user_id: row.try_get("user_id")?,
        balance: decimal_helpers::string_to_decimal(&balance)?,
        total_used: decimal_helpers::string_to_decimal(&total_used)?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        last_updated: millis_to_datetime(row.try_get("last_updated")?)?,
        version: u64::try_from(version).map_err(|_| Error::ledger(format!("Negative account version: {}", version)))?,
    })
}

fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
    let kind: String = row.try_get("kind")?;
    let amount: String = row.try_get("amount")?;
    let balance_after: String = row.try_get("balance_after")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: TransactionKind::from_str(&kind)?,
        model: row.try_get("model")?,
        query_type: row.try_get("query_type")?,
        amount: decimal_helpers::string_to_decimal(&amount)?,
        balance_after: decimal_helpers::string_to_decimal(&balance_after)?,
        timestamp: millis_to_datetime(row.try_get("timestamp")?)?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| Error::ledger(format!("Invalid timestamp: {}", millis)))
}

fn version_to_i64(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::ledger(format!("Account version out of range: {}", version)))
}

/// Decimal amounts are persisted as TEXT so no precision is lost.
pub mod decimal_helpers {
    use crate::error::{Error, Result};
    use rust_decimal::Decimal;

    pub fn decimal_to_string(decimal: Decimal) -> String {
        decimal.normalize().to_string()
    }

    pub fn string_to_decimal(s: &str) -> Result<Decimal> {
        s.parse().map_err(|e| {
            Error::Database(sqlx::Error::Decode(
                format!("Failed to parse decimal from string '{}': {}", s, e).into(),
            ))
        })
    }
}
