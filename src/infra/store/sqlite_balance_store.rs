// SQLite implementation of the BalanceStore trait - the embedded file
// engine for small deployments.

use crate::core::currency::Currency;
use crate::core::ledger::{BalanceStore, JournalEntry, LeaderboardEntry, StoreError};
use crate::infra::store::sql_error::classify;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::Duration;

pub struct SqliteBalanceStore {
    pool: SqlitePool,
}

impl SqliteBalanceStore {
    /// Open (creating if missing) the database file and run migrations.
    pub async fn connect(database_path: &str) -> anyhow::Result<Self> {
        Self::connect_with(database_path, 5, Duration::from_secs(10)).await
    }

    pub async fn connect_with(
        database_path: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let connection_string = format!("sqlite://{}?mode=rwc", database_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(&connection_string)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Idempotent schema creation; safe to run on every startup.
    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                player_id INTEGER NOT NULL,
                currency_id TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (player_id, currency_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_id INTEGER NOT NULL,
                currency_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_journal_account
            ON journal(player_id, currency_id, id DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl BalanceStore for SqliteBalanceStore {
    async fn balance(&self, player: u64, currency: &Currency) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT balance FROM accounts
            WHERE player_id = ? AND currency_id = ?
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row
            .map(|r| r.get::<i64, _>("balance"))
            .unwrap_or(currency.starting_balance))
    }

    async fn create_account_if_absent(
        &self,
        player: u64,
        currency: &Currency,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (player_id, currency_id, balance)
            VALUES (?, ?, ?)
            ON CONFLICT(player_id, currency_id) DO NOTHING
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .bind(currency.starting_balance)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        let row = sqlx::query(
            r#"
            SELECT balance FROM accounts
            WHERE player_id = ? AND currency_id = ?
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.get::<i64, _>("balance"))
    }

    async fn apply_delta(
        &self,
        player: u64,
        currency: &Currency,
        delta: i64,
        allow_negative: bool,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Seed the row first so a zero-row update can only mean the
        // overdraft guard fired, never a missing account.
        sqlx::query(
            r#"
            INSERT INTO accounts (player_id, currency_id, balance)
            VALUES (?, ?, ?)
            ON CONFLICT(player_id, currency_id) DO NOTHING
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .bind(currency.starting_balance)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let updated = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + ?, updated_at = CURRENT_TIMESTAMP
            WHERE player_id = ? AND currency_id = ? AND (? OR balance + ? >= 0)
            "#,
        )
        .bind(delta)
        .bind(player as i64)
        .bind(&currency.id)
        .bind(allow_negative)
        .bind(delta)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls back the seeding insert too.
            return Err(StoreError::InsufficientFunds);
        }

        let row = sqlx::query(
            r#"
            SELECT balance FROM accounts
            WHERE player_id = ? AND currency_id = ?
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(row.get::<i64, _>("balance"))
    }

    async fn set_balance(
        &self,
        player: u64,
        currency: &Currency,
        amount: i64,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (player_id, currency_id, balance)
            VALUES (?, ?, ?)
            ON CONFLICT(player_id, currency_id)
            DO UPDATE SET balance = excluded.balance, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(amount)
    }

    async fn transfer(
        &self,
        from: u64,
        to: u64,
        currency: &Currency,
        amount: i64,
        allow_negative: bool,
    ) -> Result<(i64, i64), StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        for player in [from, to] {
            sqlx::query(
                r#"
                INSERT INTO accounts (player_id, currency_id, balance)
                VALUES (?, ?, ?)
                ON CONFLICT(player_id, currency_id) DO NOTHING
                "#,
            )
            .bind(player as i64)
            .bind(&currency.id)
            .bind(currency.starting_balance)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        let debited = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - ?, updated_at = CURRENT_TIMESTAMP
            WHERE player_id = ? AND currency_id = ? AND (? OR balance - ? >= 0)
            "#,
        )
        .bind(amount)
        .bind(from as i64)
        .bind(&currency.id)
        .bind(allow_negative)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        if debited.rows_affected() == 0 {
            return Err(StoreError::InsufficientFunds);
        }

        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + ?, updated_at = CURRENT_TIMESTAMP
            WHERE player_id = ? AND currency_id = ?
            "#,
        )
        .bind(amount)
        .bind(to as i64)
        .bind(&currency.id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let mut balances = (0i64, 0i64);
        for (player, slot) in [(from, 0usize), (to, 1usize)] {
            let row = sqlx::query(
                r#"
                SELECT balance FROM accounts
                WHERE player_id = ? AND currency_id = ?
                "#,
            )
            .bind(player as i64)
            .bind(&currency.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;
            if slot == 0 {
                balances.0 = row.get::<i64, _>("balance");
            } else {
                balances.1 = row.get::<i64, _>("balance");
            }
        }

        tx.commit().await.map_err(classify)?;
        Ok(balances)
    }

    async fn top_balances(
        &self,
        currency: &Currency,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT player_id, balance FROM accounts
            WHERE currency_id = ?
            ORDER BY balance DESC, player_id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&currency.id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .iter()
            .map(|row| LeaderboardEntry {
                player: row.get::<i64, _>("player_id") as u64,
                balance: row.get::<i64, _>("balance"),
            })
            .collect())
    }

    async fn record_entry(&self, entry: JournalEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO journal (player_id, currency_id, amount, reason, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.player as i64)
        .bind(&entry.currency)
        .bind(entry.amount)
        .bind(&entry.reason)
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn recent_entries(
        &self,
        player: u64,
        currency: &Currency,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT player_id, currency_id, amount, reason, timestamp
            FROM journal
            WHERE player_id = ? AND currency_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let timestamp_str: String = row.get("timestamp");
                let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                    .ok()?
                    .with_timezone(&Utc);
                Some(JournalEntry {
                    player: row.get::<i64, _>("player_id") as u64,
                    currency: row.get::<String, _>("currency_id"),
                    amount: row.get::<i64, _>("amount"),
                    reason: row.get::<String, _>("reason"),
                    timestamp,
                })
            })
            .collect())
    }
}
