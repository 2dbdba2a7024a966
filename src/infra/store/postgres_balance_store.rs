// PostgreSQL implementation of the BalanceStore trait - the networked
// engine for larger deployments, where several server processes may share
// one database. Atomicity comes entirely from row-level locking inside the
// database transactions below, so this backend stays correct under
// cross-process concurrency.

use crate::core::currency::Currency;
use crate::core::ledger::{BalanceStore, JournalEntry, LeaderboardEntry, StoreError};
use crate::infra::store::sql_error::classify;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;

pub struct PostgresBalanceStore {
    pool: PgPool,
}

impl PostgresBalanceStore {
    pub async fn connect(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database)
            .username(username)
            .password(password);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
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
                player_id BIGINT NOT NULL,
                currency_id TEXT NOT NULL,
                balance BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (player_id, currency_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal (
                id BIGSERIAL PRIMARY KEY,
                player_id BIGINT NOT NULL,
                currency_id TEXT NOT NULL,
                amount BIGINT NOT NULL,
                reason TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
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

    async fn seed_row(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        player: u64,
        currency: &Currency,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (player_id, currency_id, balance)
            VALUES ($1, $2, $3)
            ON CONFLICT (player_id, currency_id) DO NOTHING
            "#,
        )
        .bind(player as i64)
        .bind(&currency.id)
        .bind(currency.starting_balance)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl BalanceStore for PostgresBalanceStore {
    async fn balance(&self, player: u64, currency: &Currency) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT balance FROM accounts
            WHERE player_id = $1 AND currency_id = $2
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
            VALUES ($1, $2, $3)
            ON CONFLICT (player_id, currency_id) DO NOTHING
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
            WHERE player_id = $1 AND currency_id = $2
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
        self.seed_row(&mut tx, player, currency).await?;

        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $1, updated_at = NOW()
            WHERE player_id = $2 AND currency_id = $3 AND ($4 OR balance + $1 >= 0)
            RETURNING balance
            "#,
        )
        .bind(delta)
        .bind(player as i64)
        .bind(&currency.id)
        .bind(allow_negative)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        let Some(row) = row else {
            return Err(StoreError::InsufficientFunds);
        };

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
            VALUES ($1, $2, $3)
            ON CONFLICT (player_id, currency_id)
            DO UPDATE SET balance = EXCLUDED.balance, updated_at = NOW()
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
        // Seed in a fixed order so concurrent transfers over the same pair
        // take their row locks consistently.
        for player in if from <= to { [from, to] } else { [to, from] } {
            self.seed_row(&mut tx, player, currency).await?;
        }

        let debit = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - $1, updated_at = NOW()
            WHERE player_id = $2 AND currency_id = $3 AND ($4 OR balance - $1 >= 0)
            RETURNING balance
            "#,
        )
        .bind(amount)
        .bind(from as i64)
        .bind(&currency.id)
        .bind(allow_negative)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        let Some(debit) = debit else {
            return Err(StoreError::InsufficientFunds);
        };

        let credit = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $1, updated_at = NOW()
            WHERE player_id = $2 AND currency_id = $3
            RETURNING balance
            "#,
        )
        .bind(amount)
        .bind(to as i64)
        .bind(&currency.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok((
            debit.get::<i64, _>("balance"),
            credit.get::<i64, _>("balance"),
        ))
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
            WHERE currency_id = $1
            ORDER BY balance DESC, player_id ASC
            LIMIT $2 OFFSET $3
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
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.player as i64)
        .bind(&entry.currency)
        .bind(entry.amount)
        .bind(&entry.reason)
        .bind(entry.timestamp)
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
            WHERE player_id = $1 AND currency_id = $2
            ORDER BY id DESC
            LIMIT $3
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
            .map(|row| JournalEntry {
                player: row.get::<i64, _>("player_id") as u64,
                currency: row.get::<String, _>("currency_id"),
                amount: row.get::<i64, _>("amount"),
                reason: row.get::<String, _>("reason"),
                timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
            })
            .collect())
    }
}
