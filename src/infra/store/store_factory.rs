// Backend selection, driven by host configuration at startup.
//
// One concrete store per engine, no shared base hierarchy: the enum simply
// forwards each trait call to whichever backend was configured.

use crate::core::currency::Currency;
use crate::core::ledger::{BalanceStore, JournalEntry, LeaderboardEntry, StoreError};
use crate::infra::store::postgres_balance_store::PostgresBalanceStore;
use crate::infra::store::sqlite_balance_store::SqliteBalanceStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

fn default_pg_port() -> u16 {
    5432
}

/// Which engine to run against, with its connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Embedded file engine for small deployments.
    Sqlite { path: String },
    /// Networked engine for larger deployments.
    Postgres {
        host: String,
        #[serde(default = "default_pg_port")]
        port: u16,
        database: String,
        username: String,
        password: String,
    },
}

fn default_pool_size() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

/// Storage section of the host's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(flatten)]
    pub backend: StoreBackend,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

/// The configured store, ready to back a `LedgerService`.
pub enum BackendStore {
    Sqlite(SqliteBalanceStore),
    Postgres(PostgresBalanceStore),
}

impl BackendStore {
    /// Connect to the configured backend and run its migrations.
    pub async fn connect(settings: &StoreSettings) -> anyhow::Result<Self> {
        let acquire_timeout = Duration::from_secs(settings.acquire_timeout_secs.max(1));
        match &settings.backend {
            StoreBackend::Sqlite { path } => {
                tracing::info!(path, "connecting embedded sqlite store");
                let store =
                    SqliteBalanceStore::connect_with(path, settings.pool_size, acquire_timeout)
                        .await?;
                Ok(Self::Sqlite(store))
            }
            StoreBackend::Postgres {
                host,
                port,
                database,
                username,
                password,
            } => {
                tracing::info!(host, port, database, "connecting postgres store");
                let store = PostgresBalanceStore::connect(
                    host,
                    *port,
                    database,
                    username,
                    password,
                    settings.pool_size,
                    acquire_timeout,
                )
                .await?;
                Ok(Self::Postgres(store))
            }
        }
    }
}

#[async_trait]
impl BalanceStore for BackendStore {
    async fn balance(&self, player: u64, currency: &Currency) -> Result<i64, StoreError> {
        match self {
            Self::Sqlite(store) => store.balance(player, currency).await,
            Self::Postgres(store) => store.balance(player, currency).await,
        }
    }

    async fn create_account_if_absent(
        &self,
        player: u64,
        currency: &Currency,
    ) -> Result<i64, StoreError> {
        match self {
            Self::Sqlite(store) => store.create_account_if_absent(player, currency).await,
            Self::Postgres(store) => store.create_account_if_absent(player, currency).await,
        }
    }

    async fn apply_delta(
        &self,
        player: u64,
        currency: &Currency,
        delta: i64,
        allow_negative: bool,
    ) -> Result<i64, StoreError> {
        match self {
            Self::Sqlite(store) => {
                store
                    .apply_delta(player, currency, delta, allow_negative)
                    .await
            }
            Self::Postgres(store) => {
                store
                    .apply_delta(player, currency, delta, allow_negative)
                    .await
            }
        }
    }

    async fn set_balance(
        &self,
        player: u64,
        currency: &Currency,
        amount: i64,
    ) -> Result<i64, StoreError> {
        match self {
            Self::Sqlite(store) => store.set_balance(player, currency, amount).await,
            Self::Postgres(store) => store.set_balance(player, currency, amount).await,
        }
    }

    async fn transfer(
        &self,
        from: u64,
        to: u64,
        currency: &Currency,
        amount: i64,
        allow_negative: bool,
    ) -> Result<(i64, i64), StoreError> {
        match self {
            Self::Sqlite(store) => {
                store
                    .transfer(from, to, currency, amount, allow_negative)
                    .await
            }
            Self::Postgres(store) => {
                store
                    .transfer(from, to, currency, amount, allow_negative)
                    .await
            }
        }
    }

    async fn top_balances(
        &self,
        currency: &Currency,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        match self {
            Self::Sqlite(store) => store.top_balances(currency, offset, limit).await,
            Self::Postgres(store) => store.top_balances(currency, offset, limit).await,
        }
    }

    async fn record_entry(&self, entry: JournalEntry) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(store) => store.record_entry(entry).await,
            Self::Postgres(store) => store.record_entry(entry).await,
        }
    }

    async fn recent_entries(
        &self,
        player: u64,
        currency: &Currency,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        match self {
            Self::Sqlite(store) => store.recent_entries(player, currency, limit).await,
            Self::Postgres(store) => store.recent_entries(player, currency, limit).await,
        }
    }
}
