// Storage port for the ledger.
//
// This abstraction keeps the ledger backend-agnostic: an embedded SQLite
// file for small deployments, networked PostgreSQL for larger ones, or an
// in-memory double for tests. The store relies on the database's own
// transaction guarantees for atomicity; it holds no in-process locks.

use crate::core::currency::Currency;
use crate::core::ledger::ledger_models::{JournalEntry, LeaderboardEntry};
use async_trait::async_trait;
use thiserror::Error;

/// Store-boundary error taxonomy.
///
/// `Transient` failures (connection reset, pool exhaustion, database-detected
/// deadlock) are worth retrying with backoff; `Fatal` ones (bad schema,
/// constraint violation) are surfaced immediately for operator attention.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),

    /// The guarded balance update matched no row under a non-overdraft
    /// policy. The ledger maps this to a `Rejected` outcome.
    #[error("insufficient funds")]
    InsufficientFunds,
}

/// Trait for durable balance storage and atomic numeric mutation.
///
/// Implementations must make `apply_delta` and `transfer` atomic at the
/// database level (single transaction, guarded updates), so they stay
/// correct even if several processes share one database.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Current balance, or the currency's starting balance if no row exists.
    /// Reading never creates a row.
    async fn balance(&self, player: u64, currency: &Currency) -> Result<i64, StoreError>;

    /// Idempotently create the account row seeded with the currency's
    /// starting balance. Returns the balance either way. Implemented as an
    /// atomic insert-if-not-exists so concurrent first-touches can't race.
    async fn create_account_if_absent(
        &self,
        player: u64,
        currency: &Currency,
    ) -> Result<i64, StoreError>;

    /// Atomically add `delta` (may be negative) to the balance in one
    /// database transaction, creating the row first if needed. When
    /// `allow_negative` is false the update is guarded so the balance can
    /// never drop below zero; a guarded update that matches no row yields
    /// `StoreError::InsufficientFunds`. Returns the resulting balance.
    async fn apply_delta(
        &self,
        player: u64,
        currency: &Currency,
        delta: i64,
        allow_negative: bool,
    ) -> Result<i64, StoreError>;

    /// Unconditional overwrite with upsert semantics.
    async fn set_balance(
        &self,
        player: u64,
        currency: &Currency,
        amount: i64,
    ) -> Result<i64, StoreError>;

    /// Move `amount` between two players in a single database transaction.
    /// If the debit leg fails the whole transaction rolls back and no
    /// partial state is ever visible. Returns (from_balance, to_balance).
    async fn transfer(
        &self,
        from: u64,
        to: u64,
        currency: &Currency,
        amount: i64,
        allow_negative: bool,
    ) -> Result<(i64, i64), StoreError>;

    /// Highest balances for a currency, descending, for leaderboards.
    async fn top_balances(
        &self,
        currency: &Currency,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<LeaderboardEntry>, StoreError>;

    /// Append an audit-trail record.
    async fn record_entry(&self, entry: JournalEntry) -> Result<(), StoreError>;

    /// Most recent audit records for one account, newest first.
    async fn recent_entries(
        &self,
        player: u64,
        currency: &Currency,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, StoreError>;
}
