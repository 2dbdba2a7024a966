// Ledger service - the public operation surface and the concurrency and
// consistency boundary of the crate.
//
// Every mutation follows the same path: validate before any I/O, acquire the
// per-account serialization lock, apply the change to the store (retrying
// transient failures with backoff), then update the write-through cache with
// the committed result. Store-level errors never escape: every path resolves
// to a typed `Outcome`.

use crate::core::currency::{Currency, CurrencyRegistry};
use crate::core::ledger::balance_cache::BalanceCache;
use crate::core::ledger::balance_store::{BalanceStore, StoreError};
use crate::core::ledger::leaderboard::Leaderboard;
use crate::core::ledger::ledger_models::{
    AccountKey, FailureCause, JournalEntry, LeaderboardEntry, LedgerOperation, Outcome,
    QueryError, RejectReason,
};
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tuning knobs for the ledger. Defaults mirror a small game server:
/// a 100-entry cache expiring 20 minutes after last access and a 5-minute
/// leaderboard refresh window.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How many times a transient store failure is retried before the
    /// operation resolves to `Failed`.
    pub max_retries: u32,

    /// Base backoff between retries; attempt N waits N times this.
    pub retry_backoff: Duration,

    /// Maximum number of cached (player, currency) balances.
    pub cache_capacity: usize,

    /// Cached balances expire this long after last access.
    pub cache_ttl: Duration,

    /// Leaderboards are re-fetched from the store after this long.
    pub leaderboard_ttl: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff: Duration::from_millis(50),
            cache_capacity: 100,
            cache_ttl: Duration::from_secs(20 * 60),
            leaderboard_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// The orchestrating ledger component.
///
/// Generic over S: BalanceStore so backends can be swapped (SQL in
/// production, in-memory for tests).
pub struct LedgerService<S: BalanceStore> {
    registry: Arc<CurrencyRegistry>,
    store: S,
    cache: BalanceCache,
    leaderboard: Leaderboard,
    // Lazily grown lock table keyed by account. Entries are never removed;
    // the table is bounded by the number of distinct accounts touched.
    locks: DashMap<AccountKey, Arc<Mutex<()>>>,
    config: LedgerConfig,
}

impl<S: BalanceStore> LedgerService<S> {
    pub fn new(registry: Arc<CurrencyRegistry>, store: S) -> Self {
        Self::with_config(registry, store, LedgerConfig::default())
    }

    pub fn with_config(registry: Arc<CurrencyRegistry>, store: S, config: LedgerConfig) -> Self {
        Self {
            registry,
            store,
            cache: BalanceCache::new(config.cache_capacity, config.cache_ttl),
            leaderboard: Leaderboard::new(config.leaderboard_ttl),
            locks: DashMap::new(),
            config,
        }
    }

    /// Dispatch a queued operation. This is what the execution gateway's
    /// workers call.
    pub async fn execute(&self, operation: LedgerOperation) -> Outcome {
        match operation {
            LedgerOperation::Deposit {
                player,
                currency,
                amount,
                reason,
            } => self.deposit(player, &currency, amount, &reason).await,
            LedgerOperation::Withdraw {
                player,
                currency,
                amount,
                reason,
            } => self.withdraw(player, &currency, amount, &reason).await,
            LedgerOperation::Set {
                player,
                currency,
                amount,
                reason,
            } => self.set(player, &currency, amount, &reason).await,
            LedgerOperation::Transfer {
                from,
                to,
                currency,
                amount,
                reason,
            } => self.transfer(from, to, &currency, amount, &reason).await,
            LedgerOperation::Balance { player, currency } => {
                self.balance(player, &currency).await
            }
        }
    }

    /// Current balance, preferring the cache. A miss takes the account lock
    /// so the store read can't interleave with an in-flight mutation, then
    /// fills the cache with the committed value it observed.
    pub async fn balance(&self, player: u64, currency_id: &str) -> Outcome {
        let currency = match self.resolve(currency_id) {
            Ok(c) => c,
            Err(rejected) => return rejected,
        };
        let key = AccountKey::new(player, &currency.id);
        if let Some(balance) = self.cache.get(&key) {
            return Outcome::Committed(balance);
        }

        let handle = self.lock_handle(&key);
        let _guard = handle.lock().await;
        if let Some(balance) = self.cache.get(&key) {
            return Outcome::Committed(balance);
        }
        match self
            .with_retry("balance", || self.store.balance(player, currency))
            .await
        {
            Ok(balance) => {
                self.cache.put(&key, balance);
                Outcome::Committed(balance)
            }
            Err(err) => Outcome::Failed(store_failure(err)),
        }
    }

    /// Add `amount` (must be positive) to the player's balance.
    pub async fn deposit(
        &self,
        player: u64,
        currency_id: &str,
        amount: i64,
        reason: &str,
    ) -> Outcome {
        if let Err(rejected) = self.resolve(currency_id) {
            return rejected;
        }
        if amount <= 0 {
            return Outcome::Rejected(RejectReason::NonPositiveAmount(amount));
        }
        // A deposit of a positive amount can't violate the overdraft policy,
        // even when the balance is already negative.
        self.mutate("deposit", player, currency_id, amount, true, reason)
            .await
    }

    /// Subtract `amount` (must be positive) from the player's balance,
    /// subject to the currency's overdraft policy.
    pub async fn withdraw(
        &self,
        player: u64,
        currency_id: &str,
        amount: i64,
        reason: &str,
    ) -> Outcome {
        let allow_negative = match self.resolve(currency_id) {
            Ok(c) => c.allow_overdraft,
            Err(rejected) => return rejected,
        };
        if amount <= 0 {
            return Outcome::Rejected(RejectReason::NonPositiveAmount(amount));
        }
        self.mutate(
            "withdraw",
            player,
            currency_id,
            -amount,
            allow_negative,
            reason,
        )
        .await
    }

    /// Unconditionally overwrite the balance (upsert).
    pub async fn set(&self, player: u64, currency_id: &str, amount: i64, reason: &str) -> Outcome {
        let currency = match self.resolve(currency_id) {
            Ok(c) => c,
            Err(rejected) => return rejected,
        };
        if amount < 0 && !currency.allow_overdraft {
            return Outcome::Rejected(RejectReason::NegativeBalance);
        }
        let key = AccountKey::new(player, &currency.id);
        let handle = self.lock_handle(&key);
        let _guard = handle.lock().await;
        let started = Instant::now();

        match self
            .with_retry("set", || self.store.set_balance(player, currency, amount))
            .await
        {
            Ok(balance) => {
                self.cache.put(&key, balance);
                // Journal rows for `set` record the resulting balance, not a
                // delta; there is no prior value to diff against.
                self.journal(player, &currency.id, balance, reason).await;
                self.committed("set", &key, balance, started)
            }
            Err(err) => self.failed("set", &key, err),
        }
    }

    /// Move `amount` between two players, atomically at the store level.
    /// Both account locks are taken in canonical key order, so two opposing
    /// transfers can never deadlock.
    pub async fn transfer(
        &self,
        from: u64,
        to: u64,
        currency_id: &str,
        amount: i64,
        reason: &str,
    ) -> Outcome {
        let currency = match self.resolve(currency_id) {
            Ok(c) => c,
            Err(rejected) => return rejected,
        };
        if amount <= 0 {
            return Outcome::Rejected(RejectReason::NonPositiveAmount(amount));
        }
        if from == to {
            return Outcome::Rejected(RejectReason::SelfTransfer);
        }

        let key_from = AccountKey::new(from, &currency.id);
        let key_to = AccountKey::new(to, &currency.id);
        let (first, second) = if key_from <= key_to {
            (&key_from, &key_to)
        } else {
            (&key_to, &key_from)
        };
        let first_handle = self.lock_handle(first);
        let second_handle = self.lock_handle(second);
        let _first_guard = first_handle.lock().await;
        let _second_guard = second_handle.lock().await;
        let started = Instant::now();

        match self
            .with_retry("transfer", || {
                self.store
                    .transfer(from, to, currency, amount, currency.allow_overdraft)
            })
            .await
        {
            Ok((from_balance, to_balance)) => {
                self.cache.put(&key_from, from_balance);
                self.cache.put(&key_to, to_balance);
                self.journal(from, &currency.id, -amount, reason).await;
                self.journal(to, &currency.id, amount, reason).await;
                tracing::info!(
                    op = "transfer",
                    from,
                    to,
                    currency = %currency.id,
                    amount,
                    from_balance,
                    to_balance,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ledger operation committed"
                );
                Outcome::Committed(from_balance)
            }
            Err(StoreError::InsufficientFunds) => {
                self.rejected_insufficient("transfer", &key_from, currency, amount)
                    .await
            }
            Err(err) => {
                self.cache.invalidate(&key_to);
                self.failed("transfer", &key_from, err)
            }
        }
    }

    /// Idempotently create the player's account, seeded with the currency's
    /// starting balance. Typically invoked by the host when a player joins.
    pub async fn ensure_account(&self, player: u64, currency_id: &str) -> Outcome {
        let currency = match self.resolve(currency_id) {
            Ok(c) => c,
            Err(rejected) => return rejected,
        };
        let key = AccountKey::new(player, &currency.id);
        let handle = self.lock_handle(&key);
        let _guard = handle.lock().await;

        match self
            .with_retry("ensure_account", || {
                self.store.create_account_if_absent(player, currency)
            })
            .await
        {
            Ok(balance) => {
                self.cache.put(&key, balance);
                Outcome::Committed(balance)
            }
            Err(err) => self.failed("ensure_account", &key, err),
        }
    }

    /// One page (1-based) of the currency's leaderboard, served from the
    /// TTL cache and re-fetched from the store when stale.
    pub async fn top(
        &self,
        currency_id: &str,
        page: u32,
    ) -> Result<Vec<LeaderboardEntry>, QueryError> {
        let currency = self
            .registry
            .get(currency_id)
            .map_err(|_| QueryError::UnknownCurrency(currency_id.to_string()))?;
        if let Some(entries) = self.leaderboard.page(currency_id, page) {
            return Ok(entries);
        }
        let entries = self
            .with_retry("top_balances", || {
                self.store.top_balances(currency, 0, Leaderboard::capacity())
            })
            .await
            .map_err(|err| QueryError::Failed(store_failure(err)))?;
        Ok(self.leaderboard.refresh(currency_id, entries, page))
    }

    /// Most recent audit entries for one account, newest first.
    pub async fn history(
        &self,
        player: u64,
        currency_id: &str,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, QueryError> {
        let currency = self
            .registry
            .get(currency_id)
            .map_err(|_| QueryError::UnknownCurrency(currency_id.to_string()))?;
        self.with_retry("recent_entries", || {
            self.store.recent_entries(player, currency, limit)
        })
        .await
        .map_err(|err| QueryError::Failed(store_failure(err)))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn resolve(&self, currency_id: &str) -> Result<&Currency, Outcome> {
        self.registry.get(currency_id).map_err(|_| {
            Outcome::Rejected(RejectReason::UnknownCurrency(currency_id.to_string()))
        })
    }

    fn lock_handle(&self, key: &AccountKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Shared path for deposit and withdraw: lock, guarded delta, cache.
    /// Callers validate the sign of `delta` before getting here.
    async fn mutate(
        &self,
        op: &str,
        player: u64,
        currency_id: &str,
        delta: i64,
        allow_negative: bool,
        reason: &str,
    ) -> Outcome {
        let currency = match self.resolve(currency_id) {
            Ok(c) => c,
            Err(rejected) => return rejected,
        };
        let key = AccountKey::new(player, &currency.id);
        let handle = self.lock_handle(&key);
        let _guard = handle.lock().await;
        let started = Instant::now();

        match self
            .with_retry(op, || {
                self.store
                    .apply_delta(player, currency, delta, allow_negative)
            })
            .await
        {
            Ok(balance) => {
                self.cache.put(&key, balance);
                self.journal(player, &currency.id, delta, reason).await;
                self.committed(op, &key, balance, started)
            }
            Err(StoreError::InsufficientFunds) => {
                self.rejected_insufficient(op, &key, currency, delta.abs())
                    .await
            }
            Err(err) => self.failed(op, &key, err),
        }
    }

    fn committed(&self, op: &str, key: &AccountKey, balance: i64, started: Instant) -> Outcome {
        tracing::info!(
            op,
            account = %key,
            balance,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ledger operation committed"
        );
        Outcome::Committed(balance)
    }

    /// Policy rejection: nothing changed at the store, but we take the
    /// chance to refresh the cache with the observed balance (we still hold
    /// the account lock, so the value is current). If neither the store nor
    /// the cache can say what is available, report `None` rather than a
    /// made-up number.
    async fn rejected_insufficient(
        &self,
        op: &str,
        key: &AccountKey,
        currency: &Currency,
        requested: i64,
    ) -> Outcome {
        let available = match self.store.balance(key.player, currency).await {
            Ok(balance) => {
                self.cache.put(key, balance);
                Some(balance)
            }
            Err(_) => self.cache.get(key),
        };
        tracing::info!(op, account = %key, requested, available = ?available, "ledger operation rejected");
        Outcome::Rejected(RejectReason::InsufficientFunds {
            requested,
            available,
        })
    }

    /// Drop the cached balances an operation touches. Used when an
    /// operation is cancelled mid-flight and its store outcome is unknown:
    /// the write may still have committed server-side, so the next read
    /// must consult the store.
    pub fn invalidate_accounts(&self, operation: &LedgerOperation) {
        for key in operation.account_keys() {
            self.cache.invalidate(&key);
        }
    }

    fn failed(&self, op: &str, key: &AccountKey, err: StoreError) -> Outcome {
        self.cache.invalidate(key);
        tracing::error!(op, account = %key, error = %err, "ledger operation failed");
        Outcome::Failed(store_failure(err))
    }

    async fn journal(&self, player: u64, currency_id: &str, amount: i64, reason: &str) {
        let entry = JournalEntry {
            player,
            currency: currency_id.to_string(),
            amount,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        // The balance is already committed; a journal hiccup is logged, not
        // propagated back as a failure of the operation itself.
        if let Err(err) = self.store.record_entry(entry).await {
            tracing::warn!(player, currency = currency_id, error = %err, "failed to record journal entry");
        }
    }

    /// Run a store call, retrying transient failures with linear backoff.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut attempt_fn: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match attempt_fn().await {
                Err(StoreError::Transient(message)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(op, attempt, error = %message, "transient store failure, backing off");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                result => return result,
            }
        }
    }
}

fn store_failure(err: StoreError) -> FailureCause {
    FailureCause::Store(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    // In-memory store double with failure injection, mirroring the shape of
    // the SQL implementations.
    #[derive(Default)]
    struct InMemoryBalanceStore {
        accounts: StdMutex<HashMap<(u64, String), i64>>,
        journal: StdMutex<Vec<JournalEntry>>,
        transient_failures: AtomicU32,
        read_failures: AtomicU32,
        fatal: AtomicBool,
    }

    impl InMemoryBalanceStore {
        fn inject_transient(&self, count: u32) {
            self.transient_failures.store(count, Ordering::SeqCst);
        }

        fn inject_read_failure(&self, count: u32) {
            self.read_failures.store(count, Ordering::SeqCst);
        }

        fn inject_fatal(&self, on: bool) {
            self.fatal.store(on, Ordering::SeqCst);
        }

        fn take_failure(&self) -> Option<StoreError> {
            if self.fatal.load(Ordering::SeqCst) {
                return Some(StoreError::Fatal("injected fatal failure".to_string()));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Some(StoreError::Transient("injected timeout".to_string()));
            }
            None
        }
    }

    #[async_trait::async_trait]
    impl BalanceStore for InMemoryBalanceStore {
        async fn balance(&self, player: u64, currency: &Currency) -> Result<i64, StoreError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let read_failures = self.read_failures.load(Ordering::SeqCst);
            if read_failures > 0 {
                self.read_failures.store(read_failures - 1, Ordering::SeqCst);
                return Err(StoreError::Transient("injected read timeout".to_string()));
            }
            let accounts = self.accounts.lock().unwrap();
            Ok(*accounts
                .get(&(player, currency.id.clone()))
                .unwrap_or(&currency.starting_balance))
        }

        async fn create_account_if_absent(
            &self,
            player: u64,
            currency: &Currency,
        ) -> Result<i64, StoreError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let mut accounts = self.accounts.lock().unwrap();
            Ok(*accounts
                .entry((player, currency.id.clone()))
                .or_insert(currency.starting_balance))
        }

        async fn apply_delta(
            &self,
            player: u64,
            currency: &Currency,
            delta: i64,
            allow_negative: bool,
        ) -> Result<i64, StoreError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let mut accounts = self.accounts.lock().unwrap();
            let balance = accounts
                .entry((player, currency.id.clone()))
                .or_insert(currency.starting_balance);
            let updated = *balance + delta;
            if updated < 0 && !allow_negative {
                return Err(StoreError::InsufficientFunds);
            }
            *balance = updated;
            Ok(updated)
        }

        async fn set_balance(
            &self,
            player: u64,
            currency: &Currency,
            amount: i64,
        ) -> Result<i64, StoreError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let mut accounts = self.accounts.lock().unwrap();
            accounts.insert((player, currency.id.clone()), amount);
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
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let mut accounts = self.accounts.lock().unwrap();
            let from_balance = *accounts
                .get(&(from, currency.id.clone()))
                .unwrap_or(&currency.starting_balance);
            let updated_from = from_balance - amount;
            if updated_from < 0 && !allow_negative {
                return Err(StoreError::InsufficientFunds);
            }
            let to_balance = *accounts
                .get(&(to, currency.id.clone()))
                .unwrap_or(&currency.starting_balance);
            let updated_to = to_balance + amount;
            accounts.insert((from, currency.id.clone()), updated_from);
            accounts.insert((to, currency.id.clone()), updated_to);
            Ok((updated_from, updated_to))
        }

        async fn top_balances(
            &self,
            currency: &Currency,
            offset: u32,
            limit: u32,
        ) -> Result<Vec<LeaderboardEntry>, StoreError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let accounts = self.accounts.lock().unwrap();
            let mut entries: Vec<LeaderboardEntry> = accounts
                .iter()
                .filter(|((_, id), _)| *id == currency.id)
                .map(|((player, _), balance)| LeaderboardEntry {
                    player: *player,
                    balance: *balance,
                })
                .collect();
            entries.sort_by(|a, b| b.balance.cmp(&a.balance));
            Ok(entries
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }

        async fn record_entry(&self, entry: JournalEntry) -> Result<(), StoreError> {
            self.journal.lock().unwrap().push(entry);
            Ok(())
        }

        async fn recent_entries(
            &self,
            player: u64,
            currency: &Currency,
            limit: u32,
        ) -> Result<Vec<JournalEntry>, StoreError> {
            let journal = self.journal.lock().unwrap();
            Ok(journal
                .iter()
                .filter(|e| e.player == player && e.currency == currency.id)
                .rev()
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    fn registry() -> Arc<CurrencyRegistry> {
        let definitions = [
            Currency {
                id: "coin".to_string(),
                singular: "Coin".to_string(),
                plural: "Coins".to_string(),
                decimal_places: 0,
                starting_balance: 0,
                allow_overdraft: false,
            },
            Currency {
                id: "credit".to_string(),
                singular: "Credit".to_string(),
                plural: "Credits".to_string(),
                decimal_places: 2,
                starting_balance: 0,
                allow_overdraft: true,
            },
            Currency {
                id: "stone".to_string(),
                singular: "Stone".to_string(),
                plural: "Stones".to_string(),
                decimal_places: 0,
                starting_balance: 500,
                allow_overdraft: false,
            },
        ];
        Arc::new(CurrencyRegistry::from_definitions(definitions).unwrap())
    }

    fn service() -> LedgerService<InMemoryBalanceStore> {
        LedgerService::new(registry(), InMemoryBalanceStore::default())
    }

    fn fast_service(store: InMemoryBalanceStore) -> LedgerService<InMemoryBalanceStore> {
        let config = LedgerConfig {
            retry_backoff: Duration::from_millis(1),
            ..LedgerConfig::default()
        };
        LedgerService::with_config(registry(), store, config)
    }

    const A: u64 = 1;
    const B: u64 = 2;

    #[tokio::test]
    async fn test_deposit_then_withdraw_then_transfer_scenario() {
        let service = service();

        assert_eq!(
            service.deposit(A, "coin", 100, "quest").await,
            Outcome::Committed(100)
        );
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(100));

        assert_eq!(
            service.withdraw(A, "coin", 150, "shop").await,
            Outcome::Rejected(RejectReason::InsufficientFunds {
                requested: 150,
                available: Some(100)
            })
        );
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(100));

        assert_eq!(
            service.transfer(A, B, "coin", 60, "trade").await,
            Outcome::Committed(40)
        );
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(40));
        assert_eq!(service.balance(B, "coin").await, Outcome::Committed(60));
    }

    #[tokio::test]
    async fn test_validation_rejections_before_io() {
        let service = service();

        assert_eq!(
            service.deposit(A, "doubloon", 10, "").await,
            Outcome::Rejected(RejectReason::UnknownCurrency("doubloon".to_string()))
        );
        assert_eq!(
            service.deposit(A, "coin", 0, "").await,
            Outcome::Rejected(RejectReason::NonPositiveAmount(0))
        );
        assert_eq!(
            service.deposit(A, "coin", -3, "").await,
            Outcome::Rejected(RejectReason::NonPositiveAmount(-3))
        );
        assert_eq!(
            service.withdraw(A, "coin", -5, "").await,
            Outcome::Rejected(RejectReason::NonPositiveAmount(-5))
        );
        assert_eq!(
            service.transfer(A, A, "coin", 10, "").await,
            Outcome::Rejected(RejectReason::SelfTransfer)
        );
        // Nothing touched the store or journal.
        assert!(service.store.journal.lock().unwrap().is_empty());
        assert!(service.store.accounts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_deposits_no_lost_updates() {
        let service = Arc::new(service());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service.deposit(A, "coin", 1, "tick").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_committed());
        }
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(32));
    }

    #[tokio::test]
    async fn test_opposing_transfers_do_not_deadlock() {
        let service = Arc::new(service());
        service.deposit(A, "coin", 40, "seed").await;
        service.deposit(B, "coin", 60, "seed").await;

        let forward = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                for _ in 0..20 {
                    service.transfer(A, B, "coin", 10, "ping").await;
                }
            })
        };
        let backward = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                for _ in 0..20 {
                    service.transfer(B, A, "coin", 10, "pong").await;
                }
            })
        };

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            forward.await.unwrap();
            backward.await.unwrap();
        })
        .await;
        assert!(joined.is_ok(), "opposing transfers deadlocked");

        let a = service.balance(A, "coin").await.balance().unwrap();
        let b = service.balance(B, "coin").await.balance().unwrap();
        assert_eq!(a + b, 100, "transfers must conserve the total");
    }

    #[tokio::test]
    async fn test_failed_transfer_debit_never_credits() {
        let service = service();
        service.deposit(A, "coin", 30, "seed").await;

        let outcome = service.transfer(A, B, "coin", 50, "trade").await;
        assert!(matches!(
            outcome,
            Outcome::Rejected(RejectReason::InsufficientFunds { requested: 50, .. })
        ));
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(30));
        assert_eq!(service.balance(B, "coin").await, Outcome::Committed(0));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = InMemoryBalanceStore::default();
        store.inject_transient(1);
        let service = fast_service(store);

        assert_eq!(
            service.deposit(A, "coin", 25, "quest").await,
            Outcome::Committed(25)
        );
    }

    #[tokio::test]
    async fn test_transient_exhaustion_surfaces_as_failed() {
        let store = InMemoryBalanceStore::default();
        store.inject_transient(10);
        let service = fast_service(store);

        let outcome = service.deposit(A, "coin", 25, "quest").await;
        assert!(matches!(outcome, Outcome::Failed(FailureCause::Store(_))));
    }

    #[tokio::test]
    async fn test_fatal_failure_not_retried() {
        let store = InMemoryBalanceStore::default();
        store.inject_fatal(true);
        let service = fast_service(store);

        let outcome = service.withdraw(A, "coin", 5, "shop").await;
        assert!(matches!(outcome, Outcome::Failed(FailureCause::Store(_))));
        // A fatal error consumes no retry budget: transient counter untouched.
        assert_eq!(service.store.transient_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreadable_balance_reports_no_available_amount() {
        let store = InMemoryBalanceStore::default();
        store
            .accounts
            .lock()
            .unwrap()
            .insert((A, "coin".to_string()), 100);
        store.inject_read_failure(1);
        let service = fast_service(store);

        // The withdraw is rejected by the overdraft guard, and the follow-up
        // balance read fails too: the rejection must not invent an amount.
        assert_eq!(
            service.withdraw(A, "coin", 150, "shop").await,
            Outcome::Rejected(RejectReason::InsufficientFunds {
                requested: 150,
                available: None
            })
        );
    }

    #[tokio::test]
    async fn test_cache_invalidated_after_failed_mutation() {
        let service = service();
        service.deposit(A, "coin", 100, "seed").await;
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(100));

        service.store.inject_fatal(true);
        let outcome = service.withdraw(A, "coin", 10, "shop").await;
        assert!(matches!(outcome, Outcome::Failed(_)));

        // The failed mutation dropped the cached entry; the next read goes
        // back to the store and observes the pre-mutation value.
        service.store.inject_fatal(false);
        assert_eq!(service.balance(A, "coin").await, Outcome::Committed(100));
    }

    #[tokio::test]
    async fn test_overdraft_currency_allows_negative_balance() {
        let service = service();
        assert_eq!(
            service.withdraw(A, "credit", 75, "loan").await,
            Outcome::Committed(-75)
        );
        assert_eq!(service.balance(A, "credit").await, Outcome::Committed(-75));
    }

    #[tokio::test]
    async fn test_set_balance_upsert_and_policy() {
        let service = service();
        assert_eq!(
            service.set(A, "coin", 1000, "admin").await,
            Outcome::Committed(1000)
        );
        assert_eq!(
            service.set(A, "coin", 5, "admin").await,
            Outcome::Committed(5)
        );
        assert_eq!(
            service.set(A, "coin", -5, "admin").await,
            Outcome::Rejected(RejectReason::NegativeBalance)
        );
        // Overdraft currencies may be set negative.
        assert_eq!(
            service.set(A, "credit", -5, "admin").await,
            Outcome::Committed(-5)
        );
    }

    #[tokio::test]
    async fn test_starting_balance_seeds_new_accounts() {
        let service = service();
        // Reading never creates a row but still reports the default.
        assert_eq!(service.balance(A, "stone").await, Outcome::Committed(500));
        assert!(service.store.accounts.lock().unwrap().is_empty());

        assert_eq!(
            service.ensure_account(B, "stone").await,
            Outcome::Committed(500)
        );
        assert_eq!(
            service.deposit(B, "stone", 50, "quest").await,
            Outcome::Committed(550)
        );
    }

    #[tokio::test]
    async fn test_journal_records_committed_operations_only() {
        let service = service();
        service.deposit(A, "coin", 100, "quest").await;
        service.withdraw(A, "coin", 30, "shop").await;
        service.withdraw(A, "coin", 9999, "shop").await; // rejected

        let entries = service.history(A, "coin", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, -30); // newest first
        assert_eq!(entries[0].reason, "shop");
        assert_eq!(entries[1].amount, 100);
    }

    #[tokio::test]
    async fn test_transfer_journals_both_legs() {
        let service = service();
        service.deposit(A, "coin", 100, "seed").await;
        service.transfer(A, B, "coin", 60, "trade").await;

        let debit = service.history(A, "coin", 1).await.unwrap();
        assert_eq!(debit[0].amount, -60);
        let credit = service.history(B, "coin", 1).await.unwrap();
        assert_eq!(credit[0].amount, 60);
    }

    #[tokio::test]
    async fn test_leaderboard_pages() {
        let service = service();
        for player in 1..=15u64 {
            service
                .deposit(player, "coin", player as i64 * 10, "seed")
                .await;
        }
        let first = service.top("coin", 1).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].player, 15);
        assert_eq!(first[0].balance, 150);

        let second = service.top("coin", 2).await.unwrap();
        assert_eq!(second.len(), 5);

        assert_eq!(
            service.top("doubloon", 1).await.unwrap_err(),
            QueryError::UnknownCurrency("doubloon".to_string())
        );
    }

    #[tokio::test]
    async fn test_execute_dispatches_operations() {
        let service = service();
        let outcome = service
            .execute(LedgerOperation::Deposit {
                player: A,
                currency: "coin".to_string(),
                amount: 42,
                reason: "gateway".to_string(),
            })
            .await;
        assert_eq!(outcome, Outcome::Committed(42));

        let outcome = service
            .execute(LedgerOperation::Balance {
                player: A,
                currency: "coin".to_string(),
            })
            .await;
        assert_eq!(outcome, Outcome::Committed(42));
    }
}
