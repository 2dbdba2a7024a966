// Ledger module - the account ledger and its storage/caching engine.
//
// This is the consistency boundary of the whole crate: every balance
// mutation funnels through `LedgerService`, which serializes work per
// account, applies it to the backing store and keeps the write-through
// cache coherent.

mod balance_cache;
mod balance_store;
mod gateway;
mod leaderboard;
mod ledger_models;
mod ledger_service;

pub use balance_cache::BalanceCache;
pub use balance_store::{BalanceStore, StoreError};
pub use gateway::{ExecutionGateway, GatewayConfig, Ticket};
pub use leaderboard::{Leaderboard, ENTRIES_PER_PAGE, MAX_PAGE};
pub use ledger_models::{
    AccountKey, FailureCause, JournalEntry, LeaderboardEntry, LedgerOperation, Outcome,
    QueryError, RejectReason,
};
pub use ledger_service::{LedgerConfig, LedgerService};
