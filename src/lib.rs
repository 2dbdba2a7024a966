// Drachma - a virtual-currency ledger for game servers.
//
// **Architecture Overview:**
// - `core/` = Business logic (currencies, ledger, cache, async gateway)
// - `infra/` = Implementations of core traits (SQL-backed stores)
//
// The host (command layer, plugin bootstrap, config loading) is an external
// collaborator: it builds a `CurrencyRegistry` and a `StoreSettings` at
// startup, wires them into a `LedgerService`, and talks to the ledger either
// directly or through the `ExecutionGateway` so store I/O never blocks the
// game's simulation thread.

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with a pile of mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
pub mod core;
#[path = "infra/infra_layer.rs"]
pub mod infra;

pub use crate::core::currency::{Currency, CurrencyError, CurrencyRegistry};
pub use crate::core::ledger::{
    AccountKey, BalanceStore, ExecutionGateway, FailureCause, GatewayConfig, JournalEntry,
    LeaderboardEntry, LedgerConfig, LedgerOperation, LedgerService, Outcome, QueryError,
    RejectReason, StoreError, Ticket,
};
pub use crate::infra::store::{BackendStore, StoreBackend, StoreSettings};
