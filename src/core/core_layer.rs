// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "currency/currency_registry.rs"]
pub mod currency;

#[path = "ledger/mod.rs"]
pub mod ledger;
