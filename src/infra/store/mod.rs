// Store infrastructure - SQL-backed implementations of `BalanceStore`.

mod postgres_balance_store;
mod sql_error;
mod sqlite_balance_store;
mod store_factory;

pub use postgres_balance_store::PostgresBalanceStore;
pub use sqlite_balance_store::SqliteBalanceStore;
pub use store_factory::{BackendStore, StoreBackend, StoreSettings};
