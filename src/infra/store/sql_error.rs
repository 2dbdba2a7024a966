// Maps sqlx errors onto the store's transient/fatal taxonomy.

use crate::core::ledger::StoreError;
use sqlx::error::ErrorKind;

/// Transient failures (worth a bounded retry with backoff): connection
/// resets, pool exhaustion, and deadlocks/serialization conflicts the
/// database detected itself. Everything else is fatal and surfaced
/// immediately.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(err.to_string())
        }
        sqlx::Error::Io(io) => StoreError::Transient(io.to_string()),
        sqlx::Error::Database(db) => {
            match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::Fatal(db.to_string()),
                _ => {
                    // 40001 = serialization_failure, 40P01 = deadlock_detected
                    // (PostgreSQL); SQLite reports lock contention as
                    // "database is locked".
                    let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                    if code == "40001" || code == "40P01" || db.message().contains("database is locked")
                    {
                        StoreError::Transient(db.to_string())
                    } else {
                        StoreError::Fatal(db.to_string())
                    }
                }
            }
        }
        other => StoreError::Fatal(other.to_string()),
    }
}
