// Domain models shared across the ledger: account keys, operations,
// outcomes and the audit journal entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one account: a (player, currency) pair.
///
/// `Ord` gives every account a fixed global position, which the ledger uses
/// to acquire transfer locks in a canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey {
    pub player: u64,
    pub currency: String,
}

impl AccountKey {
    pub fn new(player: u64, currency: &str) -> Self {
        Self {
            player,
            currency: currency.to_string(),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.player, self.currency)
    }
}

/// A single ledger request, the unit of atomicity.
///
/// A transfer is one operation touching two accounts, never two independent
/// operations.
#[derive(Debug, Clone)]
pub enum LedgerOperation {
    Deposit {
        player: u64,
        currency: String,
        amount: i64,
        reason: String,
    },
    Withdraw {
        player: u64,
        currency: String,
        amount: i64,
        reason: String,
    },
    Set {
        player: u64,
        currency: String,
        amount: i64,
        reason: String,
    },
    Transfer {
        from: u64,
        to: u64,
        currency: String,
        amount: i64,
        reason: String,
    },
    Balance {
        player: u64,
        currency: String,
    },
}

impl LedgerOperation {
    /// The account key an operation is routed and serialized by. Transfers
    /// route by their canonical (smaller) key, matching the order the ledger
    /// acquires their locks in.
    pub fn routing_key(&self) -> AccountKey {
        match self {
            LedgerOperation::Deposit {
                player, currency, ..
            }
            | LedgerOperation::Withdraw {
                player, currency, ..
            }
            | LedgerOperation::Set {
                player, currency, ..
            }
            | LedgerOperation::Balance { player, currency } => {
                AccountKey::new(*player, currency)
            }
            LedgerOperation::Transfer {
                from, to, currency, ..
            } => {
                let from_key = AccountKey::new(*from, currency);
                let to_key = AccountKey::new(*to, currency);
                if from_key <= to_key {
                    from_key
                } else {
                    to_key
                }
            }
        }
    }

    /// Every account key the operation touches.
    pub fn account_keys(&self) -> Vec<AccountKey> {
        match self {
            LedgerOperation::Deposit {
                player, currency, ..
            }
            | LedgerOperation::Withdraw {
                player, currency, ..
            }
            | LedgerOperation::Set {
                player, currency, ..
            }
            | LedgerOperation::Balance { player, currency } => {
                vec![AccountKey::new(*player, currency)]
            }
            LedgerOperation::Transfer {
                from, to, currency, ..
            } => vec![
                AccountKey::new(*from, currency),
                AccountKey::new(*to, currency),
            ],
        }
    }
}

/// Why an operation was rejected before or by policy. These are normal,
/// expected outcomes - not infrastructure failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    #[error("negative balance not permitted for this currency")]
    NegativeBalance,

    #[error("cannot transfer to the same account")]
    SelfTransfer,

    /// `available` is `None` when the current balance could not be read
    /// back after the rejection; it is never fabricated.
    #[error("insufficient funds: requested {requested}")]
    InsufficientFunds {
        requested: i64,
        available: Option<i64>,
    },
}

/// Infrastructure failure, reported distinctly from `Rejected` so callers
/// can decide whether a retry makes sense.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureCause {
    #[error("store failure: {0}")]
    Store(String),

    #[error("operation timed out")]
    Timeout,

    #[error("execution gateway is shut down")]
    GatewayClosed,
}

/// The typed result of every ledger operation. Raw store errors never
/// escape to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The operation was applied; carries the resulting balance of the
    /// primary account (the debited account for transfers).
    Committed(i64),
    /// Validation or policy stopped the operation. No state changed.
    Rejected(RejectReason),
    /// Infrastructure failed. No partial state is visible.
    Failed(FailureCause),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }

    /// Resulting balance, if the operation committed.
    pub fn balance(&self) -> Option<i64> {
        match self {
            Outcome::Committed(balance) => Some(*balance),
            _ => None,
        }
    }
}

/// Error type for read-only query surfaces (leaderboard, history).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("unknown currency: {0}")]
    UnknownCurrency(String),

    #[error(transparent)]
    Failed(#[from] FailureCause),
}

/// One row of a currency leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub player: u64,
    pub balance: i64,
}

/// An audit-trail record for a committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub player: u64,
    pub currency: String,
    /// Signed amount in minor units; negative for debits.
    pub amount: i64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
