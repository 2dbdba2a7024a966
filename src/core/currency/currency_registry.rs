// Currency definitions and the process-wide currency registry.
//
// The registry is built once at startup from externally supplied definitions
// (the host's config layer deserializes them) and is read-only afterwards.
// Everything else in the crate refers to currencies by id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Longest accepted currency identifier.
pub const MAX_IDENTIFIER_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CurrencyError {
    #[error("currency '{0}' is already registered")]
    DuplicateCurrency(String),

    #[error("unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("invalid currency identifier: '{0}' (lowercase alphanumeric/underscore, max {MAX_IDENTIFIER_LEN} chars)")]
    InvalidIdentifier(String),
}

/// A named in-game currency.
///
/// Balances are carried as fixed-point integers in minor units everywhere in
/// the core; `decimal_places` only matters when formatting for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Currency {
    /// Unique string key, e.g. "coin". Used in storage and account keys.
    pub id: String,

    /// Display name for a single unit, e.g. "Coin".
    pub singular: String,

    /// Display name for several units, e.g. "Coins".
    pub plural: String,

    /// Fractional digits retained for presentation (0 = whole units only).
    #[serde(default)]
    pub decimal_places: u8,

    /// Balance in minor units that newly created accounts are seeded with.
    #[serde(default)]
    pub starting_balance: i64,

    /// When true, withdrawals and transfers may drive the balance negative.
    #[serde(default)]
    pub allow_overdraft: bool,
}

impl Currency {
    /// Pick the right display name for an amount in minor units.
    pub fn display_name(&self, amount: i64) -> &str {
        let unit = 10i64.pow(self.decimal_places as u32);
        if amount.abs() == unit {
            &self.singular
        } else {
            &self.plural
        }
    }

    /// Format an amount in minor units with this currency's decimal scale.
    pub fn format(&self, amount: i64) -> String {
        if self.decimal_places == 0 {
            return amount.to_string();
        }
        let scale = 10u64.pow(self.decimal_places as u32);
        let sign = if amount < 0 { "-" } else { "" };
        let magnitude = amount.unsigned_abs();
        format!(
            "{}{}.{:0width$}",
            sign,
            magnitude / scale,
            magnitude % scale,
            width = self.decimal_places as usize
        )
    }
}

fn valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Registry of all valid currencies. Immutable once built.
#[derive(Debug, Default)]
pub struct CurrencyRegistry {
    currencies: Vec<Currency>,
    index: HashMap<String, usize>,
}

impl CurrencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a full set of definitions in one go.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = Currency>,
    ) -> Result<Self, CurrencyError> {
        let mut registry = Self::new();
        for currency in definitions {
            registry.register(currency)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, currency: Currency) -> Result<(), CurrencyError> {
        if !valid_identifier(&currency.id) {
            return Err(CurrencyError::InvalidIdentifier(currency.id));
        }
        if self.index.contains_key(&currency.id) {
            return Err(CurrencyError::DuplicateCurrency(currency.id));
        }
        self.index
            .insert(currency.id.clone(), self.currencies.len());
        self.currencies.push(currency);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&Currency, CurrencyError> {
        self.index
            .get(id)
            .map(|&i| &self.currencies[i])
            .ok_or_else(|| CurrencyError::UnknownCurrency(id.to_string()))
    }

    /// All registered currencies, in registration order.
    pub fn list(&self) -> &[Currency] {
        &self.currencies
    }

    pub fn len(&self) -> usize {
        self.currencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty()
    }
}
