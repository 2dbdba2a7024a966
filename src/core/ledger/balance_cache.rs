// Write-through balance cache.
//
// Maps (player, currency) -> balance with a maximum entry count and an
// expire-after-access window. Eviction simply drops entries: the store is
// updated synchronously with the cache on every mutation, so nothing here
// ever needs flushing. Only `LedgerService` writes to this cache, and only
// after a store commit whose result is known.

use crate::core::ledger::ledger_models::AccountKey;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    balance: i64,
    touched: Instant,
}

pub struct BalanceCache {
    entries: DashMap<AccountKey, CacheEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl BalanceCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Cached balance for the key, or `None` on a miss (expired entries
    /// count as misses and are dropped). A hit refreshes the access time.
    pub fn get(&self, key: &AccountKey) -> Option<i64> {
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.touched.elapsed() <= self.ttl {
                    entry.touched = Instant::now();
                    return Some(entry.balance);
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Unconditionally record a freshly committed balance.
    pub fn put(&self, key: &AccountKey, balance: i64) {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                balance,
                touched: Instant::now(),
            },
        );
        if self.entries.len() > self.max_entries {
            self.evict();
        }
    }

    /// Drop a key immediately, e.g. after a failed mutation.
    pub fn invalidate(&self, key: &AccountKey) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries, then least-recently-touched ones until we are
    /// back under capacity. Keys are collected first so we never remove while
    /// iterating the map's shards.
    fn evict(&self) {
        let mut candidates: Vec<(AccountKey, Instant)> = Vec::new();
        let mut stale: Vec<AccountKey> = Vec::new();
        for entry in self.entries.iter() {
            if entry.touched.elapsed() > self.ttl {
                stale.push(entry.key().clone());
            } else {
                candidates.push((entry.key().clone(), entry.touched));
            }
        }
        for key in stale {
            self.entries.remove(&key);
        }
        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess > 0 {
            candidates.sort_by_key(|(_, touched)| *touched);
            for (key, _) in candidates.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
    }
}
