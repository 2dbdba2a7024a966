// Cached per-currency leaderboards.
//
// Top balances change constantly under load, so the full board (up to
// MAX_PAGE pages) is fetched from the store at most once per TTL window and
// paged out of memory in between.

use crate::core::ledger::ledger_models::LeaderboardEntry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

pub const MAX_PAGE: u32 = 10;
pub const ENTRIES_PER_PAGE: u32 = 10;

struct Board {
    fetched: Instant,
    entries: Vec<LeaderboardEntry>,
}

pub struct Leaderboard {
    boards: DashMap<String, Board>,
    ttl: Duration,
}

impl Leaderboard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            boards: DashMap::new(),
            ttl,
        }
    }

    /// Total entries a full board holds.
    pub fn capacity() -> u32 {
        MAX_PAGE * ENTRIES_PER_PAGE
    }

    /// Clamp a 1-based page number into the valid range.
    pub fn clamp_page(page: u32) -> u32 {
        page.clamp(1, MAX_PAGE)
    }

    /// One page of a cached board, or `None` if the board is absent or
    /// stale and needs a store refresh.
    pub fn page(&self, currency_id: &str, page: u32) -> Option<Vec<LeaderboardEntry>> {
        let board = self.boards.get(currency_id)?;
        if board.fetched.elapsed() > self.ttl {
            return None;
        }
        Some(Self::slice(&board.entries, page))
    }

    /// Replace a currency's board with freshly fetched entries and return
    /// the requested page.
    pub fn refresh(
        &self,
        currency_id: &str,
        entries: Vec<LeaderboardEntry>,
        page: u32,
    ) -> Vec<LeaderboardEntry> {
        let result = Self::slice(&entries, page);
        self.boards.insert(
            currency_id.to_string(),
            Board {
                fetched: Instant::now(),
                entries,
            },
        );
        result
    }

    fn slice(entries: &[LeaderboardEntry], page: u32) -> Vec<LeaderboardEntry> {
        let page = Self::clamp_page(page);
        let start = ((page - 1) * ENTRIES_PER_PAGE) as usize;
        entries
            .iter()
            .skip(start)
            .take(ENTRIES_PER_PAGE as usize)
            .cloned()
            .collect()
    }
}
