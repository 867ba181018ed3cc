//! Dedup ledger: at most one entry per (symbol, side, level, trading date)
//!
//! Keys are mirrored to the Trades tab (`dedup_key` column) and the state
//! file, and reloaded on startup so a mid-session restart cannot re-enter a
//! level that was already traded.

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

use crate::persistence::{cell, Tab, TabStore};
use crate::types::{LevelTag, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub symbol: Symbol,
    pub side: Side,
    pub level_tag: LevelTag,
    pub date: NaiveDate,
}

impl DedupKey {
    pub fn new(symbol: Symbol, side: Side, level_tag: LevelTag, date: NaiveDate) -> Self {
        Self {
            symbol,
            side,
            level_tag,
            date,
        }
    }

    /// Parse the `date|SYMBOL|SIDE|TAG` form written by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('|');
        let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
        let symbol = Symbol::from_str(parts.next()?)?;
        let side = Side::from_str(parts.next()?)?;
        let level_tag = LevelTag::from_str(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(symbol, side, level_tag, date))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.date.format("%Y-%m-%d"),
            self.symbol,
            self.side,
            self.level_tag
        )
    }
}

/// Keys for the current trading date
#[derive(Debug, Clone, Default)]
pub struct DedupLedger {
    date: Option<NaiveDate>,
    keys: BTreeSet<DedupKey>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `date`; keys from any other date are dropped
    pub fn roll(&mut self, date: NaiveDate) -> bool {
        if self.date == Some(date) {
            return false;
        }
        let dropped = self.keys.len();
        self.keys.retain(|k| k.date == date);
        self.date = Some(date);
        if dropped > self.keys.len() {
            info!(date = %date, dropped = dropped - self.keys.len(), "🗓️ [DEDUP] Day rollover");
        }
        true
    }

    pub fn already_attempted(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    /// Record a key; returns false if it was already present
    pub fn record(&mut self, key: DedupKey) -> bool {
        if self.date.map_or(true, |d| d < key.date) {
            self.roll(key.date);
        }
        self.keys.insert(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DedupKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Reload today's keys for `symbol` from the Trades tab
    pub async fn load_from_store(
        &mut self,
        store: &dyn TabStore,
        symbol: Symbol,
        date: NaiveDate,
    ) -> Result<usize> {
        self.roll(date);
        let mut loaded = 0;
        for row in store.read_all(Tab::Trades).await? {
            let Some(key) = cell(&row, "dedup_key").and_then(DedupKey::parse) else {
                continue;
            };
            if key.symbol == symbol && key.date == date && self.keys.insert(key) {
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!(symbol = %symbol, loaded, "🗓️ [DEDUP] Restored keys from Trades");
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{row, MemoryTabStore};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn key_round_trips_through_text() {
        let key = DedupKey::new(Symbol::BankNifty, Side::PE, LevelTag::R2, day(2));
        assert_eq!(key.to_string(), "2024-05-02|BANKNIFTY|PE|R2*");
        assert_eq!(DedupKey::parse(&key.to_string()), Some(key));
        assert_eq!(DedupKey::parse("2024-05-02|NIFTY|CE"), None);
    }

    #[test]
    fn record_is_idempotent_per_day() {
        let mut ledger = DedupLedger::new();
        let key = DedupKey::new(Symbol::Nifty, Side::CE, LevelTag::S1, day(2));
        assert!(!ledger.already_attempted(&key));
        assert!(ledger.record(key));
        assert!(!ledger.record(key));
        assert!(ledger.already_attempted(&key));

        // same level on another side or tag is a different key
        let other = DedupKey::new(Symbol::Nifty, Side::CE, LevelTag::S2, day(2));
        assert!(!ledger.already_attempted(&other));
    }

    #[test]
    fn rollover_clears_previous_day() {
        let mut ledger = DedupLedger::new();
        ledger.record(DedupKey::new(Symbol::Nifty, Side::CE, LevelTag::S1, day(2)));
        assert!(ledger.roll(day(3)));
        assert!(ledger.is_empty());
        assert!(!ledger.roll(day(3)));
    }

    #[tokio::test]
    async fn reloads_todays_keys_for_symbol() {
        let store = MemoryTabStore::new();
        for key in [
            "2024-05-02|NIFTY|CE|S1*",
            "2024-05-01|NIFTY|PE|R1*",
            "2024-05-02|FINNIFTY|PE|R1*",
            "garbage",
        ] {
            store
                .append_row(Tab::Trades, row([("dedup_key", key)]))
                .await
                .unwrap();
        }

        let mut ledger = DedupLedger::new();
        let n = ledger
            .load_from_store(&store, Symbol::Nifty, day(2))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(ledger.already_attempted(&DedupKey::new(
            Symbol::Nifty,
            Side::CE,
            LevelTag::S1,
            day(2)
        )));
    }
}
