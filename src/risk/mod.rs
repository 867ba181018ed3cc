//! Risk Manager - daily caps, manual hold and the SL circuit breaker
//!
//! One instance is shared by every symbol engine; all mutation goes through
//! its methods so tests can build isolated instances.

mod circuit;

pub use circuit::{format_remaining, CircuitBreaker, CircuitState, CircuitStatus};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

use crate::config::AppConfig;

/// Daily entry limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLimits {
    pub max_trades_per_day: u32,
    /// Positive amount; entries stop once daily PnL ≤ -limit
    pub daily_loss_limit: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_trades_per_day: 6,
            daily_loss_limit: 6000.0,
        }
    }
}

impl RiskLimits {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_trades_per_day: cfg.risk.max_trades_per_day,
            daily_loss_limit: cfg.risk.daily_loss_limit,
        }
    }
}

/// Counters reset at each trading-date rollover
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyCounters {
    pub date: Option<NaiveDate>,
    pub trade_count: u32,
    pub pnl: f64,
    pub sl_hits: u32,
}

/// Serializable risk state (for restart recovery)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskState {
    pub counters: DailyCounters,
    pub hold: bool,
    pub circuit: CircuitState,
    pub saved_at: i64,
}

pub struct RiskManager {
    limits: RwLock<RiskLimits>,
    counters: RwLock<DailyCounters>,
    hold: RwLock<bool>,
    breaker: RwLock<CircuitBreaker>,
    state_file: Option<PathBuf>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, breaker: CircuitBreaker) -> Self {
        Self {
            limits: RwLock::new(limits),
            counters: RwLock::new(DailyCounters::default()),
            hold: RwLock::new(false),
            breaker: RwLock::new(breaker),
            state_file: None,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            RiskLimits::from_config(cfg),
            CircuitBreaker::new(
                cfg.circuit.sl_threshold,
                cfg.circuit.window_mins,
                cfg.circuit.pause_mins,
            ),
        )
    }

    /// Set the state file path for persistence
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    pub fn set_limits(&self, limits: RiskLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
    }

    pub fn limits(&self) -> RiskLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset daily counters when the trading date changes
    pub fn roll_day(&self, date: NaiveDate) -> bool {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if counters.date == Some(date) {
            return false;
        }
        if counters.date.is_some() {
            info!(
                date = %date,
                prev_trades = counters.trade_count,
                prev_pnl = counters.pnl,
                "🗓️ [RISK] New trading day, counters reset"
            );
        }
        *counters = DailyCounters {
            date: Some(date),
            ..Default::default()
        };
        true
    }

    /// Book a closed position. SL exits feed the circuit breaker.
    pub fn record_close(&self, pnl_value: f64, stop_loss_hit: bool, now: DateTime<Utc>) {
        {
            let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
            counters.pnl += pnl_value;
            if stop_loss_hit {
                counters.sl_hits += 1;
            }
        }
        if stop_loss_hit {
            self.breaker
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .record_sl_hit(now);
        }
    }

    pub fn set_hold(&self, on: bool) {
        let mut hold = self.hold.write().unwrap_or_else(PoisonError::into_inner);
        if *hold != on {
            warn!(hold = on, "✋ [RISK] Manual hold changed");
        }
        *hold = on;
    }

    pub fn is_held(&self) -> bool {
        *self.hold.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counters(&self) -> DailyCounters {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Why new entries are blocked right now, if they are
    pub fn entry_block(&self, now: DateTime<Utc>) -> Option<String> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        self.block_reason(&counters, now)
    }

    /// Check every entry limit and count the entry under one counters guard,
    /// so concurrent symbols cannot overshoot the daily cap
    pub fn try_reserve_entry(&self, now: DateTime<Utc>) -> Result<(), String> {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(why) = self.block_reason(&counters, now) {
            return Err(why);
        }
        counters.trade_count += 1;
        Ok(())
    }

    fn block_reason(&self, counters: &DailyCounters, now: DateTime<Utc>) -> Option<String> {
        if self.is_held() {
            return Some("HOLD".to_string());
        }
        let limits = self.limits();
        if counters.trade_count >= limits.max_trades_per_day {
            return Some(format!(
                "daily cap {}/{}",
                counters.trade_count, limits.max_trades_per_day
            ));
        }
        if counters.pnl <= -limits.daily_loss_limit {
            return Some(format!(
                "daily loss {:.2} ≤ -{:.2}",
                counters.pnl, limits.daily_loss_limit
            ));
        }
        self.breaker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .block_reason(now)
    }

    pub fn circuit_status(&self, now: DateTime<Utc>) -> CircuitStatus {
        self.breaker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status(now)
    }

    pub fn reset_circuit(&self) {
        self.breaker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        info!("🔄 [CIRCUIT] Manually reset");
    }

    fn export_state(&self) -> RiskState {
        RiskState {
            counters: self.counters(),
            hold: self.is_held(),
            circuit: self
                .breaker
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .export(),
            saved_at: Utc::now().timestamp_millis(),
        }
    }

    /// Save current state to JSON file
    pub fn save_state(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.export_state())?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load state from JSON file; counters only survive within the same trading date
    pub fn load_state(&self, today: NaiveDate) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        if !path.exists() {
            info!(path = %path.display(), "💾 [RISK] No state file found, starting fresh");
            return Ok(());
        }

        let json = fs::read_to_string(path)?;
        let state: RiskState = serde_json::from_str(&json)?;

        if state.counters.date == Some(today) {
            *self.counters.write().unwrap_or_else(PoisonError::into_inner) =
                state.counters.clone();
        } else {
            self.roll_day(today);
        }
        self.set_hold(state.hold);
        self.breaker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .import(&state.circuit);

        info!(
            path = %path.display(),
            trades = state.counters.trade_count,
            pnl = state.counters.pnl,
            hold = state.hold,
            "💾 [RISK] State loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn manager() -> RiskManager {
        RiskManager::new(RiskLimits::default(), CircuitBreaker::new(3, 15, 20))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 5, 0, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn daily_trade_cap_blocks_entries() {
        let rm = RiskManager::new(
            RiskLimits {
                max_trades_per_day: 2,
                daily_loss_limit: 1000.0,
            },
            CircuitBreaker::new(3, 15, 20),
        );
        rm.roll_day(day(2));
        rm.try_reserve_entry(t0()).unwrap();
        assert_eq!(rm.entry_block(t0()), None);
        rm.try_reserve_entry(t0()).unwrap();
        assert_eq!(rm.entry_block(t0()).unwrap(), "daily cap 2/2");
        assert_eq!(rm.try_reserve_entry(t0()).unwrap_err(), "daily cap 2/2");
        assert_eq!(rm.counters().trade_count, 2);

        rm.roll_day(day(3));
        assert_eq!(rm.entry_block(t0()), None);
    }

    #[test]
    fn concurrent_reservations_respect_daily_cap() {
        use std::sync::Barrier;

        for _ in 0..200 {
            let rm = RiskManager::new(
                RiskLimits {
                    max_trades_per_day: 1,
                    daily_loss_limit: 1000.0,
                },
                CircuitBreaker::new(3, 15, 20),
            );
            rm.roll_day(day(2));
            let barrier = Barrier::new(3);

            let granted = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            rm.try_reserve_entry(t0()).is_ok()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(false))
                    .filter(|&ok| ok)
                    .count()
            });

            assert_eq!(granted, 1);
            assert_eq!(rm.counters().trade_count, 1);
        }
    }

    #[test]
    fn daily_loss_limit_blocks_entries() {
        let rm = manager();
        rm.roll_day(day(2));
        rm.record_close(-5999.0, false, t0());
        assert!(rm.entry_block(t0()).is_none());
        rm.record_close(-1.0, false, t0());
        assert!(rm.entry_block(t0()).unwrap().starts_with("daily loss"));
    }

    #[test]
    fn sl_exits_trip_breaker_and_pause_expires() {
        let rm = manager();
        rm.roll_day(day(2));
        for i in 0..3 {
            rm.record_close(-20.0, true, t0() + Duration::minutes(i * 4));
        }
        let later = t0() + Duration::minutes(9);
        assert!(rm.entry_block(later).unwrap().starts_with("circuit pause"));
        assert!(rm.circuit_status(later).paused);

        assert!(rm.entry_block(t0() + Duration::minutes(29)).is_none());
    }

    #[test]
    fn non_sl_losses_do_not_count_toward_breaker() {
        let rm = manager();
        for _ in 0..5 {
            rm.record_close(-10.0, false, t0());
        }
        assert!(!rm.circuit_status(t0()).paused);
    }

    #[test]
    fn hold_and_reset() {
        let rm = manager();
        rm.set_hold(true);
        assert_eq!(rm.entry_block(t0()).unwrap(), "HOLD");
        rm.set_hold(false);

        for _ in 0..3 {
            rm.record_close(-1.0, true, t0());
        }
        assert!(rm.entry_block(t0()).is_some());
        rm.reset_circuit();
        assert!(rm.entry_block(t0()).is_none());
    }

    #[test]
    fn state_file_restores_same_day_counters_only() {
        let dir = std::env::temp_dir().join(format!("ocbot_risk_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("risk_state.json");

        let rm = manager().with_state_file(path.clone());
        rm.roll_day(day(2));
        rm.try_reserve_entry(t0()).unwrap();
        rm.record_close(-50.0, true, t0());
        rm.set_hold(true);
        rm.save_state().unwrap();

        let same_day = manager().with_state_file(path.clone());
        same_day.load_state(day(2)).unwrap();
        assert_eq!(same_day.counters().trade_count, 1);
        assert_eq!(same_day.counters().pnl, -50.0);
        assert!(same_day.is_held());

        let next_day = manager().with_state_file(path);
        next_day.load_state(day(3)).unwrap();
        assert_eq!(next_day.counters().trade_count, 0);
        assert_eq!(next_day.counters().date, Some(day(3)));

        let _ = fs::remove_dir_all(dir);
    }
}
