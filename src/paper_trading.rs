//! Paper Trading - position lifecycle state machine
//!
//! `PENDING → OPEN → CLOSED` or `PENDING → CANCELLED`. Stops, targets and
//! trailing are evaluated on the underlying; the pricing model only decides
//! the premium recorded alongside.
//!
//! Per-tick exit order for an OPEN position:
//! 1. TIME_EXIT once local time reaches the cutoff
//! 2. SL (or TRAIL_STOP once trailing is active)
//! 3. TP
//! 4. trailing activation / ratchet
//! 5. MV_FLIP after N consecutive opposite views
//! 6. STALE after K consecutive stale snapshots (when enabled)
//!
//! State persistence: saves/loads the book to a JSON file for recovery on restart.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{AppConfig, EntryMode};
use crate::dedup::{DedupKey, DedupLedger};
use crate::eligibility::EligibilityResult;
use crate::pricing::PricingModel;
use crate::risk::RiskManager;
use crate::session::{is_past_cutoff, trading_date};
use crate::types::{LevelTag, MarketView, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Cancelled)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "PENDING"),
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closed => write!(f, "CLOSED"),
            PositionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Exit reason for a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "TRAIL_STOP")]
    TrailStop,
    #[serde(rename = "MV_FLIP")]
    MvFlip,
    #[serde(rename = "TIME_EXIT")]
    TimeExit,
    #[serde(rename = "CANCELLED_NOT_FILLED")]
    CancelledNotFilled,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "STALE")]
    Stale,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "SL"),
            ExitReason::TakeProfit => write!(f, "TP"),
            ExitReason::TrailStop => write!(f, "TRAIL_STOP"),
            ExitReason::MvFlip => write!(f, "MV_FLIP"),
            ExitReason::TimeExit => write!(f, "TIME_EXIT"),
            ExitReason::CancelledNotFilled => write!(f, "CANCELLED_NOT_FILLED"),
            ExitReason::Manual => write!(f, "MANUAL"),
            ExitReason::Stale => write!(f, "STALE"),
        }
    }
}

/// Lifecycle parameters for one symbol
#[derive(Debug, Clone)]
pub struct ExitParams {
    pub initial_sl_points: f64,
    pub target_rr: f64,
    pub trail_trigger_rr: f64,
    pub trail_lock_rr: f64,
    pub trail_offset_points: f64,
    pub mv_flip_confirm: u32,
    /// 0 disables STALE exits
    pub stale_exit_confirm: u32,
    pub time_exit: NaiveTime,
    pub entry_mode: EntryMode,
    pub pending_timeout: Duration,
    /// Fixed lots; 0 sizes from `max_exposure_per_trade`
    pub quantity: u32,
    pub point_value: f64,
    pub max_exposure_per_trade: f64,
}

impl ExitParams {
    pub fn from_config(cfg: &AppConfig, symbol: Symbol) -> Result<Self> {
        let Some(sc) = cfg.symbol(symbol) else {
            bail!("missing symbols.{} table", symbol.config_key());
        };
        Ok(Self {
            initial_sl_points: sc.initial_sl_points,
            target_rr: cfg.exits.target_rr,
            trail_trigger_rr: cfg.exits.trail_trigger_rr,
            trail_lock_rr: cfg.exits.trail_lock_rr,
            trail_offset_points: sc.trail_offset_points,
            mv_flip_confirm: cfg.exits.mv_flip_confirm.max(1),
            stale_exit_confirm: cfg.exits.stale_exit_confirm,
            time_exit: cfg.time_exit(),
            entry_mode: cfg.exits.entry_mode,
            pending_timeout: Duration::seconds(cfg.exits.pending_timeout_secs as i64),
            quantity: sc.quantity,
            point_value: sc.point_value,
            max_exposure_per_trade: cfg.risk.max_exposure_per_trade,
        })
    }

    /// Fixed quantity, else exposure budget / premium (at least 1)
    pub fn compute_qty(&self, premium: f64) -> u32 {
        if self.quantity > 0 {
            return self.quantity;
        }
        if !(premium > 0.0) {
            return 1;
        }
        ((self.max_exposure_per_trade / premium).floor() as u32).max(1)
    }
}

/// One paper trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub level_tag: LevelTag,
    pub dedup_key: DedupKey,
    /// Trigger level the signal fired on
    pub trigger: f64,
    pub created_at: DateTime<Utc>,
    pub status: PositionStatus,
    /// Underlying fill level
    pub entry_price: Option<f64>,
    /// Premium recorded by the pricing model at fill
    pub entry_premium: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    /// Initial risk in points
    pub risk_points: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trail_active: bool,
    pub trail_stop: Option<f64>,
    pub quantity: u32,
    pub point_value: f64,
    pub exit_price: Option<f64>,
    pub exit_premium: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_points: f64,
    pub pnl: f64,
    pub last_spot: Option<f64>,
    pub last_tick: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mv_flip_streak: u32,
    #[serde(default)]
    pub stale_streak: u32,
}

impl Position {
    /// Favourable excursion in points at `spot`
    pub fn excursion(&self, spot: f64) -> f64 {
        self.entry_price
            .map(|e| self.side.sign() * (spot - e))
            .unwrap_or(0.0)
    }

    pub fn unrealized_points(&self) -> Option<f64> {
        match (self.status, self.last_spot) {
            (PositionStatus::Open, Some(spot)) => Some(self.excursion(spot)),
            _ => None,
        }
    }

    fn fill(&mut self, price: f64, now: DateTime<Utc>, params: &ExitParams, pricing: &dyn PricingModel) {
        let sign = self.side.sign();
        let risk = params.initial_sl_points;
        let premium = pricing.entry_premium(self.side, price);
        self.status = PositionStatus::Open;
        self.entry_price = Some(price);
        self.entry_premium = Some(premium);
        self.entry_time = Some(now);
        self.risk_points = risk;
        self.stop_loss = price - sign * risk;
        self.take_profit = price + sign * risk * params.target_rr;
        self.quantity = params.compute_qty(premium);
        self.point_value = params.point_value;
        self.last_spot = Some(price);
    }

    fn close(
        &mut self,
        reason: ExitReason,
        exit_price: f64,
        now: DateTime<Utc>,
        pricing: &dyn PricingModel,
    ) {
        let entry = self.entry_price.unwrap_or(exit_price);
        self.status = PositionStatus::Closed;
        self.exit_reason = Some(reason);
        self.exit_price = Some(exit_price);
        self.exit_premium = Some(pricing.premium(self.side, entry, exit_price));
        self.exit_time = Some(now);
        self.pnl_points = self.side.sign() * (exit_price - entry);
        self.pnl = self.pnl_points * self.quantity as f64 * self.point_value;
    }

    fn cancel(&mut self, reason: ExitReason, now: DateTime<Utc>) {
        self.status = PositionStatus::Cancelled;
        self.exit_reason = Some(reason);
        self.exit_time = Some(now);
    }

    /// CE stops only rise, PE stops only fall
    fn tighten(&self, current: f64, candidate: f64) -> f64 {
        match self.side {
            Side::CE => current.max(candidate),
            Side::PE => current.min(candidate),
        }
    }

    fn crossed_down_through(&self, spot: f64, level: f64) -> bool {
        match self.side {
            Side::CE => spot <= level,
            Side::PE => spot >= level,
        }
    }

    fn crossed_up_through(&self, spot: f64, level: f64) -> bool {
        match self.side {
            Side::CE => spot >= level,
            Side::PE => spot <= level,
        }
    }

    /// Move the trailing stop; returns true if it changed
    fn update_trailing(&mut self, spot: f64, params: &ExitParams) -> bool {
        let Some(entry) = self.entry_price else {
            return false;
        };
        let sign = self.side.sign();
        let candidate = spot - sign * params.trail_offset_points;

        match self.trail_stop {
            Some(stop) if self.trail_active => {
                let next = self.tighten(stop, candidate);
                if next != stop {
                    self.trail_stop = Some(next);
                    return true;
                }
                false
            }
            _ => {
                if self.excursion(spot) < params.trail_trigger_rr * self.risk_points {
                    return false;
                }
                let lock = entry + sign * params.trail_lock_rr * self.risk_points;
                self.trail_active = true;
                self.trail_stop = Some(self.tighten(lock, candidate));
                true
            }
        }
    }
}

/// Input for one lifecycle tick
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub spot: f64,
    pub view: Option<MarketView>,
    /// Snapshot older than the freshness ceiling
    pub stale: bool,
    pub now: DateTime<Utc>,
}

/// Transition produced by a tick or entry
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Opened(Position),
    Filled(Position),
    Closed(Position),
    Cancelled(Position),
    TrailMoved(Position),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    NotEligible,
    Duplicate(DedupKey),
    Blocked(String),
    Entered(Position),
}

/// Serializable book state (for restart recovery)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperState {
    pub symbol: Symbol,
    pub date: Option<NaiveDate>,
    pub active: Vec<Position>,
    pub closed: Vec<Position>,
    pub dedup_keys: Vec<DedupKey>,
    pub saved_at: i64,
}

/// Per-symbol paper trader: dedup ledger + active/closed positions
pub struct PaperTrader {
    symbol: Symbol,
    params: ExitParams,
    pricing: Arc<dyn PricingModel>,
    ledger: DedupLedger,
    active: Vec<Position>,
    closed: Vec<Position>,
    date: Option<NaiveDate>,
    state_file: Option<PathBuf>,
}

impl PaperTrader {
    pub fn new(symbol: Symbol, params: ExitParams, pricing: Arc<dyn PricingModel>) -> Self {
        Self {
            symbol,
            params,
            pricing,
            ledger: DedupLedger::new(),
            active: Vec::new(),
            closed: Vec::new(),
            date: None,
            state_file: None,
        }
    }

    /// Set the state file path for persistence
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    pub fn params(&self) -> &ExitParams {
        &self.params
    }

    /// New parameters apply to positions opened from now on
    pub fn set_params(&mut self, params: ExitParams) {
        self.params = params;
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut DedupLedger {
        &mut self.ledger
    }

    pub fn active(&self) -> &[Position] {
        &self.active
    }

    /// Terminal positions of the current trading date
    pub fn closed_today(&self) -> &[Position] {
        &self.closed
    }

    /// Start a new trading date: dedup keys and the closed list reset
    pub fn roll_day(&mut self, date: NaiveDate) -> bool {
        if self.date == Some(date) {
            return false;
        }
        self.date = Some(date);
        self.ledger.roll(date);
        self.closed.clear();
        true
    }

    /// Dedup → single active position → risk gate → open → record key
    pub fn try_enter(
        &mut self,
        result: &EligibilityResult,
        risk: &RiskManager,
        now: DateTime<Utc>,
    ) -> EntryOutcome {
        let Some(trigger) = result.trigger.filter(|_| result.eligible) else {
            return EntryOutcome::NotEligible;
        };
        self.roll_day(trading_date(now));

        let key = DedupKey::new(self.symbol, trigger.side, trigger.tag, trading_date(now));
        if self.ledger.already_attempted(&key) {
            info!(symbol = %self.symbol, key = %key, "🔁 [PAPER] Duplicate entry blocked");
            return EntryOutcome::Duplicate(key);
        }
        if let Some(p) = self.active.first() {
            return EntryOutcome::Blocked(format!("{} {} already {}", p.side, p.level_tag, p.status));
        }
        if let Err(why) = risk.try_reserve_entry(now) {
            return EntryOutcome::Blocked(why);
        }

        let mut position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: self.symbol,
            side: trigger.side,
            level_tag: trigger.tag,
            dedup_key: key,
            trigger: trigger.price,
            created_at: now,
            status: PositionStatus::Pending,
            entry_price: None,
            entry_premium: None,
            entry_time: None,
            risk_points: self.params.initial_sl_points,
            stop_loss: 0.0,
            take_profit: 0.0,
            trail_active: false,
            trail_stop: None,
            quantity: 0,
            point_value: self.params.point_value,
            exit_price: None,
            exit_premium: None,
            exit_time: None,
            exit_reason: None,
            pnl_points: 0.0,
            pnl: 0.0,
            last_spot: Some(result.spot),
            last_tick: Some(now),
            mv_flip_streak: 0,
            stale_streak: 0,
        };
        if self.params.entry_mode == EntryMode::Immediate {
            position.fill(trigger.price, now, &self.params, self.pricing.as_ref());
        }

        self.ledger.record(key);
        info!(
            symbol = %self.symbol,
            side = %position.side,
            level = %position.level_tag,
            trigger = position.trigger,
            status = %position.status,
            sl = position.stop_loss,
            tp = position.take_profit,
            qty = position.quantity,
            "📈 [PAPER] Position created"
        );
        self.active.push(position.clone());
        EntryOutcome::Entered(position)
    }

    /// Advance every active position by one tick
    pub fn tick(&mut self, tick: &Tick, risk: &RiskManager) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        if !(tick.spot.is_finite() && tick.spot > 0.0) {
            return events;
        }

        let params = self.params.clone();
        let pricing = Arc::clone(&self.pricing);
        let mut still_active = Vec::with_capacity(self.active.len());

        for mut pos in std::mem::take(&mut self.active) {
            // Re-delivered or out-of-order ticks are no-ops
            if pos.last_tick.map_or(false, |t| tick.now <= t) {
                still_active.push(pos);
                continue;
            }
            pos.last_tick = Some(tick.now);
            pos.last_spot = Some(tick.spot);

            match pos.status {
                PositionStatus::Pending => {
                    Self::tick_pending(&mut pos, tick, &params, pricing.as_ref(), &mut events)
                }
                PositionStatus::Open => {
                    Self::tick_open(&mut pos, tick, &params, pricing.as_ref(), &mut events)
                }
                PositionStatus::Closed | PositionStatus::Cancelled => {}
            }

            if pos.status.is_terminal() {
                if pos.status == PositionStatus::Closed {
                    risk.record_close(
                        pos.pnl,
                        pos.exit_reason == Some(ExitReason::StopLoss),
                        tick.now,
                    );
                }
                self.closed.push(pos);
            } else {
                still_active.push(pos);
            }
        }

        self.active = still_active;
        events
    }

    fn tick_pending(
        pos: &mut Position,
        tick: &Tick,
        params: &ExitParams,
        pricing: &dyn PricingModel,
        events: &mut Vec<LifecycleEvent>,
    ) {
        if is_past_cutoff(tick.now, params.time_exit)
            || tick.now - pos.created_at >= params.pending_timeout
        {
            pos.cancel(ExitReason::CancelledNotFilled, tick.now);
            info!(symbol = %pos.symbol, side = %pos.side, "⌛ [PAPER] Pending entry cancelled, not filled");
            events.push(LifecycleEvent::Cancelled(pos.clone()));
            return;
        }
        // Fills when spot trades through the trigger in the entry direction
        if pos.crossed_down_through(tick.spot, pos.trigger) {
            pos.fill(pos.trigger, tick.now, params, pricing);
            info!(symbol = %pos.symbol, side = %pos.side, price = pos.trigger, "✅ [PAPER] Pending entry filled");
            events.push(LifecycleEvent::Filled(pos.clone()));
        }
    }

    fn tick_open(
        pos: &mut Position,
        tick: &Tick,
        params: &ExitParams,
        pricing: &dyn PricingModel,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let spot = tick.spot;

        let exit = if is_past_cutoff(tick.now, params.time_exit) {
            Some((ExitReason::TimeExit, spot))
        } else if let Some(stop) = pos.trail_stop.filter(|_| pos.trail_active) {
            pos.crossed_down_through(spot, stop)
                .then_some((ExitReason::TrailStop, stop))
        } else {
            pos.crossed_down_through(spot, pos.stop_loss)
                .then_some((ExitReason::StopLoss, pos.stop_loss))
        };

        let exit = exit.or_else(|| {
            pos.crossed_up_through(spot, pos.take_profit)
                .then_some((ExitReason::TakeProfit, pos.take_profit))
        });

        let exit = exit.or_else(|| {
            if pos.update_trailing(spot, params) {
                events.push(LifecycleEvent::TrailMoved(pos.clone()));
            }

            let opposite = tick.view.map_or(false, |v| v.favors(pos.side.opposite()));
            pos.mv_flip_streak = if opposite { pos.mv_flip_streak + 1 } else { 0 };
            if pos.mv_flip_streak >= params.mv_flip_confirm.max(1) {
                return Some((ExitReason::MvFlip, spot));
            }

            pos.stale_streak = if tick.stale { pos.stale_streak + 1 } else { 0 };
            if params.stale_exit_confirm > 0 && pos.stale_streak >= params.stale_exit_confirm {
                return Some((ExitReason::Stale, spot));
            }
            None
        });

        if let Some((reason, price)) = exit {
            pos.close(reason, price, tick.now, pricing);
            info!(
                symbol = %pos.symbol,
                side = %pos.side,
                reason = %reason,
                exit = price,
                pnl_points = pos.pnl_points,
                pnl = pos.pnl,
                "📉 [PAPER] Position closed"
            );
            events.push(LifecycleEvent::Closed(pos.clone()));
        }
    }

    /// Close (or cancel) everything at `spot`
    pub fn flatten(
        &mut self,
        spot: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
        risk: &RiskManager,
    ) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        for mut pos in std::mem::take(&mut self.active) {
            match pos.status {
                PositionStatus::Pending => {
                    pos.cancel(reason, now);
                    info!(symbol = %pos.symbol, side = %pos.side, reason = %reason, "✋ [PAPER] Pending entry cancelled");
                    events.push(LifecycleEvent::Cancelled(pos.clone()));
                }
                PositionStatus::Open => {
                    pos.close(reason, spot, now, self.pricing.as_ref());
                    risk.record_close(pos.pnl, false, now);
                    warn!(symbol = %pos.symbol, side = %pos.side, reason = %reason, pnl = pos.pnl, "✋ [PAPER] Position flattened");
                    events.push(LifecycleEvent::Closed(pos.clone()));
                }
                PositionStatus::Closed | PositionStatus::Cancelled => {}
            }
            self.closed.push(pos);
        }
        events
    }

    fn export_state(&self) -> PaperState {
        PaperState {
            symbol: self.symbol,
            date: self.date,
            active: self.active.clone(),
            closed: self.closed.clone(),
            dedup_keys: self.ledger.keys().copied().collect(),
            saved_at: Utc::now().timestamp_millis(),
        }
    }

    /// Save current state to JSON file
    pub fn save_state(&self) -> Result<()> {
        let Some(state_file) = &self.state_file else {
            return Ok(()); // No state file configured, skip saving
        };
        let json = serde_json::to_string_pretty(&self.export_state())?;
        fs::write(state_file, json)
            .with_context(|| format!("Failed to write {}", state_file.display()))?;
        Ok(())
    }

    /// Load state from JSON file. A book from another trading date is discarded.
    pub fn load_state(&mut self, today: NaiveDate) -> Result<()> {
        let Some(state_file) = self.state_file.clone() else {
            return Ok(());
        };
        self.roll_day(today);

        if !state_file.exists() {
            info!(path = %state_file.display(), "💾 [PAPER] No state file found, starting fresh");
            return Ok(());
        }

        let json = fs::read_to_string(&state_file)?;
        let state: PaperState = serde_json::from_str(&json)?;
        if state.symbol != self.symbol {
            bail!(
                "state file {} belongs to {}, not {}",
                state_file.display(),
                state.symbol,
                self.symbol
            );
        }
        if state.date != Some(today) {
            if !state.active.is_empty() {
                warn!(
                    symbol = %self.symbol,
                    dropped = state.active.len(),
                    "💾 [PAPER] Discarding positions from a previous trading day"
                );
            }
            return Ok(());
        }

        for key in &state.dedup_keys {
            self.ledger.record(*key);
        }
        self.active = state.active;
        self.closed = state.closed;
        info!(
            path = %state_file.display(),
            active = self.active.len(),
            closed = self.closed.len(),
            keys = self.ledger.len(),
            "💾 [PAPER] State loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::{CheckId, CheckResult, Trigger};
    use crate::levels::{RawLevels, ShiftedLevels};
    use crate::market_view::{ResolvedView, ViewSource};
    use crate::pricing::{SpotProxy, SyntheticOption};
    use crate::risk::{CircuitBreaker, RiskLimits};
    use crate::session::at_local;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        at_local(
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            NaiveTime::from_hms_opt(h, m, s).unwrap(),
        )
    }

    fn params() -> ExitParams {
        ExitParams {
            initial_sl_points: 15.0,
            target_rr: 2.0,
            trail_trigger_rr: 2.0,
            trail_lock_rr: 1.0,
            trail_offset_points: 10.0,
            mv_flip_confirm: 2,
            stale_exit_confirm: 0,
            time_exit: NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
            entry_mode: EntryMode::Immediate,
            pending_timeout: Duration::seconds(120),
            quantity: 1,
            point_value: 1.0,
            max_exposure_per_trade: 3000.0,
        }
    }

    fn risk() -> RiskManager {
        RiskManager::new(RiskLimits::default(), CircuitBreaker::new(3, 15, 20))
    }

    fn eligible(side: Side, tag: LevelTag, price: f64, spot: f64, now: DateTime<Utc>) -> EligibilityResult {
        EligibilityResult {
            symbol: Symbol::Nifty,
            spot,
            expiry: None,
            raw: RawLevels::default(),
            shifted: ShiftedLevels::default(),
            view: ResolvedView {
                view: MarketView::Bullish,
                source: ViewSource::Explicit,
            },
            pcr: None,
            max_pain: None,
            ce_oi_delta: None,
            pe_oi_delta: None,
            age_seconds: Some(1.0),
            source: String::new(),
            as_of: None,
            checks: vec![CheckResult {
                id: CheckId::C1,
                ok: true,
                reason: String::new(),
            }],
            eligible: true,
            trigger: Some(Trigger {
                side,
                tag,
                price,
                crossed: false,
                distance: (spot - price).abs(),
            }),
            evaluated_at: now,
        }
    }

    fn trader(p: ExitParams) -> PaperTrader {
        PaperTrader::new(Symbol::Nifty, p, Arc::new(SpotProxy))
    }

    fn tick(spot: f64, now: DateTime<Utc>) -> Tick {
        Tick {
            spot,
            view: None,
            stale: false,
            now,
        }
    }

    fn closed_reason(events: &[LifecycleEvent]) -> Option<ExitReason> {
        events.iter().find_map(|e| match e {
            LifecycleEvent::Closed(p) => p.exit_reason,
            _ => None,
        })
    }

    #[test]
    fn ce_entry_then_take_profit() {
        let rm = risk();
        let mut t = trader(params());
        let out = t.try_enter(&eligible(Side::CE, LevelTag::S1, 93.0, 100.0, at(10, 0, 0)), &rm, at(10, 0, 0));
        let EntryOutcome::Entered(pos) = out else {
            panic!("expected entry, got {:?}", out);
        };
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.entry_price, Some(93.0));
        assert_eq!(pos.stop_loss, 78.0);
        assert_eq!(pos.take_profit, 123.0);

        let events = t.tick(&tick(135.0, at(10, 1, 0)), &rm);
        assert_eq!(closed_reason(&events), Some(ExitReason::TakeProfit));
        let closed = &t.closed_today()[0];
        assert_eq!(closed.pnl_points, 30.0);
        assert_eq!(closed.exit_price, Some(123.0));
        assert!(t.active().is_empty());
        assert_eq!(rm.counters().pnl, 30.0);
        assert_eq!(rm.counters().trade_count, 1);
    }

    #[test]
    fn same_key_enters_once() {
        let rm = risk();
        let mut t = trader(params());
        let now = at(10, 0, 0);
        let sig = eligible(Side::CE, LevelTag::S1, 93.0, 100.0, now);
        assert!(matches!(t.try_enter(&sig, &rm, now), EntryOutcome::Entered(_)));
        // close it so the single-active rule is not what blocks the retry
        t.flatten(95.0, ExitReason::Manual, at(10, 0, 30), &rm);
        assert!(matches!(
            t.try_enter(&sig, &rm, at(10, 1, 0)),
            EntryOutcome::Duplicate(_)
        ));
        assert_eq!(t.closed_today().len(), 1);
        assert_eq!(rm.counters().trade_count, 1);
    }

    #[test]
    fn pe_stop_loss_fills_at_stop_and_feeds_breaker() {
        let rm = risk();
        let mut t = trader(params());
        let now = at(11, 0, 0);
        t.try_enter(&eligible(Side::PE, LevelTag::R1, 200.0, 201.0, now), &rm, now);
        assert_eq!(t.active()[0].stop_loss, 215.0);
        assert_eq!(t.active()[0].take_profit, 170.0);

        let events = t.tick(&tick(220.0, at(11, 0, 10)), &rm);
        assert_eq!(closed_reason(&events), Some(ExitReason::StopLoss));
        assert_eq!(t.closed_today()[0].pnl_points, -15.0);
        assert_eq!(rm.counters().sl_hits, 1);
    }

    #[test]
    fn trailing_activates_locks_and_only_tightens() {
        let rm = risk();
        let mut p = params();
        p.target_rr = 5.0;
        let mut t = trader(p);
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 100.0, 100.0, now), &rm, now);

        // +20 < 2R: not yet
        t.tick(&tick(120.0, at(10, 0, 10)), &rm);
        assert!(!t.active()[0].trail_active);

        // +30 = 2R: lock at entry + 1R = 115, candidate 130-10 = 120
        t.tick(&tick(130.0, at(10, 0, 20)), &rm);
        assert!(t.active()[0].trail_active);
        assert_eq!(t.active()[0].trail_stop, Some(120.0));

        let mut last = 120.0;
        for (i, spot) in [140.0, 135.0, 150.0, 141.0].into_iter().enumerate() {
            t.tick(&tick(spot, at(10, 1, i as u32)), &rm);
            let stop = t.active()[0].trail_stop.unwrap();
            assert!(stop >= last, "trail loosened: {} < {}", stop, last);
            last = stop;
        }
        assert_eq!(last, 140.0);

        let events = t.tick(&tick(139.0, at(10, 2, 0)), &rm);
        assert_eq!(closed_reason(&events), Some(ExitReason::TrailStop));
        assert_eq!(t.closed_today()[0].pnl_points, 40.0);
    }

    #[test]
    fn pe_trailing_stop_is_non_increasing() {
        let rm = risk();
        let mut p = params();
        p.target_rr = 5.0;
        let mut t = trader(p);
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::PE, LevelTag::R1, 200.0, 200.0, now), &rm, now);

        let mut stops = Vec::new();
        for (i, spot) in [175.0, 168.0, 172.0, 160.0].into_iter().enumerate() {
            t.tick(&tick(spot, at(10, 1, i as u32)), &rm);
            if let Some(s) = t.active().first().and_then(|p| p.trail_stop) {
                stops.push(s);
            }
        }
        assert!(stops.windows(2).all(|w| w[1] <= w[0]), "{:?}", stops);
        assert_eq!(stops.last(), Some(&170.0));
    }

    #[test]
    fn time_exit_takes_precedence() {
        let rm = risk();
        let mut t = trader(params());
        let now = at(15, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 100.0, 100.0, now), &rm, now);

        // price is through the stop, but the cutoff wins
        let events = t.tick(&tick(50.0, at(15, 15, 0)), &rm);
        assert_eq!(closed_reason(&events), Some(ExitReason::TimeExit));
        assert_eq!(t.closed_today()[0].exit_price, Some(50.0));
        assert_eq!(rm.counters().sl_hits, 0);
    }

    #[test]
    fn mv_flip_needs_consecutive_confirmation() {
        let rm = risk();
        let mut t = trader(params());
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 100.0, 100.0, now), &rm, now);

        let bearish = |spot, now| Tick {
            spot,
            view: Some(MarketView::Bearish),
            stale: false,
            now,
        };
        assert!(t.tick(&bearish(101.0, at(10, 0, 10)), &rm).is_empty());
        // a neutral tick resets the streak
        t.tick(&tick(101.0, at(10, 0, 20)), &rm);
        assert!(t.tick(&bearish(102.0, at(10, 0, 30)), &rm).is_empty());
        let events = t.tick(&bearish(103.0, at(10, 0, 40)), &rm);
        assert_eq!(closed_reason(&events), Some(ExitReason::MvFlip));
        assert_eq!(t.closed_today()[0].pnl_points, 3.0);
    }

    #[test]
    fn stale_exit_when_enabled() {
        let rm = risk();
        let mut p = params();
        p.stale_exit_confirm = 2;
        let mut t = trader(p);
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 100.0, 100.0, now), &rm, now);

        let stale = |now| Tick {
            spot: 101.0,
            view: None,
            stale: true,
            now,
        };
        assert!(t.tick(&stale(at(10, 0, 10)), &rm).is_empty());
        let events = t.tick(&stale(at(10, 0, 20)), &rm);
        assert_eq!(closed_reason(&events), Some(ExitReason::Stale));
    }

    #[test]
    fn pending_fills_on_cross_or_cancels_on_timeout() {
        let rm = risk();
        let mut p = params();
        p.entry_mode = EntryMode::Pending;
        let mut t = trader(p.clone());
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 93.0, 100.0, now), &rm, now);
        assert_eq!(t.active()[0].status, PositionStatus::Pending);

        t.tick(&tick(96.0, at(10, 0, 30)), &rm);
        assert_eq!(t.active()[0].status, PositionStatus::Pending);
        let events = t.tick(&tick(92.5, at(10, 1, 0)), &rm);
        assert!(matches!(events[0], LifecycleEvent::Filled(_)));
        assert_eq!(t.active()[0].entry_price, Some(93.0));

        let mut t = trader(p);
        t.try_enter(&eligible(Side::PE, LevelTag::R1, 120.0, 110.0, now), &rm, now);
        let events = t.tick(&tick(115.0, at(10, 2, 0)), &rm);
        assert!(matches!(events[0], LifecycleEvent::Cancelled(_)));
        assert_eq!(
            t.closed_today()[0].exit_reason,
            Some(ExitReason::CancelledNotFilled)
        );
    }

    #[test]
    fn flatten_cancels_pending_with_given_reason() {
        let rm = risk();
        let mut p = params();
        p.entry_mode = EntryMode::Pending;
        let mut t = trader(p);
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 93.0, 100.0, now), &rm, now);

        let events = t.flatten(98.0, ExitReason::Manual, at(10, 0, 30), &rm);
        assert!(matches!(events[0], LifecycleEvent::Cancelled(_)));
        assert!(t.active().is_empty());
        let p = &t.closed_today()[0];
        assert_eq!(p.status, PositionStatus::Cancelled);
        assert_eq!(p.exit_reason, Some(ExitReason::Manual));
        assert_eq!(rm.counters().pnl, 0.0);
    }

    #[test]
    fn redelivered_tick_is_noop() {
        let rm = risk();
        let mut t = trader(params());
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 100.0, 100.0, now), &rm, now);

        let bearish = Tick {
            spot: 101.0,
            view: Some(MarketView::Bearish),
            stale: false,
            now: at(10, 0, 10),
        };
        t.tick(&bearish, &rm);
        t.tick(&bearish, &rm);
        assert_eq!(t.active()[0].mv_flip_streak, 1);

        let close = tick(200.0, at(10, 0, 20));
        assert_eq!(t.tick(&close, &rm).len(), 1);
        assert!(t.tick(&close, &rm).is_empty());
        assert_eq!(t.closed_today().len(), 1);
    }

    #[test]
    fn synthetic_premium_recorded_and_qty_sized() {
        let rm = risk();
        let mut p = params();
        p.quantity = 0;
        let mut t = PaperTrader::new(
            Symbol::Nifty,
            p,
            Arc::new(SyntheticOption { k: 0.5, base: 100.0 }),
        );
        let now = at(10, 0, 0);
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 93.0, 100.0, now), &rm, now);
        assert_eq!(t.active()[0].entry_premium, Some(100.0));
        assert_eq!(t.active()[0].quantity, 30);

        t.tick(&tick(135.0, at(10, 1, 0)), &rm);
        let closed = &t.closed_today()[0];
        assert_eq!(closed.exit_premium, Some(115.0));
        assert_eq!(closed.pnl, 30.0 * 30.0);
    }

    #[test]
    fn state_round_trip_keeps_book_and_keys() {
        let dir = std::env::temp_dir().join(format!("ocbot_paper_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state_nifty.json");

        let rm = risk();
        let now = at(10, 0, 0);
        let mut t = trader(params()).with_state_file(path.clone());
        t.try_enter(&eligible(Side::CE, LevelTag::S1, 93.0, 100.0, now), &rm, now);
        t.save_state().unwrap();

        let mut restored = trader(params()).with_state_file(path.clone());
        restored.load_state(trading_date(now)).unwrap();
        assert_eq!(restored.active().len(), 1);
        assert_eq!(restored.ledger().len(), 1);

        let mut next_day = trader(params()).with_state_file(path);
        next_day
            .load_state(NaiveDate::from_ymd_opt(2024, 5, 3).unwrap())
            .unwrap();
        assert!(next_day.active().is_empty());
        assert!(next_day.ledger().is_empty());

        let _ = fs::remove_dir_all(dir);
    }
}
