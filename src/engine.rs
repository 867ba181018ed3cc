//! Engine - per-symbol evaluate → enter → tick loop
//!
//! Each symbol's state sits behind its own async mutex so evaluation and
//! position ticks for one symbol never interleave, while symbols run
//! independently. The lifecycle state in memory is authoritative; the tab
//! store is a best-effort mirror.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{apply_overrides, AppConfig};
use crate::eligibility::{evaluate, EligibilityResult, GateParams};
use crate::events::EventCalendar;
use crate::paper_trading::{
    EntryOutcome, ExitParams, ExitReason, LifecycleEvent, PaperTrader, Position, Tick,
};
use crate::performance::DailyPerformance;
use crate::persistence::{row, Row, Tab, TabStore};
use crate::pricing;
use crate::provider::{SnapshotCache, SnapshotProvider};
use crate::risk::{RiskLimits, RiskManager};
use crate::session::{is_market_open, is_past_cutoff, local, trading_date};
use crate::types::{Snapshot, Symbol};

/// What one step did
#[derive(Debug, Default)]
pub struct StepReport {
    pub evaluation: Option<EligibilityResult>,
    pub entry: Option<EntryOutcome>,
    pub events: Vec<LifecycleEvent>,
}

struct SymbolState {
    trader: PaperTrader,
    last_eval: Option<EligibilityResult>,
    last_spot: Option<f64>,
}

pub struct Engine {
    base_config: AppConfig,
    config: RwLock<AppConfig>,
    symbols: BTreeMap<Symbol, Mutex<SymbolState>>,
    risk: RiskManager,
    calendar: EventCalendar,
    store: Arc<dyn TabStore>,
    cache: SnapshotCache,
    last_override_hold: std::sync::Mutex<Option<bool>>,
    perf_written: Mutex<Option<NaiveDate>>,
}

fn ts(now: DateTime<Utc>) -> String {
    local(now).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn opt_ts(t: Option<DateTime<Utc>>) -> String {
    t.map(ts).unwrap_or_default()
}

fn opt_num(v: Option<f64>) -> String {
    v.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

/// Trades tab row for one lifecycle transition
pub fn trade_row(event: &str, p: &Position, now: DateTime<Utc>) -> Row {
    row([
        ("ts", ts(now)),
        ("date", p.dedup_key.date.format("%Y-%m-%d").to_string()),
        ("event", event.to_string()),
        ("id", p.id.clone()),
        ("symbol", p.symbol.to_string()),
        ("side", p.side.to_string()),
        ("level_tag", p.level_tag.to_string()),
        ("dedup_key", p.dedup_key.to_string()),
        ("status", p.status.to_string()),
        ("trigger", format!("{:.2}", p.trigger)),
        ("entry_time", opt_ts(p.entry_time)),
        ("entry_spot", opt_num(p.entry_price)),
        ("entry_price", opt_num(p.entry_premium)),
        ("stop_loss", opt_num(p.entry_price.map(|_| p.stop_loss))),
        ("take_profit", opt_num(p.entry_price.map(|_| p.take_profit))),
        ("trail_stop", opt_num(p.trail_stop)),
        ("quantity", p.quantity.to_string()),
        ("exit_time", opt_ts(p.exit_time)),
        ("exit_spot", opt_num(p.exit_price)),
        ("exit_price", opt_num(p.exit_premium)),
        (
            "exit_reason",
            p.exit_reason.map(|r| r.to_string()).unwrap_or_default(),
        ),
        ("pnl_points", format!("{:.2}", p.pnl_points)),
        ("pnl_value", format!("{:.2}", p.pnl)),
    ])
}

/// Signals tab row: every evaluation with all six outcomes
pub fn signal_row(r: &EligibilityResult) -> Row {
    let mut out = row([
        ("ts", ts(r.evaluated_at)),
        ("symbol", r.symbol.to_string()),
        ("spot", format!("{:.2}", r.spot)),
        ("side", r.side().map(|s| s.to_string()).unwrap_or_default()),
        (
            "level_tag",
            r.level_tag().map(|t| t.to_string()).unwrap_or_default(),
        ),
        ("trigger", opt_num(r.trigger_price())),
        ("view", format!("{} ({})", r.view.view, r.view.source)),
        ("eligible", r.eligible.to_string()),
        (
            "failed",
            r.failed()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(","),
        ),
    ]);
    for c in &r.checks {
        out.insert(
            c.id.to_string().to_lowercase(),
            format!("{} {}", if c.ok { "✅" } else { "❌" }, c.reason),
        );
    }
    out
}

impl Engine {
    pub fn new(
        cfg: AppConfig,
        store: Arc<dyn TabStore>,
        provider: Arc<dyn SnapshotProvider>,
        state_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let pricing = pricing::from_config(&cfg);
        let mut symbols = BTreeMap::new();
        for symbol in cfg.enabled_symbols()? {
            let params = ExitParams::from_config(&cfg, symbol)?;
            let mut trader = PaperTrader::new(symbol, params, Arc::clone(&pricing));
            if let Some(dir) = &state_dir {
                trader = trader.with_state_file(
                    dir.join(format!("state_{}.json", symbol.config_key())),
                );
            }
            symbols.insert(
                symbol,
                Mutex::new(SymbolState {
                    trader,
                    last_eval: None,
                    last_spot: None,
                }),
            );
        }

        let mut risk = RiskManager::from_config(&cfg);
        if let Some(dir) = &state_dir {
            risk = risk.with_state_file(dir.join("risk_state.json"));
        }

        info!(pricing = pricing.name(), symbols = symbols.len(), "⚙️ [ENGINE] Built");
        Ok(Self {
            base_config: cfg.clone(),
            config: RwLock::new(cfg),
            symbols,
            risk,
            calendar: EventCalendar::new(),
            store,
            cache: SnapshotCache::new(provider),
            last_override_hold: std::sync::Mutex::new(None),
            perf_written: Mutex::new(None),
        })
    }

    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.keys().copied().collect()
    }

    /// Restore state files, dedup keys, calendar and overrides
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<()> {
        let today = trading_date(now);
        if let Err(e) = self.risk.load_state(today) {
            warn!(error = %e, "💾 [RISK] State file unreadable, starting fresh");
        }
        self.risk.roll_day(today);

        for (symbol, state) in &self.symbols {
            let mut st = state.lock().await;
            if let Err(e) = st.trader.load_state(today) {
                warn!(symbol = %symbol, error = %e, "💾 [PAPER] State file unreadable, starting fresh");
            }
            st.last_spot = st.trader.active().iter().find_map(|p| p.last_spot);
            let ledger = st.trader.ledger_mut();
            if let Err(e) = ledger.load_from_store(self.store.as_ref(), *symbol, today).await {
                warn!(symbol = %symbol, error = %e, "🗓️ [DEDUP] Could not reload keys from Trades");
            }
        }

        self.refresh_tabs().await;
        Ok(())
    }

    /// Reload the event calendar and re-apply Params_Override over the base config
    pub async fn refresh_tabs(&self) {
        if let Err(e) = self.calendar.refresh(self.store.as_ref()).await {
            warn!(error = %e, "📅 [EVENTS] Calendar refresh failed");
        }

        let rows = match self.store.read_all(Tab::ParamsOverride).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "⚙️ [CONFIG] Params_Override unreadable");
                return;
            }
        };

        let mut cfg = self.base_config.clone();
        let outcome = apply_overrides(&mut cfg, &rows);
        if let Err(e) = cfg.validate() {
            warn!(error = %e, "⚙️ [CONFIG] Overrides rejected, keeping current config");
            return;
        }

        self.risk.set_limits(RiskLimits::from_config(&cfg));
        {
            let mut last = self
                .last_override_hold
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if outcome.hold.is_some() && outcome.hold != *last {
                if let Some(hold) = outcome.hold {
                    self.risk.set_hold(hold);
                }
            }
            *last = outcome.hold;
        }
        for (symbol, state) in &self.symbols {
            match ExitParams::from_config(&cfg, *symbol) {
                Ok(params) => state.lock().await.trader.set_params(params),
                Err(e) => warn!(symbol = %symbol, error = %e, "⚙️ [CONFIG] Exit params unchanged"),
            }
        }
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = cfg;
    }

    /// C5 verdict from session, risk and calendar
    fn operational_block(&self, cfg: &AppConfig, symbol: Symbol, now: DateTime<Utc>) -> Option<String> {
        if !is_market_open(now) {
            return Some("market closed".to_string());
        }
        if is_past_cutoff(now, cfg.time_exit()) {
            return Some(format!("past time exit {}", cfg.exits.time_exit));
        }
        self.risk
            .entry_block(now)
            .or_else(|| self.calendar.block_reason(symbol, now))
    }

    async fn mirror(&self, tab: Tab, r: Row) {
        if let Err(e) = self.store.append_row(tab, r).await {
            warn!(tab = %tab, error = %e, "🗄️ [STORE] Append failed");
        }
    }

    async fn mirror_events(&self, events: &[LifecycleEvent], now: DateTime<Utc>) {
        for ev in events {
            let (label, p) = match ev {
                LifecycleEvent::Opened(p) => ("OPEN", p),
                LifecycleEvent::Filled(p) => ("FILL", p),
                LifecycleEvent::Closed(p) => ("CLOSE", p),
                LifecycleEvent::Cancelled(p) => ("CANCEL", p),
                LifecycleEvent::TrailMoved(_) => continue,
            };
            self.mirror(Tab::Trades, trade_row(label, p, now)).await;
        }
    }

    fn save_states(&self, trader: &PaperTrader) {
        if let Err(e) = trader.save_state() {
            error!(symbol = %trader.symbol(), error = %e, "💾 [PAPER] Failed to save state");
        }
        if let Err(e) = self.risk.save_state() {
            error!(error = %e, "💾 [RISK] Failed to save state");
        }
    }

    /// One evaluate → enter → tick pass for `symbol`.
    /// `None` (no snapshot this tick) leaves positions untouched.
    pub async fn step(
        &self,
        symbol: Symbol,
        snapshot: Option<Snapshot>,
        now: DateTime<Utc>,
    ) -> Result<StepReport> {
        let state = self
            .symbols
            .get(&symbol)
            .with_context(|| format!("{} is not enabled", symbol))?;
        let mut st = state.lock().await;
        let mut report = StepReport::default();

        let today = trading_date(now);
        self.risk.roll_day(today);
        st.trader.roll_day(today);

        let Some(snap) = snapshot.filter(|s| s.spot_is_valid()) else {
            debug!(symbol = %symbol, "⏭️ [ENGINE] No snapshot this tick");
            return Ok(report);
        };

        let cfg = self.config();
        let params = GateParams::from_config(&cfg, symbol, None);
        let block = self.operational_block(&cfg, symbol, now);
        let result = evaluate(&snap, &params, block.as_deref(), now);
        st.last_spot = Some(snap.spot);

        info!(
            symbol = %symbol,
            spot = snap.spot,
            eligible = result.eligible,
            side = ?result.side(),
            level = ?result.level_tag(),
            failed = ?result.failed(),
            "🔎 [GATE] Evaluated"
        );
        self.mirror(Tab::Signals, signal_row(&result)).await;

        let entry = st.trader.try_enter(&result, &self.risk, now);
        if let EntryOutcome::Entered(pos) = &entry {
            let key = pos.dedup_key.to_string();
            match self.store.contains(Tab::Trades, "dedup_key", &key).await {
                Ok(true) => warn!(symbol = %symbol, key = %key, "🗄️ [STORE] Trade row already present"),
                _ => report.events.push(LifecycleEvent::Opened(pos.clone())),
            }
        }

        let stale = result
            .age_seconds
            .map_or(true, |age| age > params.freshness_max_secs);
        let tick = Tick {
            spot: snap.spot,
            view: Some(result.view.view),
            stale,
            now,
        };
        report.events.extend(st.trader.tick(&tick, &self.risk));

        self.mirror_events(&report.events, now).await;
        self.save_states(&st.trader);

        st.last_eval = Some(result.clone());
        report.evaluation = Some(result);
        report.entry = Some(entry);
        Ok(report)
    }

    /// Read-only evaluation on a fresh (or last) snapshot
    pub async fn evaluate_now(
        &self,
        symbol: Symbol,
        buffer_override: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<EligibilityResult> {
        let snap = match self.cache.get(symbol).await {
            Some(s) => s,
            None => self.cache.last(symbol)?,
        };
        let cfg = self.config();
        let params = GateParams::from_config(&cfg, symbol, buffer_override);
        let block = self.operational_block(&cfg, symbol, now);
        Some(evaluate(&snap, &params, block.as_deref(), now))
    }

    pub async fn last_evaluation(&self, symbol: Symbol) -> Option<EligibilityResult> {
        self.symbols.get(&symbol)?.lock().await.last_eval.clone()
    }

    pub async fn positions(&self) -> Vec<Position> {
        let mut out = Vec::new();
        for state in self.symbols.values() {
            out.extend(state.lock().await.trader.active().iter().cloned());
        }
        out
    }

    /// Today's closed positions per symbol plus the combined total
    pub async fn performance(&self, date: NaiveDate) -> (Vec<DailyPerformance>, DailyPerformance) {
        let mut per_symbol = Vec::new();
        let mut all = Vec::new();
        for (symbol, state) in &self.symbols {
            let st = state.lock().await;
            let closed = st.trader.closed_today();
            per_symbol.push(DailyPerformance::from_positions(
                date,
                Some(symbol.to_string()),
                closed,
            ));
            all.extend(closed.iter().cloned());
        }
        (per_symbol, DailyPerformance::from_positions(date, None, &all))
    }

    /// Write the Performance tab once per trading date after the cutoff
    pub async fn write_performance_if_due(&self, now: DateTime<Utc>) -> bool {
        if !is_past_cutoff(now, self.config().time_exit()) {
            return false;
        }
        let today = trading_date(now);
        let mut written = self.perf_written.lock().await;
        if *written == Some(today) {
            return false;
        }
        let (per_symbol, total) = self.performance(today).await;
        for perf in per_symbol.iter().chain(std::iter::once(&total)) {
            self.mirror(Tab::Performance, perf.to_row()).await;
        }
        info!(
            date = %today,
            trades = total.trades,
            gross = total.gross_pnl,
            "📊 [PERF] Daily performance written"
        );
        *written = Some(today);
        true
    }

    /// Manually close everything (or one symbol) at the last seen spot
    pub async fn flatten(&self, only: Option<Symbol>, now: DateTime<Utc>) -> Vec<Position> {
        let mut closed = Vec::new();
        for (symbol, state) in &self.symbols {
            if only.map_or(false, |s| s != *symbol) {
                continue;
            }
            let mut st = state.lock().await;
            let Some(spot) = st.last_spot else {
                if !st.trader.active().is_empty() {
                    warn!(symbol = %symbol, "✋ [PAPER] No spot seen yet, cannot flatten");
                }
                continue;
            };
            let events = st.trader.flatten(spot, ExitReason::Manual, now, &self.risk);
            self.mirror_events(&events, now).await;
            self.save_states(&st.trader);
            closed.extend(events.into_iter().filter_map(|e| match e {
                LifecycleEvent::Closed(p) | LifecycleEvent::Cancelled(p) => Some(p),
                _ => None,
            }));
        }
        closed
    }

    /// Status tab heartbeat
    pub async fn heartbeat(&self, state: &str, message: &str, now: DateTime<Utc>) {
        let cfg = self.config();
        let shift = if is_market_open(now) { "day" } else { "night" };
        self.mirror(
            Tab::Status,
            row([
                ("ts", ts(now)),
                ("worker_id", cfg.bot.worker_id.clone()),
                ("shift_mode", shift.to_string()),
                ("state", state.to_string()),
                ("message", message.to_string()),
            ]),
        )
        .await;
    }

    fn interval(&self, now: DateTime<Utc>) -> Duration {
        let cfg = self.config();
        let secs = if is_market_open(now) {
            cfg.provider.refresh_secs_day
        } else {
            cfg.provider.refresh_secs_night
        };
        Duration::from_secs(secs.max(1))
    }

    async fn symbol_loop(&self, symbol: Symbol, mut shutdown: watch::Receiver<bool>) {
        info!(symbol = %symbol, "▶️ [ENGINE] Symbol loop started");
        loop {
            let snap = self.cache.get(symbol).await;
            let now = Utc::now();
            if let Err(e) = self.step(symbol, snap, now).await {
                error!(symbol = %symbol, error = %e, "❌ [ENGINE] Step failed");
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval(now)) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(symbol = %symbol, "⏹️ [ENGINE] Symbol loop stopped");
    }

    async fn housekeeping_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let secs = self.config().provider.refresh_secs_night.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = shutdown.changed() => break,
            }
            self.refresh_tabs().await;
            self.write_performance_if_due(Utc::now()).await;
        }
    }

    /// Drive every symbol until shutdown; in-flight steps finish first
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let cfg = self.config();
        info!(config = %cfg, "🚀 [ENGINE] Running");
        self.heartbeat("UP", &cfg.digest(), Utc::now()).await;

        let mut tasks = Vec::new();
        for symbol in self.symbols() {
            let engine = Arc::clone(&self);
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                engine.symbol_loop(symbol, rx).await
            }));
        }
        {
            let engine = Arc::clone(&self);
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { engine.housekeeping_loop(rx).await }));
        }

        for res in futures_util::future::join_all(tasks).await {
            if let Err(e) = res {
                error!(error = %e, "❌ [ENGINE] Task panicked");
            }
        }

        for state in self.symbols.values() {
            self.save_states(&state.lock().await.trader);
        }
        self.heartbeat("DOWN", "shutdown", Utc::now()).await;
        info!("👋 [ENGINE] Stopped");
        Ok(())
    }
}
