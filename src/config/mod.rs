//! Configuration management for OcBot
//!
//! Loads built-in defaults, then `config/default.*` and `config/local.*`,
//! then `OCBOT__SECTION__KEY` environment variables (after `.env`).

mod overrides;
mod types;

pub use overrides::{apply_overrides, OverrideOutcome};
pub use types::*;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

use crate::session::{parse_hhmm, TimeWindow};
use crate::types::Symbol;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    /// Per-symbol tables keyed by lowercase symbol name
    pub symbols: HashMap<String, SymbolConfig>,
    pub gate: GateConfig,
    pub exits: ExitConfig,
    pub risk: RiskConfig,
    pub circuit: CircuitConfig,
    pub provider: ProviderConfig,
    pub persistence: PersistenceConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag for logs and the Status tab
    pub tag: String,
    /// Index symbols to watch
    pub symbols: Vec<String>,
    /// Worker identifier written to the Status tab
    pub worker_id: String,
    /// Emit JSON log lines instead of the human format
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// Buffer used when a symbol has no table entry
    pub default_buffer_points: f64,
    /// OI deltas within ±band count as flat
    pub oi_flat_band_pct: f64,
    /// PCR at or above this reads bullish
    pub pcr_bull: f64,
    /// PCR at or below this reads bearish
    pub pcr_bear: f64,
    /// Snapshot freshness ceiling in seconds
    pub freshness_max_secs: f64,
    /// Local `HH:MM-HH:MM` windows with no new entries
    pub no_trade_windows: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// TP distance in units of initial risk
    pub target_rr: f64,
    /// Favourable excursion (in risk units) that activates trailing
    pub trail_trigger_rr: f64,
    /// Where the stop is locked when trailing activates (in risk units)
    pub trail_lock_rr: f64,
    /// Consecutive opposite-view ticks before MV_FLIP fires
    pub mv_flip_confirm: u32,
    /// Consecutive stale snapshots before a STALE exit; 0 disables
    pub stale_exit_confirm: u32,
    /// Local time at which every position is flattened
    pub time_exit: String,
    pub entry_mode: EntryMode,
    pub pending_timeout_secs: u64,
    pub pricing: PricingKind,
    pub synthetic_k: f64,
    pub synthetic_base: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub max_trades_per_day: u32,
    /// Positive amount; entries stop once daily PnL ≤ -limit
    pub daily_loss_limit: f64,
    /// Premium budget per trade used when a symbol quantity is 0
    pub max_exposure_per_trade: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitConfig {
    /// SL hits inside the window that trip the breaker
    pub sl_threshold: usize,
    pub window_mins: i64,
    pub pause_mins: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Snapshot service root; empty means replay `snapshot_file`
    pub base_url: String,
    /// JSON-lines file replayed when no service is configured
    pub snapshot_file: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Loop interval during market hours
    pub refresh_secs_day: u64,
    /// Loop interval outside market hours
    pub refresh_secs_night: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub csv_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Senders allowed to run privileged commands
    pub admin_ids: Vec<String>,
}

impl AppConfig {
    /// Load configuration from defaults, files and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (OCBOT__*)
            .add_source(
                Environment::with_prefix("OCBOT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bot.symbols")
                    .with_list_parse_key("gate.no_trade_windows")
                    .with_list_parse_key("control.admin_ids"),
            );

        let app_config = Self::finish(builder)?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Built-in defaults only (no files, no environment)
    pub fn defaults() -> Result<Self> {
        Self::finish(Self::with_defaults(Config::builder())?)
    }

    fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config = builder.build().context("Failed to build configuration")?;
        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        Ok(app_config)
    }

    fn with_defaults(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        let mut builder = builder
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.symbols", vec!["NIFTY"])?
            .set_default("bot.worker_id", "ocbot-1")?
            .set_default("bot.log_json", false)?
            // Gate defaults
            .set_default("gate.default_buffer_points", 12.0)?
            .set_default("gate.oi_flat_band_pct", 2.0)?
            .set_default("gate.pcr_bull", 1.10)?
            .set_default("gate.pcr_bear", 0.90)?
            .set_default("gate.freshness_max_secs", 90.0)?
            .set_default("gate.no_trade_windows", vec!["09:15-09:30", "14:45-15:15"])?
            // Exit defaults
            .set_default("exits.target_rr", 3.0)?
            .set_default("exits.trail_trigger_rr", 2.0)?
            .set_default("exits.trail_lock_rr", 1.0)?
            .set_default("exits.mv_flip_confirm", 2)?
            .set_default("exits.stale_exit_confirm", 0)?
            .set_default("exits.time_exit", "15:15")?
            .set_default("exits.entry_mode", "immediate")?
            .set_default("exits.pending_timeout_secs", 120)?
            .set_default("exits.pricing", "spot")?
            .set_default("exits.synthetic_k", 1.0)?
            .set_default("exits.synthetic_base", 100.0)?
            // Risk defaults
            .set_default("risk.max_trades_per_day", 6)?
            .set_default("risk.daily_loss_limit", 6000.0)?
            .set_default("risk.max_exposure_per_trade", 3000.0)?
            // Circuit breaker defaults
            .set_default("circuit.sl_threshold", 3)?
            .set_default("circuit.window_mins", 15)?
            .set_default("circuit.pause_mins", 20)?
            // Provider defaults
            .set_default("provider.base_url", "")?
            .set_default("provider.snapshot_file", "./data/snapshots.jsonl")?
            .set_default("provider.timeout_secs", 10)?
            .set_default("provider.max_retries", 4)?
            .set_default("provider.refresh_secs_day", 10)?
            .set_default("provider.refresh_secs_night", 60)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            .set_default("control.admin_ids", Vec::<String>::new())?;

        // (buffer, entry band, min target, initial SL, trail offset)
        let table: [(Symbol, [f64; 5]); 3] = [
            (Symbol::Nifty, [12.0, 12.0, 30.0, 20.0, 15.0]),
            (Symbol::BankNifty, [30.0, 30.0, 70.0, 60.0, 40.0]),
            (Symbol::FinNifty, [15.0, 15.0, 25.0, 35.0, 25.0]),
        ];
        for (symbol, [buffer, band, target, sl, trail]) in table {
            let key = symbol.config_key();
            builder = builder
                .set_default(format!("symbols.{key}.buffer_points"), buffer)?
                .set_default(format!("symbols.{key}.entry_band_points"), band)?
                .set_default(format!("symbols.{key}.min_target_points"), target)?
                .set_default(format!("symbols.{key}.initial_sl_points"), sl)?
                .set_default(format!("symbols.{key}.trail_offset_points"), trail)?
                .set_default(format!("symbols.{key}.quantity"), 1)?
                .set_default(format!("symbols.{key}.point_value"), 1.0)?;
        }
        Ok(builder)
    }

    /// Fail fast on missing or invalid required symbol configuration
    pub fn validate(&self) -> Result<()> {
        let symbols = self.enabled_symbols()?;
        if symbols.is_empty() {
            bail!("bot.symbols is empty");
        }
        for symbol in symbols {
            let Some(cfg) = self.symbol(symbol) else {
                bail!("missing symbols.{} table", symbol.config_key());
            };
            if !(cfg.buffer_points >= 0.0) {
                bail!("symbols.{}.buffer_points must be >= 0", symbol.config_key());
            }
            if !(cfg.entry_band_points >= 0.0) {
                bail!("symbols.{}.entry_band_points must be >= 0", symbol.config_key());
            }
            if !(cfg.min_target_points > 0.0) {
                bail!("symbols.{}.min_target_points must be > 0", symbol.config_key());
            }
            if !(cfg.initial_sl_points > 0.0) {
                bail!("symbols.{}.initial_sl_points must be > 0", symbol.config_key());
            }
            if !(cfg.point_value > 0.0) {
                bail!("symbols.{}.point_value must be > 0", symbol.config_key());
            }
        }
        for raw in &self.gate.no_trade_windows {
            if TimeWindow::parse(raw).is_none() {
                bail!("gate.no_trade_windows: invalid window '{}'", raw);
            }
        }
        if parse_hhmm(&self.exits.time_exit).is_none() {
            bail!("exits.time_exit: invalid time '{}'", self.exits.time_exit);
        }
        if !(self.exits.target_rr > 0.0) {
            bail!("exits.target_rr must be > 0");
        }
        Ok(())
    }

    pub fn enabled_symbols(&self) -> Result<Vec<Symbol>> {
        let mut out = Vec::new();
        for raw in &self.bot.symbols {
            match Symbol::from_str(raw) {
                Some(s) if !out.contains(&s) => out.push(s),
                Some(_) => {}
                None => bail!("bot.symbols: unknown symbol '{}'", raw),
            }
        }
        Ok(out)
    }

    pub fn symbol(&self, symbol: Symbol) -> Option<&SymbolConfig> {
        self.symbols.get(symbol.config_key())
    }

    pub fn symbol_mut(&mut self, symbol: Symbol) -> Option<&mut SymbolConfig> {
        self.symbols.get_mut(symbol.config_key())
    }

    /// Parsed no-trade windows (malformed entries are rejected by `validate`)
    pub fn no_trade_windows(&self) -> Vec<TimeWindow> {
        self.gate
            .no_trade_windows
            .iter()
            .filter_map(|w| TimeWindow::parse(w))
            .collect()
    }

    pub fn time_exit(&self) -> NaiveTime {
        parse_hhmm(&self.exits.time_exit)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(15, 15, 0).unwrap_or(NaiveTime::MIN))
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} symbols={:?} windows={:?} fresh={}s rr={} max_trades={} loss_limit={} circuit={}x{}m/{}m",
            self.bot.tag,
            self.bot.symbols,
            self.gate.no_trade_windows,
            self.gate.freshness_max_secs,
            self.exits.target_rr,
            self.risk.max_trades_per_day,
            self.risk.daily_loss_limit,
            self.circuit.sl_threshold,
            self.circuit.window_mins,
            self.circuit.pause_mins,
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_symbol() {
        let cfg = AppConfig::defaults().unwrap();
        cfg.validate().unwrap();

        let nifty = cfg.symbol(Symbol::Nifty).unwrap();
        assert_eq!(nifty.buffer_points, 12.0);
        assert_eq!(nifty.min_target_points, 30.0);
        let bank = cfg.symbol(Symbol::BankNifty).unwrap();
        assert_eq!(bank.buffer_points, 30.0);
        assert_eq!(bank.initial_sl_points, 60.0);
        assert_eq!(cfg.symbol(Symbol::FinNifty).unwrap().buffer_points, 15.0);

        assert_eq!(cfg.no_trade_windows().len(), 2);
        assert_eq!(cfg.time_exit(), NaiveTime::from_hms_opt(15, 15, 0).unwrap());
        assert_eq!(cfg.exits.entry_mode, EntryMode::Immediate);
        assert_eq!(cfg.exits.pricing, PricingKind::Spot);
    }

    #[test]
    fn validate_rejects_unknown_symbol_and_missing_table() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.bot.symbols = vec!["SENSEX".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::defaults().unwrap();
        cfg.bot.symbols = vec!["BANKNIFTY".to_string()];
        cfg.symbols.remove("banknifty");
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("symbols.banknifty"));
    }

    #[test]
    fn validate_rejects_bad_windows_and_stop_distance() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.gate.no_trade_windows.push("lunch".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::defaults().unwrap();
        cfg.symbol_mut(Symbol::Nifty).unwrap().initial_sl_points = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn enabled_symbols_dedups() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.bot.symbols = vec!["nifty".into(), "NIFTY".into(), "finnifty".into()];
        assert_eq!(
            cfg.enabled_symbols().unwrap(),
            vec![Symbol::Nifty, Symbol::FinNifty]
        );
    }
}
