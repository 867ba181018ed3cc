//! Params_Override tab: approved `key | value | status` rows applied over the
//! loaded configuration.

use tracing::{info, warn};

use super::AppConfig;
use crate::persistence::{cell, Row};
use crate::types::Symbol;

const APPROVED: [&str; 6] = ["approved", "on", "true", "yes", "ok", "1"];

/// What an override pass changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideOutcome {
    /// `(KEY, value)` pairs that were applied
    pub applied: Vec<(String, String)>,
    /// Keys that were approved but unknown or unparsable
    pub skipped: Vec<String>,
    /// `HOLD` override, if present
    pub hold: Option<bool>,
}

fn is_approved(status: &str) -> bool {
    APPROVED.contains(&status.trim().to_lowercase().as_str())
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}

/// Apply every approved row. Later rows win over earlier ones.
pub fn apply_overrides(cfg: &mut AppConfig, rows: &[Row]) -> OverrideOutcome {
    let mut outcome = OverrideOutcome::default();

    for row in rows {
        let (Some(key), Some(value)) = (cell(row, "key"), cell(row, "value")) else {
            continue;
        };
        if !cell(row, "status").map(is_approved).unwrap_or(false) {
            continue;
        }
        let key = key.to_uppercase();

        if apply_one(cfg, &key, value, &mut outcome) {
            outcome.applied.push((key, value.to_string()));
        } else {
            warn!(key = %key, value = %value, "⚙️ [OVERRIDE] Skipped unknown or invalid override");
            outcome.skipped.push(key);
        }
    }

    if !outcome.applied.is_empty() {
        info!(count = outcome.applied.len(), "⚙️ [OVERRIDE] Params_Override applied");
    }
    outcome
}

fn apply_one(cfg: &mut AppConfig, key: &str, value: &str, outcome: &mut OverrideOutcome) -> bool {
    let num = value.trim().parse::<f64>().ok().filter(|v| v.is_finite());

    // Per-symbol keys end in _<SYMBOL>
    let per_symbol = [
        "BUFFER_POINTS_",
        "ENTRY_BAND_POINTS_",
        "MIN_TARGET_POINTS_",
        "SL_POINTS_",
        "TRAIL_OFFSET_POINTS_",
    ];
    for prefix in per_symbol {
        if let Some(sym) = key.strip_prefix(prefix) {
            let (Some(symbol), Some(v)) = (Symbol::from_str(sym), num) else {
                return false;
            };
            let Some(sc) = cfg.symbol_mut(symbol) else {
                return false;
            };
            match prefix {
                "BUFFER_POINTS_" if v >= 0.0 => sc.buffer_points = v,
                "ENTRY_BAND_POINTS_" if v >= 0.0 => sc.entry_band_points = v,
                "MIN_TARGET_POINTS_" if v > 0.0 => sc.min_target_points = v,
                "SL_POINTS_" if v > 0.0 => sc.initial_sl_points = v,
                "TRAIL_OFFSET_POINTS_" if v >= 0.0 => sc.trail_offset_points = v,
                _ => return false,
            }
            return true;
        }
    }

    match (key, num) {
        ("PCR_BULL_HIGH", Some(v)) if v > 0.0 => cfg.gate.pcr_bull = v,
        ("PCR_BEAR_LOW", Some(v)) if v > 0.0 => cfg.gate.pcr_bear = v,
        ("TARGET_RR", Some(v)) if v > 0.0 => cfg.exits.target_rr = v,
        ("MV_REV_CONFIRM", Some(v)) if v >= 1.0 => cfg.exits.mv_flip_confirm = v as u32,
        ("MAX_TRADES_PER_DAY", Some(v)) if v >= 0.0 => cfg.risk.max_trades_per_day = v as u32,
        ("DAILY_LOSS_LIMIT", Some(v)) if v > 0.0 => cfg.risk.daily_loss_limit = v,
        ("OC_FRESH_MAX_AGE_SEC", Some(v)) if v > 0.0 => cfg.gate.freshness_max_secs = v,
        ("HOLD", _) => match parse_flag(value) {
            Some(flag) => outcome.hold = Some(flag),
            None => return false,
        },
        _ => return false,
    }
    true
}
