//! Configuration value types shared by the config sections

use serde::Deserialize;

/// Per-symbol tunables (`symbols.<name>` table)
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolConfig {
    /// Points subtracted from supports / added to resistances
    pub buffer_points: f64,
    /// Max distance from a shifted level that still counts as "near"
    pub entry_band_points: f64,
    /// Minimum room from trigger to the opposite barrier (C6)
    pub min_target_points: f64,
    /// Initial stop distance; also the unit of risk for TP and trailing
    pub initial_sl_points: f64,
    /// Gap kept between price and the trailing stop once trailing is active
    pub trail_offset_points: f64,
    /// Lots per trade; 0 sizes from `risk.max_exposure_per_trade`
    #[serde(default)]
    pub quantity: u32,
    /// Money value of one point per unit of quantity
    #[serde(default = "default_point_value")]
    pub point_value: f64,
}

fn default_point_value() -> f64 {
    1.0
}

/// How an eligible signal becomes a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// Paper fill at the trigger price as soon as the gate passes
    #[default]
    Immediate,
    /// Park as PENDING until spot crosses the trigger, cancel on timeout
    Pending,
}

/// Premium proxy used for recorded entry/exit prices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingKind {
    #[default]
    Spot,
    Synthetic,
}
