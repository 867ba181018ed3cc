//! Core types used throughout OcBot
//!
//! Symbols, trade sides, level tags, market views and the typed option-chain
//! snapshot every other module consumes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported index symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Symbol {
    Nifty,
    BankNifty,
    FinNifty,
}

impl Symbol {
    pub const ALL: [Symbol; 3] = [Symbol::Nifty, Symbol::BankNifty, Symbol::FinNifty];

    /// Key used for the per-symbol configuration table (lowercase)
    pub fn config_key(&self) -> &'static str {
        match self {
            Symbol::Nifty => "nifty",
            Symbol::BankNifty => "banknifty",
            Symbol::FinNifty => "finnifty",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Symbol::Nifty => "NIFTY",
            Symbol::BankNifty => "BANKNIFTY",
            Symbol::FinNifty => "FINNIFTY",
        }
    }

    /// Parse from string (case-insensitive, tolerates `NIFTY 50` / `NIFTY_BANK`)
    pub fn from_str(s: &str) -> Option<Self> {
        let key: String = s
            .trim()
            .to_uppercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match key.as_str() {
            "NIFTY" | "NIFTY50" => Some(Symbol::Nifty),
            "BANKNIFTY" | "NIFTYBANK" => Some(Symbol::BankNifty),
            "FINNIFTY" | "NIFTYFIN" | "NIFTYFINSERVICE" => Some(Symbol::FinNifty),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Option side: CE is the bullish leg, PE the bearish one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    CE,
    PE,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::CE => Side::PE,
            Side::PE => Side::CE,
        }
    }

    /// +1 for CE, -1 for PE. Multiplying an underlying move by this gives
    /// the move in the position's favour.
    pub fn sign(&self) -> f64 {
        match self {
            Side::CE => 1.0,
            Side::PE => -1.0,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "CE" | "CALL" => Some(Side::CE),
            "PE" | "PUT" => Some(Side::PE),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::CE => write!(f, "CE"),
            Side::PE => write!(f, "PE"),
        }
    }
}

/// Shifted trigger level identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LevelTag {
    S1,
    S2,
    R1,
    R2,
}

impl LevelTag {
    pub const ALL: [LevelTag; 4] = [LevelTag::S1, LevelTag::S2, LevelTag::R1, LevelTag::R2];

    /// Supports feed CE entries, resistances feed PE entries
    pub fn side(&self) -> Side {
        match self {
            LevelTag::S1 | LevelTag::S2 => Side::CE,
            LevelTag::R1 | LevelTag::R2 => Side::PE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LevelTag::S1 => "S1*",
            LevelTag::S2 => "S2*",
            LevelTag::R1 => "R1*",
            LevelTag::R2 => "R2*",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().trim_end_matches('*').to_uppercase().as_str() {
            "S1" => Some(LevelTag::S1),
            "S2" => Some(LevelTag::S2),
            "R1" => Some(LevelTag::R1),
            "R2" => Some(LevelTag::R2),
            _ => None,
        }
    }
}

impl fmt::Display for LevelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market view tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketView {
    Bullish,
    StrongBullish,
    Bearish,
    StrongBearish,
    Sideways,
    BigMove,
    Unknown,
}

impl MarketView {
    /// Parse a free-form tag (`Strong Bullish`, `strong-bullish`, `big_move_possible` ...)
    pub fn parse(s: &str) -> Option<Self> {
        let norm: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match norm.as_str() {
            "bullish" => Some(MarketView::Bullish),
            "strong_bullish" => Some(MarketView::StrongBullish),
            "bearish" => Some(MarketView::Bearish),
            "strong_bearish" => Some(MarketView::StrongBearish),
            "sideways" | "range" | "rangebound" => Some(MarketView::Sideways),
            "big_move" | "big_move_possible" | "bigmove" => Some(MarketView::BigMove),
            "unknown" => Some(MarketView::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketView::Bullish => "bullish",
            MarketView::StrongBullish => "strong_bullish",
            MarketView::Bearish => "bearish",
            MarketView::StrongBearish => "strong_bearish",
            MarketView::Sideways => "sideways",
            MarketView::BigMove => "big_move",
            MarketView::Unknown => "unknown",
        }
    }

    /// Directional views that favour the given side. Neutral views favour neither.
    pub fn favors(&self, side: Side) -> bool {
        match side {
            Side::CE => matches!(self, MarketView::Bullish | MarketView::StrongBullish),
            Side::PE => matches!(self, MarketView::Bearish | MarketView::StrongBearish),
        }
    }

    /// Views under which no new entry is taken
    pub fn is_avoid(&self) -> bool {
        matches!(self, MarketView::Sideways | MarketView::BigMove)
    }
}

impl fmt::Display for MarketView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetch status reported by the snapshot provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    #[default]
    Ok,
    Error,
    RateLimited,
}

/// Immutable read of option-chain state at a point in time
///
/// Built once at the provider boundary; every level is either a usable
/// positive price or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: Symbol,
    pub spot: f64,
    pub s1: Option<f64>,
    pub s2: Option<f64>,
    pub r1: Option<f64>,
    pub r2: Option<f64>,
    pub expiry: Option<NaiveDate>,
    pub market_view: Option<MarketView>,
    pub pcr: Option<f64>,
    pub max_pain: Option<f64>,
    pub ce_oi_delta: Option<f64>,
    pub pe_oi_delta: Option<f64>,
    /// Low traded volume flag (turns an up/up OI build into Sideways)
    pub volume_low: bool,
    pub age_seconds: Option<f64>,
    pub as_of: Option<DateTime<Utc>>,
    pub source: String,
    pub status: SnapshotStatus,
}

impl Snapshot {
    /// Minimal snapshot with only a spot price
    pub fn new(symbol: Symbol, spot: f64) -> Self {
        Self {
            symbol,
            spot,
            s1: None,
            s2: None,
            r1: None,
            r2: None,
            expiry: None,
            market_view: None,
            pcr: None,
            max_pain: None,
            ce_oi_delta: None,
            pe_oi_delta: None,
            volume_low: false,
            age_seconds: None,
            as_of: None,
            source: String::new(),
            status: SnapshotStatus::Ok,
        }
    }

    /// Snapshot age at `now`: explicit `age_seconds` wins, else derived from `as_of`
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<f64> {
        if let Some(age) = self.age_seconds.filter(|a| a.is_finite()) {
            return Some(age.max(0.0));
        }
        self.as_of
            .map(|ts| ((now - ts).num_milliseconds() as f64 / 1000.0).max(0.0))
    }

    pub fn has_levels(&self) -> bool {
        self.s1.is_some() || self.s2.is_some() || self.r1.is_some() || self.r2.is_some()
    }

    pub fn spot_is_valid(&self) -> bool {
        self.spot.is_finite() && self.spot > 0.0
    }
}
