//! Eligibility gate (C1–C6)
//!
//! Pure function of a snapshot, the per-symbol parameters and the
//! operational state. Every check is always reported; `eligible` is the
//! conjunction of all six.
//!
//! - C1: level proximity / cross, picks side + trigger
//! - C2: market view compatible with the side
//! - C3: OI delta pattern confirms the side
//! - C4: outside no-trade windows and snapshot fresh
//! - C5: no hold, caps not hit, breaker closed, no event window
//! - C6: enough room from trigger to the opposite raw barrier

mod render;

pub use render::render;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;

use crate::config::AppConfig;
use crate::levels::{resolve_buffer, shift, RawLevels, ShiftedLevels};
use crate::market_view::{resolve_view, OiTrend, ResolvedView, ViewParams};
use crate::session::{trading_date, TimeWindow};
use crate::types::{LevelTag, MarketView, Side, Snapshot, Symbol};

/// Above this PCR a put-heavy book supports CE, below it PE (both at the pivot)
const PCR_SIDE_PIVOT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CheckId {
    C1,
    C2,
    C3,
    C4,
    C5,
    C6,
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub id: CheckId,
    pub ok: bool,
    pub reason: String,
}

impl CheckResult {
    fn new(id: CheckId, ok: bool, reason: impl Into<String>) -> Self {
        Self {
            id,
            ok,
            reason: reason.into(),
        }
    }
}

/// Chosen trigger candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trigger {
    pub side: Side,
    pub tag: LevelTag,
    pub price: f64,
    /// Spot is through the level (vs merely inside the entry band)
    pub crossed: bool,
    pub distance: f64,
}

/// Per-symbol gate parameters, resolved from config at evaluation time
#[derive(Debug, Clone)]
pub struct GateParams {
    pub buffer: f64,
    pub entry_band: f64,
    pub min_target: f64,
    pub oi_flat_band: f64,
    pub pcr_bull: f64,
    pub pcr_bear: f64,
    pub freshness_max_secs: f64,
    pub no_trade_windows: Vec<TimeWindow>,
}

impl GateParams {
    pub fn from_config(cfg: &AppConfig, symbol: Symbol, buffer_override: Option<f64>) -> Self {
        let sc = cfg.symbol(symbol);
        Self {
            buffer: resolve_buffer(
                buffer_override,
                sc.map(|s| s.buffer_points),
                cfg.gate.default_buffer_points,
            ),
            entry_band: sc
                .map(|s| s.entry_band_points)
                .unwrap_or(cfg.gate.default_buffer_points),
            min_target: sc.map(|s| s.min_target_points).unwrap_or(f64::INFINITY),
            oi_flat_band: cfg.gate.oi_flat_band_pct,
            pcr_bull: cfg.gate.pcr_bull,
            pcr_bear: cfg.gate.pcr_bear,
            freshness_max_secs: cfg.gate.freshness_max_secs,
            no_trade_windows: cfg.no_trade_windows(),
        }
    }

    pub fn view_params(&self) -> ViewParams {
        ViewParams {
            oi_flat_band: self.oi_flat_band,
            pcr_bull: self.pcr_bull,
            pcr_bear: self.pcr_bear,
            buffer: self.buffer,
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, Serialize)]
pub struct EligibilityResult {
    pub symbol: Symbol,
    pub spot: f64,
    pub expiry: Option<NaiveDate>,
    pub raw: RawLevels,
    pub shifted: ShiftedLevels,
    pub view: ResolvedView,
    pub pcr: Option<f64>,
    pub max_pain: Option<f64>,
    pub ce_oi_delta: Option<f64>,
    pub pe_oi_delta: Option<f64>,
    pub age_seconds: Option<f64>,
    pub source: String,
    pub as_of: Option<DateTime<Utc>>,
    pub checks: Vec<CheckResult>,
    pub eligible: bool,
    pub trigger: Option<Trigger>,
    pub evaluated_at: DateTime<Utc>,
}

impl EligibilityResult {
    pub fn side(&self) -> Option<Side> {
        self.trigger.map(|t| t.side)
    }

    pub fn level_tag(&self) -> Option<LevelTag> {
        self.trigger.map(|t| t.tag)
    }

    pub fn trigger_price(&self) -> Option<f64> {
        self.trigger.map(|t| t.price)
    }

    pub fn check(&self, id: CheckId) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.id == id)
    }

    pub fn failed(&self) -> Vec<CheckId> {
        self.checks.iter().filter(|c| !c.ok).map(|c| c.id).collect()
    }
}

/// C1 candidate selection
///
/// Crossed beats near; nearest wins within each group. When a CE and a PE
/// level are both crossed the nearer one is taken. Equal distances keep
/// S1*, S2*, R1*, R2* order.
pub fn pick_trigger(spot: f64, shifted: &ShiftedLevels, entry_band: f64) -> Result<Trigger, String> {
    if !(spot.is_finite() && spot > 0.0) {
        return Err("spot missing".to_string());
    }
    if shifted.is_empty() {
        return Err("no valid trigger".to_string());
    }

    let candidates: Vec<Trigger> = shifted
        .present()
        .map(|(tag, price)| {
            let crossed = match tag.side() {
                Side::CE => spot <= price,
                Side::PE => spot >= price,
            };
            Trigger {
                side: tag.side(),
                tag,
                price,
                crossed,
                distance: (spot - price).abs(),
            }
        })
        .collect();

    if let Some(t) = nearest(candidates.iter().filter(|c| c.crossed)) {
        return Ok(t);
    }
    if let Some(t) = nearest(candidates.iter().filter(|c| c.distance <= entry_band)) {
        return Ok(t);
    }

    let closest = nearest(candidates.iter());
    Err(match closest {
        Some(c) => format!(
            "no valid trigger: nearest {} {:.2} is {:.2} away (band {:.2})",
            c.tag, c.price, c.distance, entry_band
        ),
        None => "no valid trigger".to_string(),
    })
}

/// First strictly-nearest candidate
fn nearest<'a>(pool: impl Iterator<Item = &'a Trigger>) -> Option<Trigger> {
    let mut best: Option<Trigger> = None;
    for c in pool {
        if best.map_or(true, |b| c.distance < b.distance) {
            best = Some(*c);
        }
    }
    best
}

fn check_view(trigger: Option<&Trigger>, view: &ResolvedView, snap: &Snapshot) -> (bool, String) {
    let Some(t) = trigger else {
        return (false, "no side".to_string());
    };

    if view.is_explicit() {
        return match view.view {
            MarketView::BigMove if t.side == Side::CE => (true, "MV=big_move".to_string()),
            MarketView::BigMove => (false, "MV=big_move, CE only".to_string()),
            MarketView::Sideways => (false, "MV=sideways, avoid".to_string()),
            v => (v.favors(t.side), format!("MV={}", v)),
        };
    }

    if view.view.is_avoid() {
        return (false, format!("{} via {}, avoid", view.view, view.source));
    }

    // 1-of-2: PCR side OR max-pain side
    let pcr_ok = snap.pcr.filter(|p| p.is_finite()).map(|pcr| match t.side {
        Side::CE => pcr >= PCR_SIDE_PIVOT,
        Side::PE => pcr <= PCR_SIDE_PIVOT,
    });
    let mp_ok = snap
        .max_pain
        .filter(|m| m.is_finite() && *m > 0.0)
        .map(|mp| match t.side {
            Side::CE => mp >= snap.spot,
            Side::PE => mp <= snap.spot,
        });

    if pcr_ok.is_none() && mp_ok.is_none() {
        return (false, "MV missing; PCR/MP missing".to_string());
    }
    let mark = |v: Option<bool>| match v {
        Some(true) => "✓",
        Some(false) => "×",
        None => "—",
    };
    let ok = pcr_ok == Some(true) || mp_ok == Some(true);
    (ok, format!("PCR {} / MP {}", mark(pcr_ok), mark(mp_ok)))
}

fn check_oi_pattern(side: Option<Side>, snap: &Snapshot, band: f64) -> (bool, String) {
    let (Some(ce), Some(pe)) = (snap.ce_oi_delta, snap.pe_oi_delta) else {
        return (false, "OIΔ missing".to_string());
    };
    let c = OiTrend::classify(ce, band);
    let p = OiTrend::classify(pe, band);
    let pattern = format!("CEΔ {:+.1}{} / PEΔ {:+.1}{}", ce, c.arrow(), pe, p.arrow());

    let Some(side) = side else {
        return (false, format!("{}, no side", pattern));
    };
    use OiTrend::*;
    let ok = match side {
        Side::CE => matches!((c, p), (Flat | Down, Up) | (Down, Down)),
        Side::PE => matches!((c, p), (Up, Flat | Down) | (Down, Down)),
    };
    (ok, pattern)
}

fn check_timing(snap: &Snapshot, params: &GateParams, now: DateTime<Utc>) -> (bool, String) {
    if let Some(w) = params.no_trade_windows.iter().find(|w| w.contains_instant(now)) {
        return (false, format!("no-trade window {}", w));
    }
    if let Some(exp) = snap.expiry {
        if exp < trading_date(now) {
            return (false, format!("stale expiry {}", exp));
        }
    }
    let max = params.freshness_max_secs;
    match snap.age_at(now) {
        None => (false, "age unknown".to_string()),
        Some(age) if age > max => (false, format!("stale {:.0}s≥{:.0}s", age, max)),
        Some(age) => (true, format!("time OK, fresh {:.0}s≤{:.0}s", age, max)),
    }
}

fn check_room(trigger: Option<&Trigger>, snap: &Snapshot, min_target: f64) -> (bool, String) {
    let Some(t) = trigger else {
        return (false, "no trigger".to_string());
    };
    let (barrier, name) = match t.side {
        Side::CE => (snap.r1, "R1"),
        Side::PE => (snap.s1, "S1"),
    };
    let Some(barrier) = barrier.filter(|v| v.is_finite() && *v > 0.0) else {
        return (false, format!("no {}", name));
    };
    let space = match t.side {
        Side::CE => barrier - t.price,
        Side::PE => t.price - barrier,
    };
    if space >= min_target {
        (true, format!("space {:.2} ≥ target {:.2}", space, min_target))
    } else {
        (false, format!("space {:.2} < target {:.2}", space, min_target))
    }
}

/// Run C1–C6 against one snapshot
///
/// `operational_block` is the C5 verdict computed by the caller from the
/// risk manager and event calendar (`None` means clear).
pub fn evaluate(
    snap: &Snapshot,
    params: &GateParams,
    operational_block: Option<&str>,
    now: DateTime<Utc>,
) -> EligibilityResult {
    let raw = RawLevels::from_snapshot(snap);
    let shifted = shift(raw, params.buffer);
    let view = resolve_view(snap, &params.view_params());

    let mut checks = Vec::with_capacity(6);

    let pick = pick_trigger(snap.spot, &shifted, params.entry_band);
    let trigger = pick.as_ref().ok().copied();
    checks.push(match &pick {
        Ok(t) => CheckResult::new(
            CheckId::C1,
            true,
            format!(
                "{} {} @ {:.2} ({:.2} away)",
                if t.crossed { "CROSS" } else { "NEAR" },
                t.side,
                t.price,
                t.distance
            ),
        ),
        Err(reason) => CheckResult::new(CheckId::C1, false, reason.clone()),
    });

    let (ok, reason) = check_view(trigger.as_ref(), &view, snap);
    checks.push(CheckResult::new(CheckId::C2, ok, reason));

    let (ok, reason) = check_oi_pattern(trigger.map(|t| t.side), snap, params.oi_flat_band);
    checks.push(CheckResult::new(CheckId::C3, ok, reason));

    let (ok, reason) = check_timing(snap, params, now);
    checks.push(CheckResult::new(CheckId::C4, ok, reason));

    checks.push(match operational_block {
        Some(why) => CheckResult::new(CheckId::C5, false, why),
        None => CheckResult::new(CheckId::C5, true, "ops OK"),
    });

    let (ok, reason) = check_room(trigger.as_ref(), snap, params.min_target);
    checks.push(CheckResult::new(CheckId::C6, ok, reason));

    let eligible = checks.iter().all(|c| c.ok);

    EligibilityResult {
        symbol: snap.symbol,
        spot: snap.spot,
        expiry: snap.expiry,
        raw,
        shifted,
        view,
        pcr: snap.pcr,
        max_pain: snap.max_pain,
        ce_oi_delta: snap.ce_oi_delta,
        pe_oi_delta: snap.pe_oi_delta,
        age_seconds: snap.age_at(now),
        source: snap.source.clone(),
        as_of: snap.as_of,
        checks,
        eligible,
        trigger,
        evaluated_at: now,
    }
}
