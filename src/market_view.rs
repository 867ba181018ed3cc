//! Market view resolver
//!
//! Explicit tag first, then the near-ATM OI delta table, then PCR with a
//! max-pain tie-break.

use serde::Serialize;
use std::fmt;

use crate::types::{MarketView, Snapshot};

/// Direction of an OI delta after applying the flat band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OiTrend {
    Up,
    Down,
    Flat,
}

impl OiTrend {
    pub fn classify(delta: f64, flat_band: f64) -> OiTrend {
        if delta > flat_band {
            OiTrend::Up
        } else if delta < -flat_band {
            OiTrend::Down
        } else {
            OiTrend::Flat
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            OiTrend::Up => "↑",
            OiTrend::Down => "↓",
            OiTrend::Flat => "→",
        }
    }
}

/// Where the resolved view came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewSource {
    Explicit,
    OiPattern,
    Pcr,
    MaxPain,
    Inconclusive,
}

impl fmt::Display for ViewSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViewSource::Explicit => "tag",
            ViewSource::OiPattern => "OIΔ",
            ViewSource::Pcr => "PCR",
            ViewSource::MaxPain => "MP",
            ViewSource::Inconclusive => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedView {
    pub view: MarketView,
    pub source: ViewSource,
}

impl ResolvedView {
    pub fn is_explicit(&self) -> bool {
        self.source == ViewSource::Explicit
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ViewParams {
    pub oi_flat_band: f64,
    pub pcr_bull: f64,
    pub pcr_bear: f64,
    /// Max-pain distance that counts as a directional pull
    pub buffer: f64,
}

/// OI delta classification table
pub fn classify_oi(ce: OiTrend, pe: OiTrend, volume_low: bool) -> MarketView {
    match (ce, pe) {
        (OiTrend::Down, OiTrend::Up) => MarketView::Bullish,
        (OiTrend::Down, OiTrend::Down) => MarketView::StrongBullish,
        (OiTrend::Up, OiTrend::Up) if volume_low => MarketView::Sideways,
        (OiTrend::Up, OiTrend::Up) => MarketView::Bearish,
        (OiTrend::Up, OiTrend::Down) => MarketView::StrongBearish,
        _ => MarketView::Unknown,
    }
}

pub fn resolve_view(snap: &Snapshot, params: &ViewParams) -> ResolvedView {
    // An explicit "unknown" carries no information; fall through to derivation
    if let Some(view) = snap.market_view.filter(|v| *v != MarketView::Unknown) {
        return ResolvedView {
            view,
            source: ViewSource::Explicit,
        };
    }

    if let (Some(ce), Some(pe)) = (snap.ce_oi_delta, snap.pe_oi_delta) {
        let view = classify_oi(
            OiTrend::classify(ce, params.oi_flat_band),
            OiTrend::classify(pe, params.oi_flat_band),
            snap.volume_low,
        );
        return ResolvedView {
            view,
            source: ViewSource::OiPattern,
        };
    }

    if let Some(pcr) = snap.pcr.filter(|p| p.is_finite()) {
        if pcr >= params.pcr_bull {
            return ResolvedView {
                view: MarketView::Bullish,
                source: ViewSource::Pcr,
            };
        }
        if pcr <= params.pcr_bear {
            return ResolvedView {
                view: MarketView::Bearish,
                source: ViewSource::Pcr,
            };
        }
    }

    if let Some(mp) = snap.max_pain.filter(|m| m.is_finite() && *m > 0.0) {
        if snap.spot_is_valid() {
            if snap.spot < mp - params.buffer {
                return ResolvedView {
                    view: MarketView::Bullish,
                    source: ViewSource::MaxPain,
                };
            }
            if snap.spot > mp + params.buffer {
                return ResolvedView {
                    view: MarketView::Bearish,
                    source: ViewSource::MaxPain,
                };
            }
        }
    }

    ResolvedView {
        view: MarketView::Unknown,
        source: ViewSource::Inconclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;

    fn params() -> ViewParams {
        ViewParams {
            oi_flat_band: 2.0,
            pcr_bull: 1.10,
            pcr_bear: 0.90,
            buffer: 12.0,
        }
    }

    #[test]
    fn oi_table() {
        use OiTrend::*;
        assert_eq!(classify_oi(Down, Up, false), MarketView::Bullish);
        assert_eq!(classify_oi(Down, Down, false), MarketView::StrongBullish);
        assert_eq!(classify_oi(Up, Up, false), MarketView::Bearish);
        assert_eq!(classify_oi(Up, Up, true), MarketView::Sideways);
        assert_eq!(classify_oi(Up, Down, false), MarketView::StrongBearish);
        assert_eq!(classify_oi(Flat, Up, false), MarketView::Unknown);
    }

    #[test]
    fn flat_band_is_inclusive() {
        assert_eq!(OiTrend::classify(2.0, 2.0), OiTrend::Flat);
        assert_eq!(OiTrend::classify(-2.5, 2.0), OiTrend::Down);
        assert_eq!(OiTrend::classify(5.0, 2.0), OiTrend::Up);
    }

    #[test]
    fn explicit_tag_wins_over_deltas() {
        let mut snap = Snapshot::new(Symbol::Nifty, 100.0);
        snap.market_view = Some(MarketView::Bearish);
        snap.ce_oi_delta = Some(-5.0);
        snap.pe_oi_delta = Some(5.0);
        let r = resolve_view(&snap, &params());
        assert_eq!(r.view, MarketView::Bearish);
        assert!(r.is_explicit());
    }

    #[test]
    fn pcr_then_max_pain_fallback() {
        let mut snap = Snapshot::new(Symbol::Nifty, 22_000.0);
        snap.pcr = Some(1.25);
        assert_eq!(resolve_view(&snap, &params()).view, MarketView::Bullish);

        snap.pcr = Some(1.0);
        snap.max_pain = Some(22_100.0);
        let r = resolve_view(&snap, &params());
        assert_eq!((r.view, r.source), (MarketView::Bullish, ViewSource::MaxPain));

        snap.max_pain = Some(22_005.0);
        assert_eq!(resolve_view(&snap, &params()).source, ViewSource::Inconclusive);
    }
}
