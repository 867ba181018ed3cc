//! Level shifter
//!
//! Supports move down by the buffer, resistances move up, so a trigger needs
//! a confirmed move through the raw level.

use serde::Serialize;

use crate::types::{LevelTag, Snapshot};

/// Raw support/resistance levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RawLevels {
    pub s1: Option<f64>,
    pub s2: Option<f64>,
    pub r1: Option<f64>,
    pub r2: Option<f64>,
}

impl RawLevels {
    pub fn from_snapshot(snap: &Snapshot) -> Self {
        Self {
            s1: snap.s1,
            s2: snap.s2,
            r1: snap.r1,
            r2: snap.r2,
        }
    }
}

/// Shifted trigger levels `{S1*, S2*, R1*, R2*}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ShiftedLevels {
    pub s1: Option<f64>,
    pub s2: Option<f64>,
    pub r1: Option<f64>,
    pub r2: Option<f64>,
    pub buffer: f64,
}

impl ShiftedLevels {
    pub fn get(&self, tag: LevelTag) -> Option<f64> {
        match tag {
            LevelTag::S1 => self.s1,
            LevelTag::S2 => self.s2,
            LevelTag::R1 => self.r1,
            LevelTag::R2 => self.r2,
        }
    }

    /// Present levels in S1*, S2*, R1*, R2* order
    pub fn present(&self) -> impl Iterator<Item = (LevelTag, f64)> + '_ {
        LevelTag::ALL
            .into_iter()
            .filter_map(move |tag| self.get(tag).map(|lv| (tag, lv)))
    }

    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

/// A level is usable only if it is a finite positive price. Zero is the
/// upstream "no data" marker and must never become a trigger.
fn usable(level: Option<f64>) -> Option<f64> {
    level.filter(|v| v.is_finite() && *v > 0.0)
}

pub fn shift(raw: RawLevels, buffer: f64) -> ShiftedLevels {
    let buffer = if buffer.is_finite() { buffer.max(0.0) } else { 0.0 };
    ShiftedLevels {
        s1: usable(raw.s1).map(|v| v - buffer),
        s2: usable(raw.s2).map(|v| v - buffer),
        r1: usable(raw.r1).map(|v| v + buffer),
        r2: usable(raw.r2).map(|v| v + buffer),
        buffer,
    }
}

/// Buffer resolution: explicit override, then symbol table, then global default
pub fn resolve_buffer(request: Option<f64>, symbol: Option<f64>, global: f64) -> f64 {
    let valid = |v: f64| v.is_finite() && v >= 0.0;
    request
        .filter(|v| valid(*v))
        .or(symbol.filter(|v| valid(*v)))
        .unwrap_or(global)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(s1: f64, s2: f64, r1: f64, r2: f64) -> RawLevels {
        RawLevels {
            s1: Some(s1),
            s2: Some(s2),
            r1: Some(r1),
            r2: Some(r2),
        }
    }

    #[test]
    fn shift_moves_supports_down_and_resistances_up() {
        let s = shift(raw(22_000.0, 21_900.0, 22_200.0, 22_300.0), 12.0);
        assert_eq!(s.s1, Some(21_988.0));
        assert_eq!(s.s2, Some(21_888.0));
        assert_eq!(s.r1, Some(22_212.0));
        assert_eq!(s.r2, Some(22_312.0));
    }

    #[test]
    fn zero_buffer_is_identity() {
        let r = raw(95.0, 90.0, 130.0, 140.0);
        let s = shift(r, 0.0);
        assert_eq!((s.s1, s.s2, s.r1, s.r2), (r.s1, r.s2, r.r1, r.r2));
    }

    #[test]
    fn absent_and_zero_levels_stay_absent() {
        let s = shift(
            RawLevels {
                s1: Some(0.0),
                s2: None,
                r1: Some(f64::NAN),
                r2: Some(130.0),
            },
            5.0,
        );
        assert_eq!(s.s1, None);
        assert_eq!(s.s2, None);
        assert_eq!(s.r1, None);
        assert_eq!(s.r2, Some(135.0));
        assert_eq!(s.present().count(), 1);
    }

    #[test]
    fn buffer_resolution_order() {
        assert_eq!(resolve_buffer(Some(5.0), Some(12.0), 10.0), 5.0);
        assert_eq!(resolve_buffer(None, Some(12.0), 10.0), 12.0);
        assert_eq!(resolve_buffer(Some(-1.0), None, 10.0), 10.0);
    }
}
