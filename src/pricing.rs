//! Premium proxies for paper fills
//!
//! The lifecycle evaluates SL/TP/trailing on the underlying; a pricing model
//! only decides what premium gets recorded at entry and exit. Swapping in
//! real bid/ask quotes means another implementation of `PricingModel`.

use std::sync::Arc;

use crate::config::{AppConfig, PricingKind};
use crate::types::Side;

pub trait PricingModel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Premium recorded at fill
    fn entry_premium(&self, side: Side, fill_spot: f64) -> f64;

    /// Premium for the current underlying price
    fn premium(&self, side: Side, fill_spot: f64, spot: f64) -> f64;
}

/// Underlying price stands in for the premium
#[derive(Debug, Clone, Copy, Default)]
pub struct SpotProxy;

impl PricingModel for SpotProxy {
    fn name(&self) -> &'static str {
        "spot"
    }

    fn entry_premium(&self, _side: Side, fill_spot: f64) -> f64 {
        fill_spot
    }

    fn premium(&self, _side: Side, _fill_spot: f64, spot: f64) -> f64 {
        spot
    }
}

/// Linear delta model: `max(0, base + k * favourable_move)`
#[derive(Debug, Clone, Copy)]
pub struct SyntheticOption {
    pub k: f64,
    pub base: f64,
}

impl PricingModel for SyntheticOption {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn entry_premium(&self, _side: Side, _fill_spot: f64) -> f64 {
        self.base.max(0.0)
    }

    fn premium(&self, side: Side, fill_spot: f64, spot: f64) -> f64 {
        (self.base + self.k * side.sign() * (spot - fill_spot)).max(0.0)
    }
}

pub fn from_config(cfg: &AppConfig) -> Arc<dyn PricingModel> {
    match cfg.exits.pricing {
        PricingKind::Spot => Arc::new(SpotProxy),
        PricingKind::Synthetic => Arc::new(SyntheticOption {
            k: cfg.exits.synthetic_k,
            base: cfg.exits.synthetic_base,
        }),
    }
}
