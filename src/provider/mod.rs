//! Snapshot provider boundary
//!
//! Upstream payloads are normalized into the typed [`Snapshot`] here, once.
//! Key aliases, numeric strings and junk values stop at this module.

mod cache;
mod http;
mod replay;

pub use cache::SnapshotCache;
pub use http::{backoff_with_jitter_secs, HttpSnapshotProvider};
pub use replay::StaticSnapshotProvider;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{MarketView, Snapshot, SnapshotStatus, Symbol};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("upstream server error: HTTP {0}")]
    Server(u16),

    #[error("request timed out")]
    Timeout,

    #[error("http error: {0}")]
    Http(String),

    #[error("upstream reported error: {0}")]
    Upstream(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unusable snapshot: {0}")]
    Unusable(String),

    #[error("no more snapshots for {0}")]
    Exhausted(Symbol),
}

impl ProviderError {
    /// Worth another attempt with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Server(_) | ProviderError::Timeout
        )
    }

    /// Server-provided delay hint
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Http(e.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self, symbol: Symbol) -> Result<Snapshot, ProviderError>;
}

/// Upstream payload as received (any key spelling, numbers or numeric strings)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    #[serde(default, alias = "SYMBOL", alias = "index")]
    pub symbol: Option<String>,
    #[serde(default, alias = "ltp", alias = "underlying")]
    pub spot: Option<Value>,
    #[serde(default)]
    pub s1: Option<Value>,
    #[serde(default)]
    pub s2: Option<Value>,
    #[serde(default)]
    pub r1: Option<Value>,
    #[serde(default)]
    pub r2: Option<Value>,
    #[serde(default, alias = "exp")]
    pub expiry: Option<String>,
    #[serde(default, alias = "mv", alias = "MV")]
    pub market_view: Option<String>,
    #[serde(default)]
    pub pcr: Option<Value>,
    #[serde(default, alias = "mp")]
    pub max_pain: Option<Value>,
    #[serde(default, alias = "ce_oi_change")]
    pub ce_oi_delta: Option<Value>,
    #[serde(default, alias = "pe_oi_change")]
    pub pe_oi_delta: Option<Value>,
    #[serde(default, alias = "vol_low")]
    pub volume_low: Option<Value>,
    #[serde(default, alias = "age_sec")]
    pub age_seconds: Option<Value>,
    #[serde(default)]
    pub as_of: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Finite number from a JSON number or numeric string
fn number(v: &Option<Value>) -> Option<f64> {
    let n = match v.as_ref()? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn price(v: &Option<Value>) -> Option<f64> {
    number(v).filter(|p| *p > 0.0)
}

fn flag(v: &Option<Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |x| x != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        _ => false,
    }
}

fn parse_expiry(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    ["%Y-%m-%d", "%d-%b-%Y", "%d%b%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

impl RawSnapshot {
    pub fn symbol(&self) -> Option<Symbol> {
        self.symbol.as_deref().and_then(Symbol::from_str)
    }

    /// Normalize into the typed snapshot.
    ///
    /// Fails only when the payload says the fetch failed or the spot is
    /// unusable; every other bad field just reads as absent.
    pub fn into_snapshot(self, symbol: Symbol, default_source: &str) -> Result<Snapshot, ProviderError> {
        match self.status.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "rate_limited" => {
                return Err(ProviderError::RateLimited { retry_after: None })
            }
            Some(s) if s == "error" => {
                return Err(ProviderError::Upstream(format!("{} status=error", symbol)))
            }
            _ => {}
        }

        let Some(spot) = price(&self.spot) else {
            return Err(ProviderError::Unusable(format!("{} spot missing", symbol)));
        };

        let mut snap = Snapshot::new(symbol, spot);
        snap.s1 = price(&self.s1);
        snap.s2 = price(&self.s2);
        snap.r1 = price(&self.r1);
        snap.r2 = price(&self.r2);
        snap.expiry = self.expiry.as_deref().and_then(parse_expiry);
        snap.market_view = self.market_view.as_deref().and_then(MarketView::parse);
        snap.pcr = number(&self.pcr).filter(|p| *p >= 0.0);
        snap.max_pain = price(&self.max_pain);
        snap.ce_oi_delta = number(&self.ce_oi_delta);
        snap.pe_oi_delta = number(&self.pe_oi_delta);
        snap.volume_low = flag(&self.volume_low);
        snap.age_seconds = number(&self.age_seconds).filter(|a| *a >= 0.0);
        snap.as_of = self
            .as_of
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc));
        snap.source = self
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| default_source.to_string());
        snap.status = SnapshotStatus::Ok;
        Ok(snap)
    }
}
