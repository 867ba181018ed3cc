//! HTTP snapshot provider with backoff + jitter

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ProviderError, RawSnapshot, SnapshotProvider};
use crate::config::ProviderConfig;
use crate::types::{Snapshot, Symbol};

const BASE_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;
const BACKOFF_JITTER_RATIO: f64 = 0.2;

/// Exponential backoff (1s, 2s, 4s, ... capped at 60s) with ±20% jitter
pub fn backoff_with_jitter_secs(attempt: u32) -> u64 {
    let capped_attempt = attempt.min(16);
    let base = BASE_BACKOFF_SECS.saturating_mul(1u64 << capped_attempt);
    let bounded = base.min(MAX_BACKOFF_SECS).max(1);

    let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    let jitter = 1.0 + unit * BACKOFF_JITTER_RATIO;
    ((bounded as f64) * jitter)
        .round()
        .clamp(1.0, MAX_BACKOFF_SECS as f64) as u64
}

pub struct HttpSnapshotProvider {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpSnapshotProvider {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
        })
    }

    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            Duration::from_secs(cfg.timeout_secs.max(1)),
            cfg.max_retries,
        )
    }

    async fn fetch_once(&self, symbol: Symbol) -> Result<Snapshot, ProviderError> {
        let url = format!("{}/snapshot", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ProviderError::Server(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ProviderError::Http(format!("unexpected status {}", status)));
        }

        let raw: RawSnapshot = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        raw.into_snapshot(symbol, "http")
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn fetch_snapshot(&self, symbol: Symbol) -> Result<Snapshot, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(symbol).await {
                Ok(snap) => {
                    debug!(symbol = %symbol, spot = snap.spot, attempt, "📡 [PROVIDER] Snapshot fetched");
                    return Ok(snap);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let sleep_secs = e
                        .retry_after()
                        .map(|s| s.min(MAX_BACKOFF_SECS))
                        .unwrap_or_else(|| backoff_with_jitter_secs(attempt));
                    attempt += 1;
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        attempt,
                        sleep_secs,
                        "📡 [PROVIDER] Retrying snapshot fetch with backoff"
                    );
                    tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn backoff_stays_inside_jitter_bounds() {
        for attempt in 0..20 {
            let s = backoff_with_jitter_secs(attempt);
            let base = (1u64 << attempt.min(16)).min(MAX_BACKOFF_SECS) as f64;
            assert!(s >= 1 && s <= MAX_BACKOFF_SECS, "attempt {} → {}", attempt, s);
            assert!((s as f64) >= (base * 0.8).floor().max(1.0));
            assert!((s as f64) <= (base * 1.2).ceil().min(MAX_BACKOFF_SECS as f64));
        }
    }

    /// Serves the canned responses in order, one per connection
    async fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                sock.write_all(body.as_bytes()).await.unwrap();
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    fn ok_json(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn retries_rate_limit_honoring_retry_after() {
        let base = serve(vec![
            "HTTP/1.1 429 Too Many Requests\r\nretry-after: 0\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                .to_string(),
            ok_json(r#"{"spot":100,"s1":95,"r1":130,"mv":"bullish","age_sec":10}"#),
        ])
        .await;

        let provider = HttpSnapshotProvider::new(&base, Duration::from_secs(5), 2).unwrap();
        let snap = provider.fetch_snapshot(Symbol::Nifty).await.unwrap();
        assert_eq!(snap.spot, 100.0);
        assert_eq!(snap.s1, Some(95.0));
        assert_eq!(snap.source, "http");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let base = serve(vec![
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
        ])
        .await;
        let provider = HttpSnapshotProvider::new(&base, Duration::from_secs(5), 3).unwrap();
        let err = provider.fetch_snapshot(Symbol::Nifty).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(_)));
    }
}
