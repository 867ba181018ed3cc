//! JSON-lines replay provider for dry runs

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use super::{ProviderError, RawSnapshot, SnapshotProvider};
use crate::types::{Snapshot, Symbol};

/// Serves queued snapshots per symbol in file order
pub struct StaticSnapshotProvider {
    queues: Mutex<HashMap<Symbol, VecDeque<RawSnapshot>>>,
}

impl StaticSnapshotProvider {
    pub fn from_snapshots(raws: impl IntoIterator<Item = RawSnapshot>) -> Self {
        let mut queues: HashMap<Symbol, VecDeque<RawSnapshot>> = HashMap::new();
        for raw in raws {
            match raw.symbol() {
                Some(sym) => queues.entry(sym).or_default().push_back(raw),
                None => warn!(symbol = ?raw.symbol, "📼 [REPLAY] Snapshot without a known symbol skipped"),
            }
        }
        Self {
            queues: Mutex::new(queues),
        }
    }

    /// One JSON object per line; blank lines and `#` comments are ignored
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut raws = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let raw: RawSnapshot = serde_json::from_str(line)
                .with_context(|| format!("{}:{} is not a snapshot", path.display(), i + 1))?;
            raws.push(raw);
        }
        info!(path = %path.display(), snapshots = raws.len(), "📼 [REPLAY] Snapshots loaded");
        Ok(Self::from_snapshots(raws))
    }

    pub fn remaining(&self, symbol: Symbol) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&symbol)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl SnapshotProvider for StaticSnapshotProvider {
    async fn fetch_snapshot(&self, symbol: Symbol) -> Result<Snapshot, ProviderError> {
        let raw = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&symbol)
            .and_then(VecDeque::pop_front)
            .ok_or(ProviderError::Exhausted(symbol))?;

        let mut snap = raw.into_snapshot(symbol, "replay")?;
        // undated replay rows are treated as fresh
        if snap.age_seconds.is_none() && snap.as_of.is_none() {
            snap.as_of = Some(Utc::now());
        }
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_exhausts() {
        let dir = std::env::temp_dir().join(format!("ocbot_replay_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshots.jsonl");
        fs::write(
            &path,
            "# session replay\n\
             {\"symbol\":\"NIFTY\",\"spot\":100,\"s1\":95,\"age_sec\":10}\n\
             \n\
             {\"symbol\":\"NIFTY\",\"spot\":135}\n\
             {\"symbol\":\"SENSEX\",\"spot\":1}\n",
        )
        .unwrap();

        let provider = StaticSnapshotProvider::from_file(&path).unwrap();
        assert_eq!(provider.remaining(Symbol::Nifty), 2);

        let first = provider.fetch_snapshot(Symbol::Nifty).await.unwrap();
        assert_eq!(first.s1, Some(95.0));
        assert_eq!(first.age_seconds, Some(10.0));

        let second = provider.fetch_snapshot(Symbol::Nifty).await.unwrap();
        assert_eq!(second.spot, 135.0);
        assert!(second.as_of.is_some());

        assert!(matches!(
            provider.fetch_snapshot(Symbol::Nifty).await,
            Err(ProviderError::Exhausted(Symbol::Nifty))
        ));
        assert!(provider.fetch_snapshot(Symbol::FinNifty).await.is_err());

        let _ = fs::remove_dir_all(dir);
    }
}
