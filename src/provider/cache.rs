//! Single-flight snapshot cache
//!
//! At most one upstream fetch per symbol is in flight. A caller arriving
//! during a refresh gets the last snapshot, or waits for the running
//! refresh when nothing has been fetched yet.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::warn;

use super::SnapshotProvider;
use crate::types::{Snapshot, Symbol};

#[derive(Default)]
struct Slot {
    last: RwLock<Option<Snapshot>>,
    refresh: Mutex<()>,
}

impl Slot {
    fn last(&self) -> Option<Snapshot> {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct SnapshotCache {
    provider: Arc<dyn SnapshotProvider>,
    slots: RwLock<HashMap<Symbol, Arc<Slot>>>,
}

impl SnapshotCache {
    pub fn new(provider: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            provider,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, symbol: Symbol) -> Arc<Slot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&symbol)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(symbol).or_default())
    }

    /// Last successfully fetched snapshot, without touching upstream
    pub fn last(&self, symbol: Symbol) -> Option<Snapshot> {
        self.slot(symbol).last()
    }

    /// Refresh and return a snapshot; `None` means nothing usable this tick
    pub async fn get(&self, symbol: Symbol) -> Option<Snapshot> {
        let slot = self.slot(symbol);

        let _guard = match slot.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(last) = slot.last() {
                    return Some(last);
                }
                let _wait = slot.refresh.lock().await;
                return slot.last();
            }
        };

        match self.provider.fetch_snapshot(symbol).await {
            Ok(snap) => {
                *slot.last.write().unwrap_or_else(PoisonError::into_inner) = Some(snap.clone());
                Some(snap)
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "📡 [PROVIDER] Snapshot unavailable this tick");
                None
            }
        }
    }
}
