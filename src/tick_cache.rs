// =============================================================================
// TickCache — concurrent map from (segment, security_id) to the latest tick
// =============================================================================
//
// Generalizes the teacher's `market_data::CandleBuffer` (a `RwLock<HashMap>`
// ring buffer) to a lock-free concurrent map: the tick hot path sees one
// write per key per incoming message and many concurrent readers from the
// decision loop, which favors `DashMap` over a single global `RwLock`.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::money::Money;
use crate::store::DurableStore;
use crate::types::{SecurityId, Segment, Tick};

#[derive(Debug, Clone, Copy, Default)]
pub struct TickCacheStats {
    pub puts: u64,
    pub rejected_stale: u64,
    pub entries: usize,
}

type Key = (Segment, SecurityId);

pub struct TickCache {
    entries: DashMap<Key, (Tick, Instant)>,
    store: Option<Arc<dyn DurableStore>>,
    puts: std::sync::atomic::AtomicU64,
    rejected_stale: std::sync::atomic::AtomicU64,
}

impl TickCache {
    pub fn new(store: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            puts: std::sync::atomic::AtomicU64::new(0),
            rejected_stale: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Insert `tick` unless a newer (by `server_timestamp`) tick is already
    /// stored for the same key, in which case this is a no-op. Returns
    /// `true` if the tick was applied.
    pub fn put(&self, tick: Tick) -> bool {
        let key = (tick.segment.clone(), tick.security_id);
        let applied = match self.entries.get(&key) {
            Some(existing) if existing.0.server_timestamp > tick.server_timestamp => false,
            _ => true,
        };

        if !applied {
            self.rejected_stale
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(
                segment = %key.0,
                security_id = %key.1,
                incoming_ts = tick.server_timestamp,
                "dropped out-of-order tick"
            );
            return false;
        }

        self.puts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let received_at = Instant::now();
        let to_store = tick.clone();
        self.entries.insert(key, (tick, received_at));

        if let Some(store) = &self.store {
            let store = store.clone();
            tokio::spawn(async move {
                let _ = store.write_through_tick(&to_store).await;
            });
        }

        true
    }

    pub fn get(&self, segment: &str, security_id: SecurityId) -> Option<Tick> {
        self.entries
            .get(&(segment.to_string(), security_id))
            .map(|entry| entry.0.clone())
    }

    pub fn ltp(&self, segment: &str, security_id: SecurityId) -> Option<Money> {
        self.get(segment, security_id).map(|t| t.ltp)
    }

    /// `true` iff the tick for this key was received within `max_age`.
    pub fn fresh(&self, segment: &str, security_id: SecurityId, max_age: Duration) -> bool {
        self.entries
            .get(&(segment.to_string(), security_id))
            .map(|entry| entry.1.elapsed() <= max_age)
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> TickCacheStats {
        TickCacheStats {
            puts: self.puts.load(std::sync::atomic::Ordering::Relaxed),
            rejected_stale: self.rejected_stale.load(std::sync::atomic::Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
