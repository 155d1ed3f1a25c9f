// =============================================================================
// Fetch Cache — short-lived memo of bulk kline fetches
// =============================================================================
//
// Several consumers refreshing the same (symbol, timeframe) within a few
// seconds should cost one REST call, not several. Entries are written through
// by the historical fetcher and served until `ttl` elapses or they are
// invalidated. The live feed never reads from here.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::candle_buffer::{Candle, SeriesKey};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Arc<Vec<Candle>>,
    fetched_at: Instant,
}

/// Per-series time-to-live cache of the latest fetch result.
pub struct FetchCache {
    entries: RwLock<HashMap<SeriesKey, CacheEntry>>,
    ttl: Duration,
}

impl FetchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached payload, if one exists and is younger than the TTL.
    pub fn get(&self, key: &SeriesKey) -> Option<Arc<Vec<Candle>>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.payload.clone())
        } else {
            None
        }
    }

    /// Store `payload` for `key`, stamped with the current time.
    pub fn put(&self, key: SeriesKey, payload: Vec<Candle>) -> Arc<Vec<Candle>> {
        let payload = Arc::new(payload);
        self.entries.write().insert(
            key,
            CacheEntry {
                payload: payload.clone(),
                fetched_at: Instant::now(),
            },
        );
        payload
    }

    /// Age of the entry for `key`, valid or not.
    pub fn age(&self, key: &SeriesKey) -> Option<Duration> {
        self.entries.read().get(key).map(|e| e.fetched_at.elapsed())
    }

    pub fn invalidate(&self, key: &SeriesKey) {
        if self.entries.write().remove(key).is_some() {
            debug!(key = %key, "fetch cache entry invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        let n = entries.len();
        entries.clear();
        debug!(entries = n, "fetch cache cleared");
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.fetched_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for FetchCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
