use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{now_ms, Timeframe};

/// Default number of candles retained per series.
pub const DEFAULT_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single closed OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Interval open-time, ms since the UNIX epoch.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Positive prices, a high/low envelope around open and close, and a
    /// non-negative volume.
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

/// Composite key that identifies one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// Symbols are trimmed and upper-cased so `btcusdt` and `BTCUSDT` name
    /// the same series.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: normalize_symbol(&symbol.into()),
            timeframe,
        }
    }
}

/// Canonical exchange spelling of a symbol.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Per-timeframe health line returned by [`BufferStore::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStatus {
    pub present: bool,
    pub count: usize,
    pub stale: bool,
    pub latest_close: Option<f64>,
}

// ---------------------------------------------------------------------------
// SeriesBuffer -- bounded FIFO for one (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Fixed-capacity, strictly time-ascending sequence of candles.
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    timeframe: Timeframe,
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl SeriesBuffer {
    pub fn new(timeframe: Timeframe, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeframe,
            capacity,
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// Append `candle`, evicting the oldest entry when at capacity.
    ///
    /// Returns `false` (and leaves the buffer untouched) when the candle's
    /// open-time is not newer than the newest retained candle.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.open_time <= last.open_time {
                return false;
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn newest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Last `count` candles, oldest first.
    pub fn latest(&self, count: usize) -> Vec<Candle> {
        let start = self.candles.len().saturating_sub(count);
        self.candles.iter().skip(start).copied().collect()
    }

    /// The candle whose interval contains `ts_ms`, otherwise the candle with
    /// the nearest open-time.
    pub fn at_or_nearest(&self, ts_ms: i64) -> Option<Candle> {
        let span = self.timeframe.as_millis();
        // First candle opening after ts_ms; the containing one, if any, is
        // right before it.
        let idx = self.candles.partition_point(|c| c.open_time <= ts_ms);
        if idx > 0 {
            let prev = self.candles[idx - 1];
            if ts_ms < prev.open_time + span {
                return Some(prev);
            }
        }

        let before = idx.checked_sub(1).map(|i| self.candles[i]);
        let after = self.candles.get(idx).copied();
        match (before, after) {
            (Some(b), Some(a)) => {
                if (ts_ms - b.open_time).abs() <= (a.open_time - ts_ms).abs() {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        }
    }

    /// Whether the newest candle opened more than `max_age` before `now_ms`.
    /// An empty buffer is always stale.
    pub fn is_stale_at(&self, now_ms: i64, max_age: Duration) -> bool {
        match self.candles.back() {
            Some(last) => now_ms - last.open_time > max_age.as_millis() as i64,
            None => true,
        }
    }

    /// Drop candles that opened before `cutoff_ms`. Returns how many went.
    pub fn remove_before(&mut self, cutoff_ms: i64) -> usize {
        let before = self.candles.len();
        while self.candles.front().is_some_and(|c| c.open_time < cutoff_ms) {
            self.candles.pop_front();
        }
        before - self.candles.len()
    }
}

// ---------------------------------------------------------------------------
// BufferStore -- keyed collection of SeriesBuffers
// ---------------------------------------------------------------------------

/// Thread-safe map of `(symbol, timeframe)` to [`SeriesBuffer`].
///
/// The outer lock only guards the key map; each buffer carries its own mutex
/// so writers on unrelated series never contend. Buffers are created on first
/// access and are never removed.
pub struct BufferStore {
    buffers: RwLock<HashMap<SeriesKey, Arc<Mutex<SeriesBuffer>>>>,
    capacity: usize,
}

impl BufferStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffer(&self, key: &SeriesKey) -> Arc<Mutex<SeriesBuffer>> {
        if let Some(buf) = self.buffers.read().get(key) {
            return buf.clone();
        }
        let mut map = self.buffers.write();
        map.entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, capacity = self.capacity, "series buffer created");
                Arc::new(Mutex::new(SeriesBuffer::new(key.timeframe, self.capacity)))
            })
            .clone()
    }

    fn existing(&self, key: &SeriesKey) -> Option<Arc<Mutex<SeriesBuffer>>> {
        self.buffers.read().get(key).cloned()
    }

    // -- writes ---------------------------------------------------------------

    /// Append one candle. Returns `false` for duplicate or out-of-order
    /// open-times, which are dropped.
    pub fn append(&self, key: &SeriesKey, candle: Candle) -> bool {
        let buf = self.buffer(key);
        let mut ring = buf.lock();
        let previous = ring.newest().map(|c| c.open_time);
        let appended = ring.push(candle);
        drop(ring);

        match (appended, previous) {
            (false, _) => {
                debug!(
                    key = %key,
                    open_time = candle.open_time,
                    "dropped duplicate or out-of-order candle"
                );
            }
            (true, Some(prev)) => {
                let delta = candle.open_time - prev;
                let expected = key.timeframe.as_millis();
                if delta > expected {
                    warn!(
                        key = %key,
                        from = prev,
                        to = candle.open_time,
                        missing = delta / expected - 1,
                        "series resumed after a gap"
                    );
                }
            }
            (true, None) => {}
        }
        appended
    }

    /// Append a batch under a single lock acquisition. Returns the number of
    /// candles actually appended.
    pub fn extend(&self, key: &SeriesKey, candles: &[Candle]) -> usize {
        let buf = self.buffer(key);
        let mut ring = buf.lock();
        let appended = candles.iter().filter(|c| ring.push(**c)).count();
        if appended < candles.len() {
            debug!(
                key = %key,
                skipped = candles.len() - appended,
                "skipped candles already present in buffer"
            );
        }
        appended
    }

    // -- reads ----------------------------------------------------------------

    /// The most recent `count` candles, oldest first.
    pub fn latest(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        self.existing(key)
            .map(|buf| buf.lock().latest(count))
            .unwrap_or_default()
    }

    /// The most recent `count` close prices, oldest first.
    pub fn closes(&self, key: &SeriesKey, count: usize) -> Vec<f64> {
        self.latest(key, count).iter().map(|c| c.close).collect()
    }

    pub fn last_close(&self, key: &SeriesKey) -> Option<f64> {
        self.existing(key)
            .and_then(|buf| buf.lock().newest().map(|c| c.close))
    }

    pub fn len(&self, key: &SeriesKey) -> usize {
        self.existing(key).map_or(0, |buf| buf.lock().len())
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.buffers.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// For each timeframe, the candle of `symbol` covering `reference_ms`,
    /// else the nearest one, else `None` when that series is empty.
    pub fn synchronized_snapshot(
        &self,
        symbol: &str,
        reference_ms: i64,
        timeframes: &[Timeframe],
    ) -> BTreeMap<Timeframe, Option<Candle>> {
        timeframes
            .iter()
            .map(|tf| {
                let key = SeriesKey::new(symbol, *tf);
                let candle = self
                    .existing(&key)
                    .and_then(|buf| buf.lock().at_or_nearest(reference_ms));
                (*tf, candle)
            })
            .collect()
    }

    // -- health ---------------------------------------------------------------

    /// Stale when empty or when the newest candle is older than `max_age`
    /// (default: two timeframe lengths).
    pub fn is_stale(&self, key: &SeriesKey, max_age: Option<Duration>) -> bool {
        self.is_stale_at(key, now_ms(), max_age)
    }

    pub fn is_stale_at(&self, key: &SeriesKey, now_ms: i64, max_age: Option<Duration>) -> bool {
        let max_age = max_age.unwrap_or_else(|| key.timeframe.duration() * 2);
        self.existing(key)
            .map_or(true, |buf| buf.lock().is_stale_at(now_ms, max_age))
    }

    pub fn status(&self, symbol: &str, timeframes: &[Timeframe]) -> BTreeMap<Timeframe, SeriesStatus> {
        let now = now_ms();
        timeframes
            .iter()
            .map(|tf| {
                let key = SeriesKey::new(symbol, *tf);
                let status = match self.existing(&key) {
                    Some(buf) => {
                        let ring = buf.lock();
                        SeriesStatus {
                            present: !ring.is_empty(),
                            count: ring.len(),
                            stale: ring.is_stale_at(now, tf.duration() * 2),
                            latest_close: ring.newest().map(|c| c.close),
                        }
                    }
                    None => SeriesStatus {
                        present: false,
                        count: 0,
                        stale: true,
                        latest_close: None,
                    },
                };
                (*tf, status)
            })
            .collect()
    }

    // -- maintenance ----------------------------------------------------------

    /// Trim every buffer of candles older than `max_age`. Buffers themselves
    /// are kept. Returns the number of candles removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        self.cleanup_before(now_ms() - max_age.as_millis() as i64)
    }

    pub fn cleanup_before(&self, cutoff_ms: i64) -> usize {
        let buffers: Vec<_> = self.buffers.read().values().cloned().collect();
        let removed: usize = buffers
            .iter()
            .map(|buf| buf.lock().remove_before(cutoff_ms))
            .sum();
        if removed > 0 {
            debug!(removed, cutoff_ms, "trimmed aged candles");
        }
        removed
    }
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
