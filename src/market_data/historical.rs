// =============================================================================
// Historical Fetcher — throttled bulk kline fetch with completeness check
// =============================================================================
//
// Flow for one fetch:
//   1. Serve from the fetch cache when allowed and fresh (no throttle, no I/O).
//   2. Acquire a throttle permit for the outbound call.
//   3. Pull [now - lookback, now] from the exchange and convert rows. The
//      window is capped at one request page so the newest intervals come
//      back, and the interval still in progress is dropped.
//   4. Reject the whole batch if any spacing exceeds tolerance × timeframe.
//      Indicator math over a gapped series is silently wrong, so nothing is
//      merged in that case.
//   5. Append into the series buffer and write through to the cache.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use super::candle_buffer::{BufferStore, Candle, SeriesKey};
use super::fetch_cache::FetchCache;
use crate::binance::client::MAX_KLINES_PER_REQUEST;
use crate::binance::stream::parse_f64;
use crate::binance::{ExchangeClient, KlineRow, RequestThrottle};
use crate::error::{Gap, GapReport, IngestError, IngestResult};
use crate::types::{now_ms, Timeframe};

/// Spacing above `expected × DEFAULT_GAP_TOLERANCE` counts as a gap.
pub const DEFAULT_GAP_TOLERANCE: f64 = 1.1;
/// Number of individual gaps carried in a [`GapReport`].
const REPORTED_GAPS: usize = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HistoricalFetcher {
    client: Option<Arc<dyn ExchangeClient>>,
    throttle: Arc<RequestThrottle>,
    store: Arc<BufferStore>,
    cache: Arc<FetchCache>,
    acquire_timeout: Duration,
    gap_tolerance: f64,
}

impl HistoricalFetcher {
    pub fn new(
        client: Option<Arc<dyn ExchangeClient>>,
        throttle: Arc<RequestThrottle>,
        store: Arc<BufferStore>,
        cache: Arc<FetchCache>,
    ) -> Self {
        Self {
            client,
            throttle,
            store,
            cache,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_gap_tolerance(mut self, tolerance: f64) -> Self {
        self.gap_tolerance = tolerance.max(1.0);
        self
    }

    pub fn store(&self) -> &Arc<BufferStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<FetchCache> {
        &self.cache
    }

    /// Fetch `lookback` worth of history using the configured throttle budget.
    pub async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: Duration,
        use_cache: bool,
    ) -> IngestResult<Vec<Candle>> {
        self.fetch_with_timeout(symbol, timeframe, lookback, use_cache, self.acquire_timeout)
            .await
    }

    /// As [`fetch`](Self::fetch), waiting at most `acquire_timeout` for a
    /// throttle permit.
    pub async fn fetch_with_timeout(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback: Duration,
        use_cache: bool,
        acquire_timeout: Duration,
    ) -> IngestResult<Vec<Candle>> {
        let client = self.client.as_ref().ok_or(IngestError::ClientUnavailable)?;
        let key = SeriesKey::new(symbol, timeframe);

        if use_cache {
            if let Some(hit) = self.cache.get(&key) {
                debug!(key = %key, count = hit.len(), "fetch served from cache");
                return Ok(hit.as_ref().clone());
            }
        }

        if !self.throttle.acquire(acquire_timeout).await {
            return Err(IngestError::RateLimitTimeout {
                timeout: acquire_timeout,
            });
        }

        let end_ms = now_ms();
        let (start_ms, clamped) = request_window(timeframe, lookback, end_ms);
        if clamped {
            debug!(
                key = %key,
                lookback_ms = lookback.as_millis() as u64,
                start_ms,
                "lookback capped to one request page"
            );
        }
        let rows = client
            .bulk_klines(&key.symbol, timeframe, start_ms, end_ms)
            .await?;
        let candles = rows_to_candles(&rows, timeframe, end_ms)?;

        if let Err(report) = validate_completeness(&key, &candles, self.gap_tolerance) {
            warn!(
                key = %key,
                gaps = report.total,
                fetched = candles.len(),
                "rejected fetched history with gaps"
            );
            return Err(IngestError::DataGap(report));
        }

        let appended = self.store.extend(&key, &candles);
        self.cache.put(key.clone(), candles.clone());
        info!(
            key = %key,
            fetched = candles.len(),
            appended,
            buffered = self.store.len(&key),
            "historical klines merged"
        );
        Ok(candles)
    }
}

impl std::fmt::Debug for HistoricalFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalFetcher")
            .field("client", &self.client.is_some())
            .field("acquire_timeout", &self.acquire_timeout)
            .field("gap_tolerance", &self.gap_tolerance)
            .finish()
    }
}

/// Start of the request window ending at `end_ms`: `end_ms - lookback`,
/// moved forward so that a single page covers it. The second value is true
/// when the lookback had to be shortened.
pub fn request_window(timeframe: Timeframe, lookback: Duration, end_ms: i64) -> (i64, bool) {
    let requested = end_ms - lookback.as_millis() as i64;
    let page_start = end_ms - MAX_KLINES_PER_REQUEST as i64 * timeframe.as_millis();
    if page_start > requested {
        (page_start, true)
    } else {
        (requested, false)
    }
}

/// Convert raw exchange rows into closed candles.
///
/// Rows whose close time is at or after `now_ms` belong to the interval
/// still in progress and are left out. A short row, an unparseable number or
/// an inconsistent OHLCV fails the whole batch.
pub fn rows_to_candles(
    rows: &[KlineRow],
    timeframe: Timeframe,
    now_ms: i64,
) -> IngestResult<Vec<Candle>> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 6 {
            return Err(
                anyhow::anyhow!("kline row has {} columns, expected at least 6", row.len()).into(),
            );
        }
        let open_time = row[0]
            .as_i64()
            .context("kline row open time is not an integer")?;
        let close_time = row
            .get(6)
            .and_then(|v| v.as_i64())
            .unwrap_or(open_time + timeframe.as_millis() - 1);
        if close_time >= now_ms {
            debug!(open_time, close_time, "skipping kline still in progress");
            continue;
        }
        let candle = Candle::new(
            open_time,
            parse_f64(&row[1], "open")?,
            parse_f64(&row[2], "high")?,
            parse_f64(&row[3], "low")?,
            parse_f64(&row[4], "close")?,
            parse_f64(&row[5], "volume")?,
        );
        if !candle.is_well_formed() {
            return Err(anyhow::anyhow!("kline row at {open_time} has inconsistent OHLCV").into());
        }
        candles.push(candle);
    }
    Ok(candles)
}

/// Check that consecutive open-times are at most `tolerance ×` the
/// timeframe length apart.
pub fn validate_completeness(
    key: &SeriesKey,
    candles: &[Candle],
    tolerance: f64,
) -> Result<(), GapReport> {
    let expected = key.timeframe.as_millis();
    let limit = expected as f64 * tolerance;

    let offending: Vec<Gap> = candles
        .windows(2)
        .filter_map(|pair| {
            let delta = pair[1].open_time - pair[0].open_time;
            (delta as f64 > limit).then_some(Gap {
                from_ms: pair[0].open_time,
                to_ms: pair[1].open_time,
                delta_ms: delta,
            })
        })
        .collect();

    if offending.is_empty() {
        return Ok(());
    }
    Err(GapReport {
        key: key.clone(),
        expected_ms: expected,
        total: offending.len(),
        gaps: offending.into_iter().take(REPORTED_GAPS).collect(),
    })
}
