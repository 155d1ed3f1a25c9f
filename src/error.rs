// =============================================================================
// Error taxonomy for the ingestion core
// =============================================================================
//
// Live-feed transport failures never surface here: they are absorbed by the
// session and drive reconnection. Everything a caller can observe from a
// fetch or a session start is one of these variants.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::market_data::SeriesKey;
use crate::types::FeedState;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// No exchange client was configured for this component.
    #[error("no exchange client configured")]
    ClientUnavailable,

    /// The request throttle did not grant a permit within the caller's budget.
    #[error("rate-limit permit not granted within {timeout:?}")]
    RateLimitTimeout { timeout: Duration },

    /// The exchange call failed. Display and source are the upstream error's.
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),

    /// Fetched history contains unacceptable gaps; nothing was merged.
    #[error("{0}")]
    DataGap(GapReport),

    #[error("unknown timeframe '{0}'")]
    InvalidTimeframe(String),

    #[error("live feed for {symbol} is {state}; stop it before starting again")]
    SessionState { symbol: String, state: FeedState },
}

/// One spacing violation between two consecutive candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Open-time of the candle before the gap.
    pub from_ms: i64,
    /// Open-time of the candle after the gap.
    pub to_ms: i64,
    pub delta_ms: i64,
}

/// Details of a rejected fetch: total offending gaps plus the first few.
#[derive(Debug, Clone, PartialEq)]
pub struct GapReport {
    pub key: SeriesKey,
    pub expected_ms: i64,
    pub total: usize,
    pub gaps: Vec<Gap>,
}

impl std::fmt::Display for GapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} gap(s) in {} history (expected spacing {} ms)",
            self.total, self.key, self.expected_ms
        )?;
        for gap in &self.gaps {
            write!(f, "; {} -> {} ({} ms)", gap.from_ms, gap.to_ms, gap.delta_ms)?;
        }
        if self.total > self.gaps.len() {
            write!(f, "; ... {} more", self.total - self.gaps.len())?;
        }
        Ok(())
    }
}
