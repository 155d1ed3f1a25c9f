// =============================================================================
// candle-feed — market-data ingestion and buffering
// =============================================================================
//
// Rate-limited historical backfill, per-series ring buffers, a short-lived
// fetch cache and self-healing live kline sessions. Downstream consumers
// (signal evaluation, predictors) link this crate and read from
// `market_data::BufferStore`.
// =============================================================================

pub mod binance;
pub mod error;
pub mod market_data;
pub mod runtime_config;
pub mod types;

pub use error::{IngestError, IngestResult};
pub use types::{FeedState, Timeframe};
