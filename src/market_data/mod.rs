pub mod candle_buffer;
pub mod fetch_cache;
pub mod historical;
pub mod live_feed;
pub mod reconnect;
#[cfg(test)]
pub mod testing;

// Re-exports so callers can `use crate::market_data::{Candle, BufferStore, ..}`.
pub use candle_buffer::{normalize_symbol, BufferStore, Candle, SeriesBuffer, SeriesKey, SeriesStatus};
pub use fetch_cache::FetchCache;
pub use historical::HistoricalFetcher;
pub use live_feed::{LiveFeedSession, SessionOptions};
pub use reconnect::ReconnectPolicy;
