// =============================================================================
// Exchange collaborator seam
// =============================================================================
//
// The ingestion core only talks to the exchange through `ExchangeClient`.
// `BinanceClient` is the production implementation; tests script their own.
//
// Live data crosses an explicit message-passing boundary: a transport task
// owned by the `SubscriptionHandle` pushes `FeedEvent`s onto a bounded channel
// that the live-feed worker drains. The transport never touches the buffers.
// =============================================================================

pub mod client;
pub mod rate_limit;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::market_data::Candle;
use crate::types::Timeframe;

pub use client::BinanceClient;
pub use rate_limit::{RequestThrottle, ThrottleSnapshot};

/// One raw row from the bulk kline endpoint:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub type KlineRow = Vec<serde_json::Value>;

/// Kline body of a push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlinePayload {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl KlinePayload {
    pub fn to_candle(&self) -> Candle {
        Candle::new(
            self.open_time_ms,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

/// Normalised push message, tagged on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamMessage {
    Kline { kline: KlinePayload },
    /// Transport-level failure or stream end.
    Error { detail: String },
}

/// A push message together with the timeframe of the subscription it came
/// from.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub timeframe: Timeframe,
    pub message: StreamMessage,
}

/// Owns the transport task of one push subscription. Closing or dropping the
/// handle tears the subscription down.
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn close(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Everything the ingestion core needs from an exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Klines with open-time in `[start_ms, end_ms]`, ascending, at most one
    /// page (`MAX_KLINES_PER_REQUEST` rows). Each row carries its close time
    /// at index 6; when `end_ms` is "now" the last row is usually the
    /// interval still in progress, and callers that only want durable data
    /// must drop it.
    async fn bulk_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<Vec<KlineRow>>;

    /// Open a push subscription that forwards every message to `events`.
    async fn subscribe_kline_stream(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        events: mpsc::Sender<FeedEvent>,
    ) -> anyhow::Result<SubscriptionHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_message_wire_shape() {
        let json = r#"{
            "kind": "kline",
            "kline": {
                "open_time_ms": 1700000000000,
                "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5,
                "volume": 3.0, "is_closed": true
            }
        }"#;
        let msg: StreamMessage = serde_json::from_str(json).unwrap();
        match msg {
            StreamMessage::Kline { kline } => {
                assert!(kline.is_closed);
                assert_eq!(kline.to_candle().close, 1.5);
            }
            other => panic!("unexpected message {other:?}"),
        }

        let err: StreamMessage =
            serde_json::from_str(r#"{ "kind": "error", "detail": "socket reset" }"#).unwrap();
        assert_eq!(
            err,
            StreamMessage::Error {
                detail: "socket reset".into()
            }
        );
    }

    #[tokio::test]
    async fn dropping_handle_aborts_transport() {
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        });
        let handle = SubscriptionHandle::new(task);
        assert!(!handle.is_finished());
        drop(handle);
        // The transport future (and the sender it owns) is dropped on abort.
        assert!(alive_rx.await.is_err());
    }
}
