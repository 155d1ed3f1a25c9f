// =============================================================================
// Kline WebSocket transport
// =============================================================================
//
// One task per (symbol, timeframe) subscription. Each raw Binance payload is
// normalised into a `StreamMessage` and pushed onto the session channel.
// Read errors and stream end are forwarded as `StreamMessage::Error` and end
// the task; reconnecting is the session's job.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{FeedEvent, KlinePayload, StreamMessage};
use crate::types::Timeframe;

/// Single-stream URL for `symbol`/`timeframe` under `ws_base_url`
/// (e.g. `wss://stream.binance.com:9443/ws`).
pub fn kline_stream_url(ws_base_url: &str, symbol: &str, timeframe: Timeframe) -> String {
    format!(
        "{}/{}@kline_{}",
        ws_base_url.trim_end_matches('/'),
        symbol.to_lowercase(),
        timeframe.code()
    )
}

/// Connect and return the split read half. Fails if the handshake fails, so
/// the caller sees subscription errors synchronously.
pub async fn connect_kline_stream(
    url: &str,
) -> Result<
    futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
> {
    info!(url = %url, "connecting to kline WebSocket");
    let (ws_stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to kline WebSocket {url}"))?;
    let (_write, read) = ws_stream.split();
    Ok(read)
}

/// Drain `read`, forwarding normalised messages until the socket fails, the
/// stream ends, or the receiving session goes away.
pub async fn pump_kline_stream<S>(
    mut read: S,
    symbol: String,
    timeframe: Timeframe,
    events: mpsc::Sender<FeedEvent>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let detail = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_kline_message(&text) {
                Ok(kline) => {
                    let event = FeedEvent {
                        timeframe,
                        message: StreamMessage::Kline { kline },
                    };
                    if events.send(event).await.is_err() {
                        debug!(symbol = %symbol, timeframe = %timeframe, "session gone — stopping transport");
                        return;
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "failed to parse kline message");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break format!("server closed stream: {frame:?}");
            }
            // Ping/Pong/Binary: tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("kline WebSocket read error: {e}"),
            None => break "kline WebSocket stream ended".to_string(),
        }
    };

    warn!(symbol = %symbol, timeframe = %timeframe, detail = %detail, "kline transport stopped");
    let _ = events
        .send(FeedEvent {
            timeframe,
            message: StreamMessage::Error { detail },
        })
        .await;
}

/// Parse a Binance kline push payload, either single-stream
/// (`{ "e": "kline", "k": {..} }`) or combined (`{ "stream": .., "data": {..} }`).
pub fn parse_kline_message(text: &str) -> Result<KlinePayload> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };
    let k = data.get("k").context("missing field k")?;

    Ok(KlinePayload {
        open_time_ms: k["t"].as_i64().context("missing field k.t")?,
        open: parse_f64(&k["o"], "k.o")?,
        high: parse_f64(&k["h"], "k.h")?,
        low: parse_f64(&k["l"], "k.l")?,
        close: parse_f64(&k["c"], "k.c")?,
        volume: parse_f64(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// Binance sends numbers inside klines as JSON strings; accept either form.
pub(crate) fn parse_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite;

    const SINGLE: &str = r#"{
        "e": "kline",
        "s": "BTCUSDT",
        "k": {
            "t": 1700000000000,
            "T": 1700000899999,
            "i": "15m",
            "o": "37000.00",
            "h": "37050.00",
            "l": "36990.00",
            "c": "37020.00",
            "v": "123.456",
            "x": true
        }
    }"#;

    #[test]
    fn url_uses_lowercase_symbol_and_code() {
        assert_eq!(
            kline_stream_url("wss://stream.binance.com:9443/ws/", "BTCUSDT", Timeframe::Hour4),
            "wss://stream.binance.com:9443/ws/btcusdt@kline_4h"
        );
    }

    #[test]
    fn parses_single_stream_payload() {
        let kline = parse_kline_message(SINGLE).expect("should parse");
        assert_eq!(kline.open_time_ms, 1_700_000_000_000);
        assert!((kline.close - 37020.0).abs() < f64::EPSILON);
        assert!(kline.is_closed);
    }

    #[test]
    fn parses_combined_envelope() {
        let json = format!(r#"{{ "stream": "btcusdt@kline_15m", "data": {SINGLE} }}"#);
        let kline = parse_kline_message(&json).expect("should parse");
        assert!((kline.volume - 123.456).abs() < 1e-9);
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_kline_message(r#"{ "e": "kline" }"#).is_err());
        assert!(parse_kline_message(r#"{ "k": { "t": 1, "o": [] } }"#).is_err());
        assert!(parse_kline_message("not json").is_err());
    }

    #[tokio::test]
    async fn pump_forwards_klines_then_reports_end() {
        let frames: Vec<Result<Message, tungstenite::Error>> = vec![
            Ok(Message::Text(SINGLE.to_string())),
            Ok(Message::Text("garbage".to_string())),
            Ok(Message::Ping(Vec::new())),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        pump_kline_stream(
            futures_util::stream::iter(frames),
            "BTCUSDT".into(),
            Timeframe::Min15,
            tx,
        )
        .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.timeframe, Timeframe::Min15);
        assert!(matches!(first.message, StreamMessage::Kline { .. }));

        let last = rx.recv().await.unwrap();
        assert!(matches!(last.message, StreamMessage::Error { ref detail } if detail.contains("ended")));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pump_reports_read_error() {
        let frames: Vec<Result<Message, tungstenite::Error>> =
            vec![Err(tungstenite::Error::ConnectionClosed)];
        let (tx, mut rx) = mpsc::channel(8);
        pump_kline_stream(futures_util::stream::iter(frames), "ETHUSDT".into(), Timeframe::Min5, tx).await;
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev.message, StreamMessage::Error { ref detail } if detail.contains("read error")));
    }
}
