// =============================================================================
// Binance Client — public kline history (REST) and kline push streams (WS)
// =============================================================================
//
// SECURITY: The API key is never logged or serialised. It is sent as the
// X-MBX-APIKEY header when configured; kline endpoints do not need a
// signature.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::stream::{connect_kline_stream, kline_stream_url, pump_kline_stream};
use super::{ExchangeClient, FeedEvent, KlineRow, SubscriptionHandle};
use crate::types::Timeframe;

pub const DEFAULT_REST_BASE_URL: &str = "https://api.binance.com";
pub const DEFAULT_WS_BASE_URL: &str = "wss://stream.binance.com:9443/ws";

/// Largest page the klines endpoint serves.
pub const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance market-data client.
#[derive(Clone)]
pub struct BinanceClient {
    rest_base_url: String,
    ws_base_url: String,
    has_api_key: bool,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client against the given endpoints.
    ///
    /// # Arguments
    /// * `api_key`       — optional Binance API key (sent as a header only).
    /// * `rest_base_url` — e.g. `https://api.binance.com`.
    /// * `ws_base_url`   — e.g. `wss://stream.binance.com:9443/ws`.
    pub fn new(
        api_key: Option<&str>,
        rest_base_url: impl Into<String>,
        ws_base_url: impl Into<String>,
    ) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        let mut has_api_key = false;
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let val = HeaderValue::from_str(key).context("API key is not a valid header value")?;
            default_headers.insert("X-MBX-APIKEY", val);
            has_api_key = true;
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let rest_base_url = rest_base_url.into();
        debug!(base_url = %rest_base_url, "BinanceClient initialised");

        Ok(Self {
            rest_base_url: rest_base_url.trim_end_matches('/').to_string(),
            ws_base_url: ws_base_url.into(),
            has_api_key,
            client,
        })
    }

    /// Client against the public production endpoints.
    pub fn public() -> Result<Self> {
        Self::new(None, DEFAULT_REST_BASE_URL, DEFAULT_WS_BASE_URL)
    }

    fn klines_url(&self, symbol: &str, timeframe: Timeframe, start_ms: i64, end_ms: i64) -> String {
        format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.rest_base_url,
            symbol.to_uppercase(),
            timeframe.code(),
            start_ms,
            end_ms,
            MAX_KLINES_PER_REQUEST
        )
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    /// GET /api/v3/klines (public).
    ///
    /// Rows are returned as-is; array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::bulk_klines")]
    async fn bulk_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRow>> {
        let url = self.klines_url(symbol, timeframe, start_ms, end_ms);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let raw = match body {
            serde_json::Value::Array(rows) => rows,
            _ => anyhow::bail!("klines response is not an array"),
        };

        let rows = raw
            .into_iter()
            .map(|entry| match entry {
                serde_json::Value::Array(row) => Ok(row),
                other => Err(anyhow::anyhow!("kline entry is not an array: {other}")),
            })
            .collect::<Result<Vec<KlineRow>>>()?;

        debug!(symbol, timeframe = %timeframe, count = rows.len(), "klines fetched");
        Ok(rows)
    }

    #[instrument(skip(self, events), name = "binance::subscribe_kline_stream")]
    async fn subscribe_kline_stream(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<SubscriptionHandle> {
        let url = kline_stream_url(&self.ws_base_url, symbol, timeframe);
        let read = connect_kline_stream(&url).await?;
        debug!(symbol, timeframe = %timeframe, "kline WebSocket connected");

        let task = tokio::spawn(pump_kline_stream(
            read,
            symbol.to_uppercase(),
            timeframe,
            events,
        ));
        Ok(SubscriptionHandle::new(task))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &if self.has_api_key { "<redacted>" } else { "<none>" })
            .field("rest_base_url", &self.rest_base_url)
            .field("ws_base_url", &self.ws_base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn klines_url_carries_window_and_interval() {
        let client = BinanceClient::new(None, "https://api.binance.com/", DEFAULT_WS_BASE_URL).unwrap();
        let url = client.klines_url("btcusdt", Timeframe::Min15, 1_000, 2_000);
        assert_eq!(
            url,
            "https://api.binance.com/api/v3/klines?symbol=BTCUSDT&interval=15m&startTime=1000&endTime=2000&limit=1000"
        );
    }

    #[test]
    fn debug_redacts_api_key() {
        let client =
            BinanceClient::new(Some("super-secret"), DEFAULT_REST_BASE_URL, DEFAULT_WS_BASE_URL).unwrap();
        let dbg = format!("{client:?}");
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("super-secret"));
    }

    #[test]
    fn rejects_unprintable_api_key() {
        assert!(BinanceClient::new(Some("bad\nkey"), DEFAULT_REST_BASE_URL, DEFAULT_WS_BASE_URL).is_err());
    }
}
