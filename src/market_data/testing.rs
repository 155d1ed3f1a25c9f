//! Scripted exchange used by the fetcher and live-feed tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::binance::{ExchangeClient, FeedEvent, KlinePayload, KlineRow, StreamMessage, SubscriptionHandle};
use crate::types::{now_ms, Timeframe};

/// `n` gap-free closed rows ending at the last fully closed interval.
pub fn candle_rows(n: usize, timeframe: Timeframe) -> Vec<KlineRow> {
    gapped_candle_rows(n, timeframe, 1)
}

/// `n` closed rows whose last spacing is `last_spacing ×` the timeframe length.
pub fn gapped_candle_rows(n: usize, timeframe: Timeframe, last_spacing: i64) -> Vec<KlineRow> {
    let step = timeframe.as_millis();
    let newest = current_open_time(timeframe) - step;
    let extra = (last_spacing - 1).max(0) * step;
    (0..n as i64)
        .map(|i| {
            let from_end = n as i64 - 1 - i;
            let mut open_time = newest - from_end * step;
            if from_end > 0 {
                open_time -= extra;
            }
            kline_row(open_time, step, 100.0 + i as f64)
        })
        .collect()
}

/// Open-time of the interval currently in progress.
pub fn current_open_time(timeframe: Timeframe) -> i64 {
    let step = timeframe.as_millis();
    now_ms() / step * step
}

/// Row for the interval still in progress, as the exchange returns it when
/// the request window ends at `now`.
pub fn open_interval_row(timeframe: Timeframe, price: f64) -> KlineRow {
    kline_row(current_open_time(timeframe), timeframe.as_millis(), price)
}

fn kline_row(open_time: i64, step: i64, price: f64) -> KlineRow {
    vec![
        serde_json::json!(open_time),
        serde_json::json!(format!("{price}")),
        serde_json::json!(format!("{}", price + 2.0)),
        serde_json::json!(format!("{}", price - 2.0)),
        serde_json::json!(format!("{}", price + 1.0)),
        serde_json::json!("5.0"),
        serde_json::json!(open_time + step - 1),
    ]
}

pub fn kline(open_time_ms: i64, close: f64, is_closed: bool) -> StreamMessage {
    StreamMessage::Kline {
        kline: KlinePayload {
            open_time_ms,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            is_closed,
        },
    }
}

#[derive(Default)]
struct SubscribePlan {
    fail_next: usize,
    fail_always: bool,
}

#[derive(Default)]
pub struct MockExchange {
    rows: Mutex<Vec<KlineRow>>,
    bulk_error: Mutex<Option<String>>,
    bulk_calls: AtomicUsize,
    last_window: Mutex<Option<(i64, i64)>>,
    last_symbol: Mutex<Option<String>>,
    plan: Mutex<SubscribePlan>,
    subscribe_calls: Mutex<Vec<(Timeframe, Instant)>>,
    senders: Mutex<HashMap<Timeframe, mpsc::Sender<FeedEvent>>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rows(&self, rows: Vec<KlineRow>) {
        *self.rows.lock() = rows;
    }

    pub fn fail_bulk(&self, message: &str) {
        *self.bulk_error.lock() = Some(message.to_string());
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn last_window(&self) -> Option<(i64, i64)> {
        *self.last_window.lock()
    }

    pub fn last_symbol(&self) -> Option<String> {
        self.last_symbol.lock().clone()
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.plan.lock().fail_next = n;
    }

    pub fn fail_all_subscribes(&self, fail: bool) {
        self.plan.lock().fail_always = fail;
    }

    pub fn subscribe_calls(&self) -> Vec<(Timeframe, Instant)> {
        self.subscribe_calls.lock().clone()
    }

    /// Push a message through the most recent subscription for `timeframe`.
    pub async fn emit(&self, timeframe: Timeframe, message: StreamMessage) {
        let tx = self.senders.lock().get(&timeframe).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(FeedEvent { timeframe, message }).await;
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn bulk_klines(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<Vec<KlineRow>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_window.lock() = Some((start_ms, end_ms));
        *self.last_symbol.lock() = Some(symbol.to_string());
        if let Some(msg) = self.bulk_error.lock().clone() {
            anyhow::bail!(msg);
        }
        Ok(self.rows.lock().clone())
    }

    async fn subscribe_kline_stream(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        events: mpsc::Sender<FeedEvent>,
    ) -> anyhow::Result<SubscriptionHandle> {
        self.subscribe_calls.lock().push((timeframe, Instant::now()));
        {
            let mut plan = self.plan.lock();
            if plan.fail_always {
                anyhow::bail!("connection refused");
            }
            if plan.fail_next > 0 {
                plan.fail_next -= 1;
                anyhow::bail!("connection refused");
            }
        }
        self.senders.lock().insert(timeframe, events);
        Ok(SubscriptionHandle::new(tokio::spawn(std::future::pending::<()>())))
    }
}
