// =============================================================================
// Live Feed Session — push subscriptions for one symbol
// =============================================================================
//
// State machine:
//   Disconnected ─start─▶ Connecting ─▶ Connected ─error─▶ Reconnecting
//   Reconnecting ─▶ Connected | Failed
//   any state ─stop─▶ Disconnected
//
// Transport tasks (one per timeframe, owned by `SubscriptionHandle`s) push
// `FeedEvent`s onto a bounded channel. A single worker task drains it and is
// the only live writer into the `BufferStore`. Reconnection runs on its own
// spawned task so the worker keeps draining while backoff sleeps.
//
// Only closed klines are durable; in-progress updates are discarded. The
// external candle callback fires once per appended candle and is isolated
// from the session: a panic inside it is caught and logged.
// =============================================================================

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::candle_buffer::{normalize_symbol, BufferStore, Candle, SeriesKey};
use super::reconnect::{ReconnectPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::binance::{ExchangeClient, FeedEvent, StreamMessage, SubscriptionHandle};
use crate::error::{IngestError, IngestResult};
use crate::types::{FeedState, Timeframe};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Invoked with every closed candle appended by the live feed.
pub type CandleCallback = Arc<dyn Fn(&Candle, Timeframe) + Send + Sync>;
/// Invoked with `(symbol, new_state)` on every state transition.
pub type StatusCallback = Arc<dyn Fn(&str, FeedState) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    /// Bound of the transport → worker event channel.
    pub channel_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            reconnect_base_delay: DEFAULT_BASE_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// One open push subscription.
struct LiveSubscription {
    key: SeriesKey,
    _handle: SubscriptionHandle,
}

/// Live kline feed for one symbol across its tracked timeframes.
pub struct LiveFeedSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    symbol: String,
    timeframes: Vec<Timeframe>,
    client: Option<Arc<dyn ExchangeClient>>,
    store: Arc<BufferStore>,
    reconnect: ReconnectPolicy,
    channel_capacity: usize,

    on_candle: RwLock<Option<CandleCallback>>,
    on_status: RwLock<Option<StatusCallback>>,

    state: RwLock<FeedState>,
    subscriptions: Mutex<Vec<LiveSubscription>>,
    /// Kept so reconnects can hand new transports the same channel.
    events_tx: Mutex<Option<mpsc::Sender<FeedEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Serialises `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl LiveFeedSession {
    pub fn new(
        symbol: impl Into<String>,
        timeframes: Vec<Timeframe>,
        client: Option<Arc<dyn ExchangeClient>>,
        store: Arc<BufferStore>,
        options: SessionOptions,
    ) -> Self {
        let mut timeframes = timeframes;
        timeframes.sort();
        timeframes.dedup();

        Self {
            inner: Arc::new(SessionInner {
                symbol: normalize_symbol(&symbol.into()),
                timeframes,
                client,
                store,
                reconnect: ReconnectPolicy::new(
                    options.max_reconnect_attempts,
                    options.reconnect_base_delay,
                ),
                channel_capacity: options.channel_capacity.max(1),
                on_candle: RwLock::new(None),
                on_status: RwLock::new(None),
                state: RwLock::new(FeedState::Disconnected),
                subscriptions: Mutex::new(Vec::new()),
                events_tx: Mutex::new(None),
                worker: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_candle_callback(&self, callback: CandleCallback) {
        *self.inner.on_candle.write() = Some(callback);
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.inner.on_status.write() = Some(callback);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open one subscription per tracked timeframe and start consuming.
    ///
    /// On a subscribe failure every subscription opened so far is torn down,
    /// the session returns to `Disconnected` and the upstream error is
    /// returned unchanged.
    pub async fn start(&self) -> IngestResult<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let client = inner.client.clone().ok_or(IngestError::ClientUnavailable)?;
        if !inner.transition(FeedState::Disconnected, FeedState::Connecting) {
            return Err(IngestError::SessionState {
                symbol: inner.symbol.clone(),
                state: inner.state(),
            });
        }

        let (tx, rx) = mpsc::channel(inner.channel_capacity);
        let subscriptions = match inner.subscribe_all(client.as_ref(), &tx).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(symbol = %inner.symbol, error = %e, "live feed start failed");
                inner.transition(FeedState::Connecting, FeedState::Disconnected);
                return Err(IngestError::Upstream(e));
            }
        };

        *inner.subscriptions.lock() = subscriptions;
        *inner.events_tx.lock() = Some(tx);
        inner.reconnect.mark_connected();
        inner.transition(FeedState::Connecting, FeedState::Connected);

        let worker = tokio::spawn(Arc::clone(inner).run_worker(rx));
        *inner.worker.lock() = Some(worker);

        info!(
            symbol = %inner.symbol,
            timeframes = ?inner.timeframes,
            "live feed connected"
        );
        Ok(())
    }

    /// Tear everything down from any state and return to `Disconnected`.
    /// Resets the reconnect attempt counter.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        // Worker first: it is the only place new reconnect tasks come from.
        let worker = inner.worker.lock().take();
        if let Some(task) = worker {
            task.abort();
            let _ = task.await;
        }
        let reconnect = inner.reconnect_task.lock().take();
        if let Some(task) = reconnect {
            task.abort();
            let _ = task.await;
        }

        inner.subscriptions.lock().clear();
        *inner.events_tx.lock() = None;
        inner.reconnect.reset();
        inner.set_state(FeedState::Disconnected);
        info!(symbol = %inner.symbol, "live feed stopped");
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn state(&self) -> FeedState {
        self.inner.state()
    }

    pub fn symbol(&self) -> &str {
        &self.inner.symbol
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.inner.timeframes
    }

    /// True once automatic reconnection has given up; only `stop` + `start`
    /// recovers from here.
    pub fn attempts_exhausted(&self) -> bool {
        self.inner.reconnect.is_exhausted()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.attempts()
    }

    /// Keys of the currently open subscriptions.
    pub fn subscriptions(&self) -> Vec<SeriesKey> {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .map(|s| s.key.clone())
            .collect()
    }
}

impl Drop for LiveFeedSession {
    fn drop(&mut self) {
        if let Some(task) = self.inner.worker.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        self.inner.subscriptions.lock().clear();
    }
}

impl std::fmt::Debug for LiveFeedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFeedSession")
            .field("symbol", &self.inner.symbol)
            .field("timeframes", &self.inner.timeframes)
            .field("state", &self.inner.state())
            .field("reconnect", &self.inner.reconnect)
            .finish()
    }
}

impl SessionInner {
    fn state(&self) -> FeedState {
        *self.state.read()
    }

    /// Move `from` → `to`; returns false (and changes nothing) if the session
    /// is not in `from`.
    fn transition(&self, from: FeedState, to: FeedState) -> bool {
        {
            let mut state = self.state.write();
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.notify_status(to);
        true
    }

    fn set_state(&self, to: FeedState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != to;
            *state = to;
            changed
        };
        if changed {
            self.notify_status(to);
        }
    }

    fn notify_status(&self, state: FeedState) {
        debug!(symbol = %self.symbol, state = %state, "live feed state changed");
        let callback = self.on_status.read().clone();
        if let Some(cb) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(&self.symbol, state))).is_err() {
                error!(symbol = %self.symbol, "status callback panicked");
            }
        }
    }

    async fn subscribe_all(
        &self,
        client: &dyn ExchangeClient,
        tx: &mpsc::Sender<FeedEvent>,
    ) -> anyhow::Result<Vec<LiveSubscription>> {
        let mut subscriptions = Vec::with_capacity(self.timeframes.len());
        for &timeframe in &self.timeframes {
            let handle = client
                .subscribe_kline_stream(&self.symbol, timeframe, tx.clone())
                .await?;
            subscriptions.push(LiveSubscription {
                key: SeriesKey::new(self.symbol.clone(), timeframe),
                _handle: handle,
            });
        }
        Ok(subscriptions)
    }

    /// Replace every transport with a fresh one on the same channel.
    async fn resubscribe(&self) -> anyhow::Result<()> {
        let client = self.client.clone().context("no exchange client configured")?;
        let tx = self
            .events_tx
            .lock()
            .clone()
            .context("live feed has been stopped")?;

        self.subscriptions.lock().clear();
        let fresh = self.subscribe_all(client.as_ref(), &tx).await?;
        *self.subscriptions.lock() = fresh;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------------

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<FeedEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        debug!(symbol = %self.symbol, "live feed channel closed");
    }

    fn handle_event(self: &Arc<Self>, event: FeedEvent) {
        let timeframe = event.timeframe;
        match event.message {
            StreamMessage::Kline { kline } => {
                if self.state() != FeedState::Connected || !kline.is_closed {
                    return;
                }
                let candle = kline.to_candle();
                if !candle.is_well_formed() {
                    warn!(
                        symbol = %self.symbol,
                        timeframe = %timeframe,
                        open_time = candle.open_time,
                        "discarding malformed live kline"
                    );
                    return;
                }
                let key = SeriesKey::new(self.symbol.clone(), timeframe);
                if self.store.append(&key, candle) {
                    self.notify_candle(&candle, timeframe);
                }
            }
            StreamMessage::Error { detail } => self.on_disconnect(timeframe, &detail),
        }
    }

    fn notify_candle(&self, candle: &Candle, timeframe: Timeframe) {
        let callback = self.on_candle.read().clone();
        if let Some(cb) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(candle, timeframe))).is_err() {
                error!(
                    symbol = %self.symbol,
                    timeframe = %timeframe,
                    open_time = candle.open_time,
                    "candle callback panicked"
                );
            }
        }
    }

    /// Transport failure. Only a `Connected` session reacts; signals that
    /// arrive while already reconnecting, failed or stopped are ignored.
    fn on_disconnect(self: &Arc<Self>, timeframe: Timeframe, detail: &str) {
        if !self.transition(FeedState::Connected, FeedState::Reconnecting) {
            debug!(
                symbol = %self.symbol,
                timeframe = %timeframe,
                state = %self.state(),
                "transport error ignored"
            );
            return;
        }
        warn!(
            symbol = %self.symbol,
            timeframe = %timeframe,
            detail,
            "live feed disconnected"
        );
        self.reconnect.mark_disconnected();

        let task = tokio::spawn(Arc::clone(self).run_reconnect());
        *self.reconnect_task.lock() = Some(task);
    }

    async fn run_reconnect(self: Arc<Self>) {
        let reconnected = self
            .reconnect
            .attempt(|| {
                let inner = Arc::clone(&self);
                async move { inner.resubscribe().await }
            })
            .await;

        if reconnected {
            if self.transition(FeedState::Reconnecting, FeedState::Connected) {
                info!(symbol = %self.symbol, "live feed restored");
            }
        } else if self.transition(FeedState::Reconnecting, FeedState::Failed) {
            self.subscriptions.lock().clear();
            error!(
                symbol = %self.symbol,
                attempts = self.reconnect.attempts(),
                "live feed failed; stop and start the session to retry"
            );
        }
    }
}
