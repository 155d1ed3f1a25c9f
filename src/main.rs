// =============================================================================
// candle-feed — Ingestion daemon
// =============================================================================
//
// Backfills every configured (symbol, timeframe), then keeps the buffers fresh
// from one live kline session per symbol. A maintenance loop reports status,
// flags stale series, trims old candles and purges expired cache entries.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_feed::binance::{BinanceClient, ExchangeClient, RequestThrottle};
use candle_feed::market_data::{BufferStore, FetchCache, HistoricalFetcher, LiveFeedSession};
use candle_feed::runtime_config::{FeedConfig, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};
use candle_feed::types::FeedState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = FeedConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load feed config, using defaults");
        FeedConfig::default()
    });
    config.apply_env()?;
    config.validate()?;

    info!(
        symbols = ?config.symbols,
        timeframes = ?config.timeframes,
        capacity = config.buffer_capacity,
        "candle-feed starting"
    );

    // ── 2. Shared components ─────────────────────────────────────────────
    let client: Arc<dyn ExchangeClient> = Arc::new(BinanceClient::new(
        config.api_key.as_deref(),
        config.rest_base_url.clone(),
        config.ws_base_url.clone(),
    )?);
    let throttle = Arc::new(RequestThrottle::new(
        config.max_requests_per_minute,
        config.throttle_warn_fraction,
    ));
    let store = Arc::new(BufferStore::new(config.buffer_capacity));
    let cache = Arc::new(FetchCache::new(config.cache_ttl()));
    let fetcher = HistoricalFetcher::new(
        Some(client.clone()),
        throttle.clone(),
        store.clone(),
        cache.clone(),
    )
    .with_acquire_timeout(config.acquire_timeout())
    .with_gap_tolerance(config.gap_tolerance);

    // ── 3. Historical backfill ───────────────────────────────────────────
    for symbol in &config.symbols {
        for &timeframe in &config.timeframes {
            match fetcher
                .fetch(symbol, timeframe, config.history_lookback(), false)
                .await
            {
                Ok(candles) => {
                    info!(symbol = %symbol, timeframe = %timeframe, count = candles.len(), "backfill complete")
                }
                Err(e) => {
                    error!(symbol = %symbol, timeframe = %timeframe, error = %e, "backfill failed")
                }
            }
        }
    }

    // ── 4. Live sessions ─────────────────────────────────────────────────
    let mut sessions = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        let session = LiveFeedSession::new(
            symbol.clone(),
            config.timeframes.clone(),
            Some(client.clone()),
            store.clone(),
            config.session_options(),
        );
        session.set_status_callback(Arc::new(|symbol: &str, state: FeedState| match state {
            FeedState::Failed => error!(symbol, "live feed gave up; data will go stale"),
            other => info!(symbol, state = %other, "live feed state"),
        }));
        if let Err(e) = session.start().await {
            error!(symbol = %symbol, error = %e, "failed to start live feed");
        }
        sessions.push(session);
    }
    let sessions = Arc::new(sessions);

    // ── 5. Maintenance loop ──────────────────────────────────────────────
    {
        let store = store.clone();
        let cache = cache.clone();
        let throttle = throttle.clone();
        let sessions = sessions.clone();
        let timeframes = config.timeframes.clone();
        let interval_dur = config.maintenance_interval();
        let max_age = config.cleanup_max_age();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_dur);
            loop {
                interval.tick().await;

                for session in sessions.iter() {
                    let status = store.status(session.symbol(), &timeframes);
                    let stale: Vec<String> = status
                        .iter()
                        .filter(|(_, s)| s.present && s.stale)
                        .map(|(tf, _)| tf.to_string())
                        .collect();
                    if !stale.is_empty() {
                        warn!(
                            symbol = session.symbol(),
                            state = %session.state(),
                            stale = ?stale,
                            "stale series detected"
                        );
                    }
                    info!(
                        symbol = session.symbol(),
                        state = %session.state(),
                        reconnect_attempts = session.reconnect_attempts(),
                        series = status.len(),
                        "feed status"
                    );
                }

                let trimmed = store.cleanup_older_than(max_age);
                let purged = cache.purge_expired();
                let snapshot = throttle.snapshot();
                info!(
                    trimmed,
                    purged,
                    requests_last_minute = snapshot.requests_last_minute,
                    utilization = snapshot.utilization,
                    "maintenance pass"
                );
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping live feeds");

    for session in sessions.iter() {
        session.stop().await;
    }

    info!("candle-feed shut down complete.");
    Ok(())
}
