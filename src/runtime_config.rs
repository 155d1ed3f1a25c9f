// =============================================================================
// Feed Configuration — JSON settings with env overrides and atomic save
// =============================================================================
//
// Every tunable of the ingestion daemon lives here. All fields carry
// `#[serde(default)]` so an older or partial file always loads; unknown
// values fall back to the defaults below.
//
// Persistence uses an atomic tmp + rename so a crash mid-write never leaves
// a truncated file behind.
//
// The API key is never read from or written to the JSON file; it only comes
// from the environment (`BINANCE_API_KEY`).
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::binance::client::{DEFAULT_REST_BASE_URL, DEFAULT_WS_BASE_URL};
use crate::market_data::live_feed::SessionOptions;
use crate::market_data::normalize_symbol;
use crate::types::Timeframe;

pub const DEFAULT_CONFIG_PATH: &str = "feed_config.json";

pub const ENV_SYMBOLS: &str = "FEED_SYMBOLS";
pub const ENV_TIMEFRAMES: &str = "FEED_TIMEFRAMES";
pub const ENV_API_KEY: &str = "BINANCE_API_KEY";
pub const ENV_CONFIG_PATH: &str = "FEED_CONFIG_PATH";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![
        Timeframe::Min5,
        Timeframe::Min15,
        Timeframe::Hour1,
        Timeframe::Hour4,
    ]
}

fn default_buffer_capacity() -> usize {
    500
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_requests_per_minute() -> usize {
    1200
}

fn default_throttle_warn_fraction() -> f64 {
    0.8
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_history_lookback_hours() -> u64 {
    48
}

fn default_gap_tolerance() -> f64 {
    1.1
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_cleanup_max_age_hours() -> u64 {
    168
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

fn default_rest_base_url() -> String {
    DEFAULT_REST_BASE_URL.to_string()
}

fn default_ws_base_url() -> String {
    DEFAULT_WS_BASE_URL.to_string()
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Symbols to backfill and stream, e.g. `BTCUSDT`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Timeframes tracked for every symbol.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    // --- Buffers & cache ----------------------------------------------------

    /// Candles retained per (symbol, timeframe).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Candles older than this are trimmed by the maintenance loop.
    #[serde(default = "default_cleanup_max_age_hours")]
    pub cleanup_max_age_hours: u64,

    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    // --- Throttle -----------------------------------------------------------

    /// Exchange-wide request ceiling over a rolling minute.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: usize,

    /// Fraction of the ceiling where backoff starts.
    #[serde(default = "default_throttle_warn_fraction")]
    pub throttle_warn_fraction: f64,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    // --- History ------------------------------------------------------------

    #[serde(default = "default_history_lookback_hours")]
    pub history_lookback_hours: u64,

    /// Largest accepted spacing between fetched candles, as a multiple of
    /// the timeframe length.
    #[serde(default = "default_gap_tolerance")]
    pub gap_tolerance: f64,

    // --- Live feed ----------------------------------------------------------

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    // --- Endpoints ----------------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    /// Environment only.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            buffer_capacity: default_buffer_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cleanup_max_age_hours: default_cleanup_max_age_hours(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            max_requests_per_minute: default_max_requests_per_minute(),
            throttle_warn_fraction: default_throttle_warn_fraction(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            history_lookback_hours: default_history_lookback_hours(),
            gap_tolerance: default_gap_tolerance(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            api_key: None,
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing or unreadable file is an error so the caller can fall back
    /// to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;
        config.symbols = normalize_symbols(config.symbols.iter().map(String::as_str));

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframes = ?config.timeframes,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Apply `FEED_SYMBOLS`, `FEED_TIMEFRAMES` and `BINANCE_API_KEY` from the
    /// process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any lookup (the environment in production).
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(raw) = lookup(ENV_SYMBOLS) {
            self.symbols = normalize_symbols(raw.split(','));
        }

        if let Some(raw) = lookup(ENV_TIMEFRAMES) {
            self.timeframes = raw
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<Timeframe>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid {ENV_TIMEFRAMES}"))?;
        }

        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = Some(key.trim().to_string());
        }

        Ok(())
    }

    /// Reject settings the subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("at least one symbol is required");
        }
        if self.timeframes.is_empty() {
            anyhow::bail!("at least one timeframe is required");
        }
        if self.buffer_capacity == 0 {
            anyhow::bail!("buffer_capacity must be positive");
        }
        if self.max_requests_per_minute == 0 {
            anyhow::bail!("max_requests_per_minute must be positive");
        }
        if !(self.throttle_warn_fraction > 0.0 && self.throttle_warn_fraction <= 1.0) {
            anyhow::bail!(
                "throttle_warn_fraction must be in (0, 1], got {}",
                self.throttle_warn_fraction
            );
        }
        if !(self.gap_tolerance >= 1.0) {
            anyhow::bail!("gap_tolerance must be at least 1.0, got {}", self.gap_tolerance);
        }
        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be positive");
        }
        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("maintenance_interval_secs must be positive");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Typed accessors
    // -------------------------------------------------------------------------

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn history_lookback(&self) -> Duration {
        Duration::from_secs(self.history_lookback_hours * 3600)
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_age_hours * 3600)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            channel_capacity: self.event_channel_capacity,
        }
    }
}

/// Trim, upper-case and de-duplicate, keeping first-seen order.
fn normalize_symbols<'a>(symbols: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for symbol in symbols.map(normalize_symbol).filter(|s| !s.is_empty()) {
        if !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("symbols", &self.symbols)
            .field("timeframes", &self.timeframes)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_requests_per_minute", &self.max_requests_per_minute)
            .field("rest_base_url", &self.rest_base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
