// =============================================================================
// Request Throttle — sliding one-minute window in front of Binance REST calls
// =============================================================================
//
// Binance enforces its request ceiling exchange-wide, not per symbol, so a
// single throttle is shared by every historical fetch in the process.
//
//   - Every granted request leaves a timestamp in a 60 s sliding window.
//   - Once the window holds `warn_fraction` of the ceiling, each further
//     acquire waits an escalating backoff: min(2^(n-1) s, 10 s), where n is
//     the number of consecutive acquires observed inside the warning band.
//   - A full window blocks until the oldest timestamp ages out or the
//     caller's timeout elapses.
//
// The prune-check-record sequence runs under one lock; sleeps never hold it.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Length of the sliding window.
const WINDOW: Duration = Duration::from_secs(60);
/// Upper bound of the warning-band backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct ThrottleState {
    granted: VecDeque<Instant>,
    backoff: Duration,
    consecutive_warnings: u32,
    in_warning_band: bool,
    band_entries: u64,
}

impl ThrottleState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.granted.front() {
            if now.duration_since(*front) >= WINDOW {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Serialisable view of the throttle for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSnapshot {
    pub requests_last_minute: usize,
    pub max_per_minute: usize,
    pub utilization: f64,
    pub consecutive_warnings: u32,
    pub backoff_ms: u64,
    /// Times the window has crossed into the warning band.
    pub warning_band_entries: u64,
}

/// Thread-safe sliding-window request throttle.
pub struct RequestThrottle {
    max_per_minute: usize,
    warn_at: usize,
    state: Mutex<ThrottleState>,
}

impl RequestThrottle {
    /// `warn_fraction` is the share of `max_per_minute` at which backoff
    /// starts (e.g. 0.8).
    pub fn new(max_per_minute: usize, warn_fraction: f64) -> Self {
        let max_per_minute = max_per_minute.max(1);
        let fraction = warn_fraction.clamp(f64::MIN_POSITIVE, 1.0);
        let warn_at = ((max_per_minute as f64) * fraction).ceil() as usize;
        Self {
            max_per_minute,
            warn_at: warn_at.clamp(1, max_per_minute),
            state: Mutex::new(ThrottleState::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Acquire
    // -------------------------------------------------------------------------

    /// Wait for permission to issue one outbound request.
    ///
    /// Returns `false` when no slot could be granted within `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let backoff = self.enter_backoff(Instant::now());
        if !backoff.is_zero() {
            if Instant::now() + backoff > deadline {
                warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    timeout_ms = timeout.as_millis() as u64,
                    "throttle backoff exceeds caller budget — request denied"
                );
                return false;
            }
            debug!(backoff_ms = backoff.as_millis() as u64, "throttle backoff");
            tokio::time::sleep(backoff).await;
        }

        loop {
            let retry_at = {
                let mut st = self.state.lock();
                let now = Instant::now();
                st.prune(now);
                if st.granted.len() < self.max_per_minute {
                    st.granted.push_back(now);
                    return true;
                }
                // Full: the oldest grant is the next one to leave the window.
                match st.granted.front() {
                    Some(oldest) => *oldest + WINDOW,
                    None => now,
                }
            };

            if retry_at > deadline {
                warn!(
                    max_per_minute = self.max_per_minute,
                    timeout_ms = timeout.as_millis() as u64,
                    "request window full — permit not granted before timeout"
                );
                return false;
            }
            tokio::time::sleep_until(retry_at).await;
        }
    }

    /// Update warning-band bookkeeping and return the delay to apply before
    /// this acquire may be granted.
    fn enter_backoff(&self, now: Instant) -> Duration {
        let mut st = self.state.lock();
        st.prune(now);
        let count = st.granted.len();

        if count < self.warn_at {
            st.in_warning_band = false;
            st.consecutive_warnings = 0;
            st.backoff = Duration::ZERO;
            return Duration::ZERO;
        }

        if !st.in_warning_band {
            st.in_warning_band = true;
            st.band_entries += 1;
            warn!(
                requests = count,
                max_per_minute = self.max_per_minute,
                warn_at = self.warn_at,
                "request rate entered warning band"
            );
        }
        st.consecutive_warnings = st.consecutive_warnings.saturating_add(1);
        st.backoff = backoff_for(st.consecutive_warnings);
        st.backoff
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Number of grants inside the current window.
    pub fn current_rate(&self) -> usize {
        let mut st = self.state.lock();
        st.prune(Instant::now());
        st.granted.len()
    }

    /// Window occupancy as a fraction of the ceiling, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        (self.current_rate() as f64 / self.max_per_minute as f64).clamp(0.0, 1.0)
    }

    pub fn max_per_minute(&self) -> usize {
        self.max_per_minute
    }

    /// Forget all grants and backoff state.
    pub fn reset(&self) {
        *self.state.lock() = ThrottleState::default();
        debug!("request throttle reset");
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let mut st = self.state.lock();
        st.prune(Instant::now());
        let count = st.granted.len();
        ThrottleSnapshot {
            requests_last_minute: count,
            max_per_minute: self.max_per_minute,
            utilization: (count as f64 / self.max_per_minute as f64).clamp(0.0, 1.0),
            consecutive_warnings: st.consecutive_warnings,
            backoff_ms: st.backoff.as_millis() as u64,
            warning_band_entries: st.band_entries,
        }
    }
}

/// `min(2^(n-1) s, 10 s)` for the n-th consecutive warning.
fn backoff_for(consecutive_warnings: u32) -> Duration {
    if consecutive_warnings == 0 {
        return Duration::ZERO;
    }
    let shift = (consecutive_warnings - 1).min(16);
    Duration::from_secs(1u64 << shift).min(MAX_BACKOFF)
}

impl std::fmt::Debug for RequestThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("RequestThrottle")
            .field("max_per_minute", &self.max_per_minute)
            .field("warn_at", &self.warn_at)
            .field("granted", &st.granted.len())
            .field("consecutive_warnings", &st.consecutive_warnings)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_and_caps_at_ten_seconds() {
        assert_eq!(backoff_for(0), Duration::ZERO);
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(2));
        assert_eq!(backoff_for(4), Duration::from_secs(8));
        assert_eq!(backoff_for(5), Duration::from_secs(10));
        assert_eq!(backoff_for(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn grants_immediately_below_warning_band() {
        let throttle = RequestThrottle::new(10, 0.8);
        let started = Instant::now();
        for _ in 0..8 {
            assert!(throttle.acquire(Duration::from_secs(1)).await);
        }
        assert_eq!(Instant::now(), started);
        assert_eq!(throttle.current_rate(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_band_applies_escalating_backoff() {
        let throttle = RequestThrottle::new(10, 0.5);
        for _ in 0..5 {
            assert!(throttle.acquire(Duration::from_secs(1)).await);
        }

        let t0 = Instant::now();
        assert!(throttle.acquire(Duration::from_secs(30)).await);
        assert_eq!(Instant::now() - t0, Duration::from_secs(1));

        let t1 = Instant::now();
        assert!(throttle.acquire(Duration::from_secs(30)).await);
        assert_eq!(Instant::now() - t1, Duration::from_secs(2));

        let snap = throttle.snapshot();
        assert_eq!(snap.consecutive_warnings, 2);
        assert_eq!(snap.backoff_ms, 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn warnings_reset_once_window_drains() {
        let throttle = RequestThrottle::new(4, 0.5);
        assert!(throttle.acquire(Duration::from_secs(1)).await);
        assert!(throttle.acquire(Duration::from_secs(1)).await);
        assert!(throttle.acquire(Duration::from_secs(5)).await);
        assert_eq!(throttle.snapshot().consecutive_warnings, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(throttle.acquire(Duration::from_secs(1)).await);
        assert_eq!(throttle.snapshot().consecutive_warnings, 0);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn count(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock()).matches(needle).count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn warning_band_entry_is_logged_once_per_entry() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let throttle = RequestThrottle::new(10, 0.5);
        for _ in 0..8 {
            assert!(throttle.acquire(Duration::from_secs(30)).await);
        }
        assert_eq!(throttle.snapshot().consecutive_warnings, 3);
        assert_eq!(throttle.snapshot().warning_band_entries, 1);
        assert_eq!(logs.count("request rate entered warning band"), 1);

        // Drain the window, then cross the band again.
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..6 {
            assert!(throttle.acquire(Duration::from_secs(30)).await);
        }
        assert_eq!(throttle.snapshot().warning_band_entries, 2);
        assert_eq!(logs.count("request rate entered warning band"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_times_out() {
        let throttle = RequestThrottle::new(3, 1.0);
        for _ in 0..3 {
            assert!(throttle.acquire(Duration::from_secs(1)).await);
        }
        assert_eq!(throttle.current_rate(), 3);

        assert!(!throttle.acquire(Duration::from_secs(5)).await);
        assert_eq!(throttle.current_rate(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_waits_for_oldest_to_expire() {
        let throttle = RequestThrottle::new(2, 1.0);
        assert!(throttle.acquire(Duration::ZERO).await);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(throttle.acquire(Duration::from_secs(2)).await);

        // Window is full; the first grant leaves it 30 s from now. The 1 s
        // band backoff is paid inside that wait.
        let t0 = Instant::now();
        assert!(throttle.acquire(Duration::from_secs(45)).await);
        assert_eq!(Instant::now() - t0, Duration::from_secs(30));
        assert_eq!(throttle.current_rate(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_never_exceeds_ceiling_under_concurrency() {
        let throttle = Arc::new(RequestThrottle::new(20, 0.9));
        let mut tasks = Vec::new();
        for _ in 0..60 {
            let t = throttle.clone();
            tasks.push(tokio::spawn(async move {
                let granted = t.acquire(Duration::from_millis(500)).await;
                assert!(t.current_rate() <= 20);
                assert!((0.0..=1.0).contains(&t.utilization()));
                granted
            }));
        }
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert!(granted <= 20);
        assert!(throttle.current_rate() <= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_window_and_backoff() {
        let throttle = RequestThrottle::new(2, 0.5);
        assert!(throttle.acquire(Duration::from_secs(5)).await);
        assert!(throttle.acquire(Duration::from_secs(5)).await);
        assert!((throttle.utilization() - 1.0).abs() < f64::EPSILON);

        throttle.reset();
        assert_eq!(throttle.current_rate(), 0);
        assert_eq!(throttle.utilization(), 0.0);
        assert_eq!(throttle.snapshot().consecutive_warnings, 0);
    }
}
