// =============================================================================
// Reconnect Policy — bounded exponential backoff for one live session
// =============================================================================
//
// Attempt k (1-based) waits base × 2^(k-1) before reconnecting: 1, 2, 4, 8,
// 16 s with the defaults. The attempt counter only moves inside `attempt`,
// never exceeds `max_attempts`, and returns to zero on success or `reset`.
// Once exhausted, `attempt` refuses to run until `reset` is called.
//
// Only one reconnection sequence runs at a time; concurrent callers queue on
// the sequence lock and observe the outcome of the one that ran.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
    connected: AtomicBool,
    attempts: AtomicU32,
    sequence: Mutex<()>,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            connected: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            sequence: Mutex::new(()),
        }
    }

    /// Delay before the `attempt`-th try (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts() >= self.max_attempts
    }

    /// Record an established connection (initial connect or external restart).
    pub fn mark_connected(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Clear the attempt counter so automatic reconnection may run again.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Run the reconnection sequence, calling `reconnect` after each backoff
    /// until it succeeds or the attempt budget is spent.
    ///
    /// Returns `true` if connected when the sequence ends.
    pub async fn attempt<F, Fut>(&self, mut reconnect: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let _sequence = self.sequence.lock().await;

        if self.is_connected() {
            return true;
        }

        loop {
            let done = self.attempts();
            if done >= self.max_attempts {
                error!(
                    attempts = done,
                    max_attempts = self.max_attempts,
                    "reconnection attempts exhausted"
                );
                return false;
            }

            let attempt = done + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            let delay = self.backoff_delay(attempt);
            info!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::time::sleep(delay).await;

            match reconnect().await {
                Ok(()) => {
                    self.mark_connected();
                    info!(attempt, "reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnection attempt failed");
                }
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("attempts", &self.attempts())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn delays_double_from_base() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|k| policy.backoff_delay(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_five_failures_with_doubling_delays() {
        let policy = ReconnectPolicy::default();
        let started = Instant::now();
        let calls = parking_lot::Mutex::new(Vec::new());

        let ok = policy
            .attempt(|| {
                calls.lock().push(Instant::now() - started);
                async { Err(anyhow::anyhow!("exchange unreachable")) }
            })
            .await;

        assert!(!ok);
        assert_eq!(policy.attempts(), 5);
        assert!(policy.is_exhausted());
        let offsets: Vec<u64> = calls.lock().iter().map(|d| d.as_secs()).collect();
        assert_eq!(offsets, vec![1, 3, 7, 15, 31]);

        // No further automatic attempt until reset.
        let again = policy
            .attempt(|| {
                calls.lock().push(Instant::now() - started);
                async { Ok(()) }
            })
            .await;
        assert!(!again);
        assert_eq!(calls.lock().len(), 5);
        assert_eq!(policy.attempts(), 5);

        policy.reset();
        assert!(policy.attempt(|| async { Ok(()) }).await);
        assert_eq!(policy.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_counter() {
        let policy = ReconnectPolicy::default();
        let failures_left = AtomicUsize::new(2);
        let ok = policy
            .attempt(|| {
                let fail = failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                async move {
                    if fail {
                        Err(anyhow::anyhow!("refused"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(ok);
        assert!(policy.is_connected());
        assert_eq!(policy.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn already_connected_is_a_no_op() {
        let policy = ReconnectPolicy::default();
        policy.mark_connected();
        let started = Instant::now();
        assert!(policy.attempt(|| async { Err(anyhow::anyhow!("unused")) }).await);
        assert_eq!(Instant::now(), started);
        assert_eq!(policy.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_sequence() {
        let policy = Arc::new(ReconnectPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let policy = policy.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                policy
                    .attempt(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
