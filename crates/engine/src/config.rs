use core::time::Duration;

use rand::Rng;

/// Tunables for one engine instance.
///
/// The defaults match production behavior; tests shrink the windows to keep
/// runtimes short.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Retry policy for reconnects and failed catch-up fetches.
    pub backoff: BackoffConfig,

    /// How long an out-of-order Update/Delete may wait for its Insert
    /// before being dropped as an anomaly.
    pub deferred_window: Duration,

    /// Budget for one catch-up fetch before it is abandoned and retried.
    pub catch_up_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            deferred_window: Duration::from_secs(2),
            catch_up_timeout: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff with full jitter.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffConfig {
    /// Delay before retry `attempt` (0-based): uniformly random in
    /// `0..=min(cap, base * 2^attempt)`, so simultaneous retriers spread
    /// out instead of thundering back in lockstep.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.saturating_mul(2_u32.saturating_pow(attempt.min(16)));
        let ceiling = u64::try_from(exponential.min(self.cap).as_millis()).unwrap_or(u64::MAX);

        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(30),
        }
    }
}
