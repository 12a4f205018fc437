use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Reconnect policy consulted by the connection manager.
///
/// Implementations are pure: the manager owns the attempt counter and asks for the delay of
/// a given retry, so schedules can be tested without timers.
pub trait ReconnectStrategy: Send + Sync + 'static {
    /// Delay before retry number `retry` (0-based) of the current failure sequence.
    fn delay_for(&self, retry: u32) -> Duration;

    /// Consecutive failed attempts after which the manager gives up.
    fn max_attempts(&self) -> u32;

    fn should_retry(&self) -> bool {
        true
    }
}

/// Exponential backoff: `base × 2^retry`, capped at `max`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: bool,
    retry: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts: max_attempts.max(1),
            jitter: false,
            retry: true,
        }
    }

    /// Randomize each delay into `[delay / 2, delay]`.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Never schedule automatic retries.
    pub fn abort(mut self) -> Self {
        self.retry = false;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn delay_for(&self, retry: u32) -> Duration {
        let delay = next_delay(self.base, self.max, retry);
        if self.jitter {
            jitter_delay(delay)
        } else {
            delay
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn should_retry(&self) -> bool {
        self.retry
    }
}

/// `base × 2^retry` capped at `max`, saturating instead of overflowing for large retries.
pub fn next_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

pub fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_plateau_at_cap() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1_000), 10);
        let delays: Vec<_> = (0..7).map(|retry| backoff.delay_for(retry)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
                Duration::from_millis(1_000),
            ]
        );
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn huge_retry_counts_saturate_at_cap() {
        let max = Duration::from_secs(30);
        assert_eq!(next_delay(Duration::from_secs(1), max, 31), max);
        assert_eq!(next_delay(Duration::from_secs(1), max, 64), max);
        assert_eq!(next_delay(Duration::from_secs(1), max, u32::MAX), max);
    }

    #[test]
    fn cap_never_below_base() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_millis(10), 3);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn jitter_delay_respects_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = jitter_delay(base);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= base);
        }

        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn abort_disables_retries() {
        let backoff = ExponentialBackoff::default().abort();
        assert!(!backoff.should_retry());
        assert_eq!(backoff.max_attempts(), 5);
    }
}
