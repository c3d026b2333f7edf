use rand::Rng;
use std::time::Duration;

/// Largest exponent fed into the doubling, so the multiplication cannot
/// overflow regardless of how many consecutive failures accumulate.
const MAX_EXPONENT: u32 = 16;

/// Jitter span as a fraction of the computed delay.
const JITTER_RATIO: f64 = 0.2;

/// Computes reconnect delays: exponential backoff with a ceiling and ±20%
/// jitter so many clients recovering from the same outage do not reconnect
/// in lockstep.
#[derive(Debug, Clone)]
pub(crate) struct RetryScheduler {
    base: Duration,
    max: Duration,
}

impl RetryScheduler {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect attempt `attempt` (0-based). The mean grows
    /// as `base * 2^attempt` up to `max`; the jittered value stays within
    /// ±20% of that mean.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        let spread = rand::thread_rng().gen_range(-1.0..=1.0) * JITTER_RATIO;
        raw.mul_f64(1.0 + spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_delay(scheduler: &RetryScheduler, attempt: u32) -> Duration {
        let samples: u32 = 64;
        let total: Duration = (0..samples).map(|_| scheduler.next_delay(attempt)).sum();
        total / samples
    }

    #[test]
    fn test_delay_within_jitter_window() {
        let scheduler = RetryScheduler::new(Duration::from_millis(200), Duration::from_secs(30));
        for _ in 0..100 {
            let delay = scheduler.next_delay(0);
            assert!(delay >= Duration::from_millis(160), "too small: {delay:?}");
            assert!(delay <= Duration::from_millis(240), "too large: {delay:?}");
        }
    }

    #[test]
    fn test_mean_grows_until_cap() {
        let scheduler = RetryScheduler::new(Duration::from_millis(100), Duration::from_secs(100));
        let mut previous = Duration::ZERO;
        for attempt in 0..5 {
            let mean = mean_delay(&scheduler, attempt);
            assert!(
                mean > previous,
                "attempt {attempt}: mean {mean:?} not above previous {previous:?}"
            );
            previous = mean;
        }
    }

    #[test]
    fn test_cap_bounds_delay() {
        let scheduler = RetryScheduler::new(Duration::from_secs(1), Duration::from_secs(2));
        for _ in 0..100 {
            let delay = scheduler.next_delay(10);
            assert!(delay <= Duration::from_millis(2400), "over cap: {delay:?}");
            assert!(delay >= Duration::from_millis(1600), "under cap window: {delay:?}");
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let scheduler = RetryScheduler::new(Duration::from_secs(1), Duration::from_secs(30));
        let delay = scheduler.next_delay(u32::MAX);
        assert!(delay <= Duration::from_secs(36));
    }
}
