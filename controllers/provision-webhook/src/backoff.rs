//! # Exponential Backoff
//!
//! Provides an exponential backoff with jitter for conflict retries.
//! Delays double from `base` up to `max`; each delay gets up to half of itself
//! added as random jitter so that competing writers drift apart instead of
//! colliding again on the next attempt.
//!
//! Sequence for base 100ms, max 5s (before jitter): 100ms, 200ms, 400ms, 800ms, 1.6s, 3.2s, 5s (max).

use rand::Rng;
use std::time::Duration;

/// Exponential backoff calculator
///
/// Generates retry delays that double on every call, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay of the first retry
    base: Duration,
    /// Upper bound before jitter
    max: Duration,
    /// Retries handed out since the last reset
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given first delay and cap
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Get the next delay (with jitter) and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = with_jitter(Self::calculate_for_attempt(self.attempt, self.base, self.max));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the backoff to the initial state
    #[allow(dead_code, reason = "each reconciliation starts a fresh backoff")]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Calculate the un-jittered delay for a given attempt (stateless)
    ///
    /// Attempt 0 yields `base`, attempt n yields `base * 2^n`, capped at `max`.
    #[must_use]
    pub fn calculate_for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}

/// Adds uniform jitter in `[0, delay / 2]`
fn with_jitter(delay: Duration) -> Duration {
    let half = delay / 2;
    if half.is_zero() {
        return delay;
    }
    delay + rand::thread_rng().gen_range(Duration::ZERO..=half)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(5000);

    #[test]
    fn test_exponential_sequence() {
        let delays: Vec<u128> = (0..8)
            .map(|n| ExponentialBackoff::calculate_for_attempt(n, BASE, MAX).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn test_large_attempt_is_capped() {
        assert_eq!(ExponentialBackoff::calculate_for_attempt(40, BASE, MAX), MAX);
        assert_eq!(ExponentialBackoff::calculate_for_attempt(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = ExponentialBackoff::new(BASE, MAX);
        for attempt in 0..10 {
            let expected = ExponentialBackoff::calculate_for_attempt(attempt, BASE, MAX);
            let delay = backoff.next_backoff();
            assert!(delay >= expected, "attempt {}: {:?} < {:?}", attempt, delay, expected);
            assert!(
                delay <= expected + expected / 2,
                "attempt {}: {:?} exceeds jitter bound",
                attempt,
                delay
            );
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(BASE, MAX);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        let delay = backoff.next_backoff();
        assert!(delay >= BASE && delay <= BASE + BASE / 2, "Should restart from base after reset");
    }

    #[test]
    fn test_zero_base_has_no_jitter() {
        let mut backoff = ExponentialBackoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.next_backoff(), Duration::ZERO);
    }
}
