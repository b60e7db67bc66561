//! Backoff schedules for the retry executor.

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay, mostly useful in tests.
    Constant { delay: Duration },
    /// Doubling delay capped at `max`: `min(max, base * 2^(attempt-1))`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts completed
    /// attempts starting at 1. Saturates instead of overflowing.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = 2u32.saturating_pow(exponent);
                let delay = base
                    .checked_mul(multiplier)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                delay.min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(7), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let backoff =
            Backoff::exponential(Duration::from_millis(500), Duration::from_secs(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay(3), Duration::from_millis(2000));
        assert_eq!(backoff.delay(5), Duration::from_millis(8000));
        assert_eq!(backoff.delay(6), Duration::from_secs(10));
        assert_eq!(backoff.delay(30), Duration::from_secs(10));
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_panicking() {
        let backoff = Backoff::exponential(
            Duration::from_secs(1),
            Duration::from_secs(u64::MAX / 2),
        );
        let delay = backoff.delay(64);
        assert!(delay > Duration::from_secs(1_000_000));
    }
}
