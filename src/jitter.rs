//! Jitter applied to retry delays to prevent thundering herds.

use rand::Rng;
use std::time::Duration;

/// Symmetric jitter factor in `[0, 1]`.
///
/// A computed delay `d` becomes `d * (1 + u)` with `u` drawn uniformly from
/// `[-factor, +factor]`, so the expected delay is unchanged while concurrent
/// retriers spread out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    factor: f64,
}

impl Jitter {
    /// Create a jitter with the given factor, clamped into `[0, 1]`.
    pub fn new(factor: f64) -> Self {
        Self { factor: factor.clamp(0.0, 1.0) }
    }

    /// No randomization; delays are used exactly as computed.
    pub fn none() -> Self {
        Self { factor: 0.0 }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-provided RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rng.random_range(-self.factor..=self.factor);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new(0.2)
    }
}
