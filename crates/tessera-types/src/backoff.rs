//! Jittered binary backoff.

use std::time::Duration;

use rand::Rng;

/// Doubling backoff with uniform jitter, clamped to `[min, max]`.
///
/// `current()` starts at zero so the first attempt is immediate;
/// `advance` doubles the period and redraws, `shrink` halves it on
/// success.
#[derive(Debug)]
pub struct BinaryBackoff {
    min: Duration,
    max: Duration,
    period: Duration,
    current: Duration,
}

impl BinaryBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        debug_assert!(min > Duration::ZERO && min <= max);
        Self {
            min,
            max,
            period: min,
            current: Duration::ZERO,
        }
    }

    /// The delay to apply before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the period (clamped to `max`) and draws a fresh jittered
    /// delay. Returns the delay that was in force before the advance.
    pub fn advance(&mut self, rng: &mut impl Rng) -> Duration {
        let old = self.current;
        self.period = (self.period * 2).min(self.max);
        self.current = Duration::from_nanos(rng.gen_range(0..self.period.as_nanos() as u64));
        old
    }

    /// Halves the period (clamped to `min`) and redraws; delays at or
    /// below `round_to_zero` snap to zero.
    pub fn shrink(&mut self, rng: &mut impl Rng, round_to_zero: Duration) {
        self.period = (self.period / 2).max(self.min);
        self.current = Duration::from_nanos(rng.gen_range(0..self.period.as_nanos() as u64));
        if self.current <= round_to_zero {
            self.current = Duration::ZERO;
        }
    }
}
