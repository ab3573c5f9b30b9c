//! Arrival-rate estimation.
//!
//! Vars pace their roll transactions off the observed arrival rate of
//! transaction traffic: a roll is only worth issuing once the var has
//! gone quiet enough that another arrival is unlikely to beat it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples retained in the arrival window.
pub const POISSON_SAMPLES: usize = 64;

/// Sliding-window Poisson process estimator.
///
/// Records the last [`POISSON_SAMPLES`] arrival instants and models
/// arrivals as a Poisson process with rate `n / elapsed`.
#[derive(Debug)]
pub struct Poisson {
    arrivals: VecDeque<Instant>,
}

impl Default for Poisson {
    fn default() -> Self {
        Self::new()
    }
}

impl Poisson {
    pub fn new() -> Self {
        Self {
            arrivals: VecDeque::with_capacity(POISSON_SAMPLES),
        }
    }

    /// Records an arrival at `at`.
    pub fn add_then(&mut self, at: Instant) {
        if self.arrivals.len() == POISSON_SAMPLES {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(at);
    }

    /// Estimated arrival rate in events per second, as observed from
    /// `now`.
    pub fn rate(&self, now: Instant) -> f64 {
        let Some(&oldest) = self.arrivals.front() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(oldest).as_secs_f64();
        if elapsed <= 0.0 {
            return f64::INFINITY;
        }
        self.arrivals.len() as f64 / elapsed
    }

    /// Probability that at least one arrival occurs within `window`,
    /// under the fitted exponential inter-arrival distribution.
    pub fn p_arrival_within(&self, now: Instant, window: Duration) -> f64 {
        let rate = self.rate(now);
        if rate == 0.0 {
            return 0.0;
        }
        if rate.is_infinite() {
            return 1.0;
        }
        1.0 - (-rate * window.as_secs_f64()).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_predicts_silence() {
        let p = Poisson::new();
        let now = Instant::now();
        assert_eq!(p.rate(now), 0.0);
        assert_eq!(p.p_arrival_within(now, Duration::from_millis(3)), 0.0);
    }

    #[test]
    fn dense_arrivals_predict_more_arrivals() {
        let mut p = Poisson::new();
        let start = Instant::now();
        for i in 0..POISSON_SAMPLES {
            p.add_then(start + Duration::from_micros(i as u64 * 100));
        }
        let now = start + Duration::from_millis(7);
        // ~64 arrivals in ~7ms: another within 3ms is near-certain.
        assert!(p.p_arrival_within(now, Duration::from_millis(3)) > 0.99);
    }

    #[test]
    fn stale_arrivals_decay() {
        let mut p = Poisson::new();
        let start = Instant::now();
        p.add_then(start);
        p.add_then(start + Duration::from_millis(1));
        // Observed much later, two old arrivals imply a low rate.
        let now = start + Duration::from_secs(60);
        assert!(p.p_arrival_within(now, Duration::from_millis(3)) < 0.01);
    }

    #[test]
    fn window_is_bounded() {
        let mut p = Poisson::new();
        let start = Instant::now();
        for i in 0..(POISSON_SAMPLES * 3) {
            p.add_then(start + Duration::from_millis(i as u64));
        }
        assert_eq!(p.arrivals.len(), POISSON_SAMPLES);
    }
}
