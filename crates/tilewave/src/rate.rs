//! Tick-rate estimate.
//!
//! Observability only: nothing in the storage layout depends on it.

use embassy_time::Instant;

/// Running average of the tick rate in ticks per second.
///
/// Each interval between two consecutive [`record`](Self::record) calls
/// yields one instantaneous rate; the estimate is their mean. The first call
/// only sets the reference point, and zero-length or backwards intervals are
/// skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateEstimator {
    last: Option<Instant>,
    sum: f64,
    samples: u32,
    latest: f64,
}

impl RateEstimator {
    /// Estimator with no samples.
    pub const fn new() -> Self {
        Self {
            last: None,
            sum: 0.0,
            samples: 0,
            latest: 0.0,
        }
    }

    /// Feed the timestamp of a tick.
    #[allow(clippy::cast_precision_loss)] // microsecond intervals are far below 2^52
    pub fn record(&mut self, now: Instant) {
        let previous = self.last.replace(now);
        let Some(elapsed) = previous.and_then(|p| now.checked_duration_since(p)) else {
            return;
        };
        let micros = elapsed.as_micros();
        if micros == 0 {
            return;
        }
        #[allow(clippy::arithmetic_side_effects)] // f64 arithmetic does not panic
        {
            self.latest = 1_000_000.0 / micros as f64;
            self.sum += self.latest;
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Mean rate over every recorded interval, or `None` before the second
    /// tick.
    pub fn average(&self) -> Option<f64> {
        #[allow(clippy::arithmetic_side_effects)] // f64 division does not panic
        let mean = self.sum / f64::from(self.samples);
        (self.samples > 0).then_some(mean)
    }

    /// Rate of the most recent interval.
    pub fn latest(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.latest)
    }

    /// Number of intervals averaged so far.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Forget every sample and the reference point.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    #[test]
    fn first_interval_only_sets_the_reference() {
        let mut rate = RateEstimator::new();
        rate.record(Instant::from_millis(5));
        assert_eq!(rate.average(), None);
        assert_eq!(rate.samples(), 0);
    }

    #[test]
    fn average_of_instantaneous_rates() {
        let mut rate = RateEstimator::new();
        rate.record(Instant::from_millis(0));
        rate.record(Instant::from_millis(10)); // 100 Hz
        rate.record(Instant::from_millis(15)); // 200 Hz
        assert_eq!(rate.samples(), 2);
        assert_eq!(rate.latest(), Some(200.0));
        assert_eq!(rate.average(), Some(150.0));
    }

    #[test]
    fn zero_and_backwards_intervals_are_skipped() {
        let mut rate = RateEstimator::new();
        rate.record(Instant::from_millis(10));
        rate.record(Instant::from_millis(10));
        rate.record(Instant::from_millis(4));
        assert_eq!(rate.samples(), 0);
        rate.record(Instant::from_millis(8)); // 250 Hz
        assert_eq!(rate.average(), Some(250.0));
    }

    #[test]
    fn reset_clears_everything() {
        let mut rate = RateEstimator::new();
        rate.record(Instant::from_millis(0));
        rate.record(Instant::from_millis(1));
        rate.reset();
        assert_eq!(rate.average(), None);
        rate.record(Instant::from_millis(50));
        assert_eq!(rate.samples(), 0);
    }
}
