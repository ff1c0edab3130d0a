//! Sliding-window transfer rate estimation.

use std::time::{Duration, Instant};

/// Estimates a byte rate over a bounded trailing window.
///
/// The estimate is the total observed inside the window divided by the
/// window's age. The window start trails the last update by at most
/// `max_rate_period`, so old traffic decays out. A fresh meter pretends to
/// have been running for `fudge` already, which keeps a single early burst
/// from producing an absurd rate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    max_rate_period: Duration,
    rate_since: Instant,
    last: Instant,
    rate: f64,
    total: u64,
}

impl RateMeter {
    pub fn new(max_rate_period: Duration, fudge: Duration) -> Self {
        Self::new_at(max_rate_period, fudge, Instant::now())
    }

    pub fn new_at(max_rate_period: Duration, fudge: Duration, now: Instant) -> Self {
        let rate_since = now.checked_sub(fudge).unwrap_or(now);
        Self {
            max_rate_period,
            rate_since,
            last: rate_since,
            rate: 0.0,
            total: 0,
        }
    }

    /// Records `amount` bytes transferred now.
    pub fn update(&mut self, amount: u64) {
        self.update_at(amount, Instant::now());
    }

    pub fn update_at(&mut self, amount: u64, now: Instant) {
        self.total += amount;
        let covered = self.last.saturating_duration_since(self.rate_since).as_secs_f64();
        let span = now.saturating_duration_since(self.rate_since).as_secs_f64();
        self.rate = (self.rate * covered + amount as f64) / (span + 0.0001);
        self.last = now;

        if let Some(floor) = now.checked_sub(self.max_rate_period) {
            if self.rate_since < floor {
                self.rate_since = floor;
            }
        }
    }

    /// Returns the current rate in bytes per second, decaying it to now.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.update_at(0, now);
        self.rate
    }

    /// Returns the last computed rate without decaying it.
    pub fn rate_noupdate(&self) -> f64 {
        self.rate
    }

    /// Seconds until the rate would fall to `target` with no new traffic.
    pub fn time_until_rate(&self, target: f64, now: Instant) -> Duration {
        if self.rate <= target || target <= 0.0 {
            return Duration::ZERO;
        }
        let t = now.saturating_duration_since(self.rate_since).as_secs_f64();
        Duration::from_secs_f64(((self.rate * t) / target - t).max(0.0))
    }

    /// Total bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_from_steady_traffic() {
        let start = Instant::now();
        let mut meter = RateMeter::new_at(Duration::from_secs(20), Duration::ZERO, start);

        for second in 1..=10 {
            meter.update_at(1000, start + Duration::from_secs(second));
        }

        let rate = meter.rate_at(start + Duration::from_secs(10));
        assert!((rate - 1000.0).abs() < 5.0, "rate was {rate}");
        assert_eq!(meter.total(), 10_000);
    }

    #[test]
    fn test_rate_decays_without_traffic() {
        let start = Instant::now();
        let mut meter = RateMeter::new_at(Duration::from_secs(20), Duration::ZERO, start);
        meter.update_at(20_000, start + Duration::from_secs(1));
        let early = meter.rate_noupdate();

        let later = meter.rate_at(start + Duration::from_secs(60));
        assert!(later < early / 10.0, "{later} vs {early}");
    }

    #[test]
    fn test_fudge_dampens_first_burst() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut plain = RateMeter::new_at(Duration::from_secs(20), Duration::ZERO, start);
        let mut fudged = RateMeter::new_at(Duration::from_secs(20), Duration::from_secs(5), start);

        plain.update_at(16384, start + Duration::from_millis(100));
        fudged.update_at(16384, start + Duration::from_millis(100));

        assert!(fudged.rate_noupdate() < plain.rate_noupdate() / 10.0);
    }

    #[test]
    fn test_time_until_rate() {
        let start = Instant::now();
        let mut meter = RateMeter::new_at(Duration::from_secs(20), Duration::ZERO, start);
        meter.update_at(10_000, start + Duration::from_secs(1));
        let now = start + Duration::from_secs(1);

        assert_eq!(meter.time_until_rate(1e9, now), Duration::ZERO);
        assert!(meter.time_until_rate(100.0, now) > Duration::from_secs(1));
    }
}
