//! Bandwidth limiting using a token bucket.
//!
//! The engine is single-threaded, so the bucket is a plain value owned by
//! whichever component spends it: the uploader gates PIECE sends with it and
//! the downloader derives its request queue limit from it.
//!
//! # Example
//!
//! ```
//! use swarmcore::bandwidth::TokenBucket;
//! use std::time::{Duration, Instant};
//!
//! let start = Instant::now();
//! let mut bucket = TokenBucket::new_at(16384, start);
//!
//! assert!(bucket.try_consume(16384, start));
//! assert!(!bucket.try_consume(16384, start));
//! assert_eq!(bucket.time_until(16384, start), Duration::from_secs(1));
//! ```

use std::time::{Duration, Instant};

/// A token bucket rate limiter.
///
/// Tokens accrue at `rate` bytes per second up to a burst of one second's
/// worth (or one request, whichever is larger). A rate of zero means
/// unlimited.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    max_tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Creates a bucket refilling at `bytes_per_sec`, starting full.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self::new_at(bytes_per_sec, Instant::now())
    }

    pub fn new_at(bytes_per_sec: u64, now: Instant) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            rate,
            tokens: rate,
            max_tokens: rate,
            last_update: now,
        }
    }

    /// Creates a bucket that never runs dry.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0.0
    }

    /// Updates the rate limit. Zero removes the limit.
    pub fn set_rate(&mut self, bytes_per_sec: u64) {
        self.rate = bytes_per_sec as f64;
        self.max_tokens = self.rate;
        self.tokens = self.tokens.min(self.max_tokens);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
    }

    /// Takes `bytes` tokens if they are available.
    pub fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill(now);
        let wanted = (bytes as f64).min(self.max_tokens.max(1.0));
        if self.tokens >= wanted {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Spends `bytes` tokens unconditionally, possibly going into debt.
    pub fn charge(&mut self, bytes: usize, now: Instant) {
        if self.is_unlimited() {
            return;
        }
        self.refill(now);
        self.tokens -= bytes as f64;
    }

    /// Currently available tokens, never negative.
    pub fn available(&mut self, now: Instant) -> f64 {
        if self.is_unlimited() {
            return f64::MAX;
        }
        self.refill(now);
        self.tokens.max(0.0)
    }

    /// How long until `bytes` tokens will be available.
    pub fn time_until(&mut self, bytes: usize, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        self.refill(now);
        let wanted = (bytes as f64).min(self.max_tokens.max(1.0));
        if self.tokens >= wanted {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((wanted - self.tokens) / self.rate)
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_blocks() {
        let now = Instant::now();
        let mut bucket = TokenBucket::unlimited();
        for _ in 0..1000 {
            assert!(bucket.try_consume(1 << 20, now));
        }
        assert_eq!(bucket.time_until(1 << 30, now), Duration::ZERO);
    }

    #[test]
    fn test_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1000, start);
        assert!(bucket.try_consume(1000, start));
        assert!(!bucket.try_consume(500, start));

        let later = start + Duration::from_millis(500);
        assert!(bucket.try_consume(500, later));
    }

    #[test]
    fn test_charge_goes_into_debt() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1000, start);
        bucket.charge(3000, start);
        assert_eq!(bucket.available(start), 0.0);
        assert_eq!(bucket.time_until(1000, start), Duration::from_secs(3));
    }

    #[test]
    fn test_oversized_request_waits_for_full_bucket() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1000, start);
        assert!(bucket.try_consume(16384, start));
        assert!(!bucket.try_consume(1, start));
    }
}
