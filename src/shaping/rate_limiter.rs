//! Token bucket rate limiter.
//!
//! Capacity equals the rate: a limiter at `R` Hz allows a burst of `R` and
//! refills at `R` tokens per second. Refill is lazy and happens inside
//! [`RateLimiter::try_acquire`]; the refill instant only advances when at
//! least one whole token was added, so slow callers do not lose fractional
//! progress.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Gate consulted once per candidate operation.
pub trait Admission: Send + Sync {
    /// Take a slot if one is available.
    fn try_acquire(&self) -> bool;
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket with capacity equal to its rate.
#[derive(Debug)]
pub struct RateLimiter {
    rate_hz: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket at `rate_hz`.
    ///
    /// # Panics
    ///
    /// Panics if `rate_hz` is 0.
    #[must_use]
    pub fn new(rate_hz: u32) -> Self {
        assert!(rate_hz > 0, "rate must be positive");
        Self {
            rate_hz,
            bucket: Mutex::new(Bucket {
                tokens: u64::from(rate_hz),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Configured rate in Hz.
    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Tokens currently available, after a refill.
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_millis();
        let added = elapsed_ms * u128::from(self.rate_hz) / 1000;
        if added > 0 {
            let capacity = u64::from(self.rate_hz);
            let added = u64::try_from(added).unwrap_or(u64::MAX);
            bucket.tokens = bucket.tokens.saturating_add(added).min(capacity);
            bucket.last_refill = now;
        }
    }

    /// Refill, then take one token if any are left.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }
}

impl Admission for RateLimiter {
    fn try_acquire(&self) -> bool {
        RateLimiter::try_acquire(self)
    }
}

/// Admission that always grants.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Admission for Unlimited {
    fn try_acquire(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_capped_at_rate() {
        let limiter = RateLimiter::new(10);
        let granted = (0..100).filter(|_| limiter.try_acquire()).count();
        assert!(granted <= 10, "granted {granted}");
        assert!(granted >= 10);
    }

    #[test]
    fn test_refills_after_one_second() {
        let limiter = RateLimiter::new(10);
        while limiter.try_acquire() {}
        std::thread::sleep(Duration::from_secs(1));
        assert!(limiter.try_acquire());
        // Refill is capped at capacity
        assert!(limiter.available() <= 10);
    }

    #[test]
    fn test_five_hz_allows_five_of_ten() {
        let limiter = RateLimiter::new(5);
        let granted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 5);
    }

    #[test]
    fn test_partial_refill() {
        let limiter = RateLimiter::new(20);
        while limiter.try_acquire() {}
        // 20 Hz: one token every 50ms
        std::thread::sleep(Duration::from_millis(120));
        let granted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert!((1..=3).contains(&granted), "granted {granted}");
    }

    #[test]
    #[should_panic(expected = "rate must be positive")]
    fn test_zero_rate_panics() {
        let _ = RateLimiter::new(0);
    }

    #[test]
    fn test_unlimited_always_grants() {
        assert!((0..1000).all(|_| Unlimited.try_acquire()));
    }
}
