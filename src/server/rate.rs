//! Token-bucket rate limiting.
//!
//! Two budgets use this: window creation (keyed by client IP) and
//! per-window input messages. Denial is silent by design - the caller
//! drops or rejects, never queues.

use std::time::{Duration, Instant};

use crate::config::RateLimit;

pub(crate) struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: RateLimit) -> Self {
        Self {
            capacity: rate.capacity,
            tokens: rate.capacity,
            per_second: rate.per_second,
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.per_second).min(self.capacity);
    }

    /// Test hook: pretend `elapsed` passed since the last refill.
    #[cfg(test)]
    pub fn backdate(&mut self, elapsed: Duration) {
        self.last_refill -= elapsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(capacity: f64, per_second: f64) -> RateLimit {
        RateLimit {
            capacity,
            per_second,
        }
    }

    #[test]
    fn test_burst_up_to_capacity_then_denied() {
        let mut bucket = TokenBucket::new(rate(3.0, 1.0));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refills_over_time() {
        let mut bucket = TokenBucket::new(rate(2.0, 10.0));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        bucket.backdate(Duration::from_millis(150)); // 1.5 tokens
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut bucket = TokenBucket::new(rate(2.0, 100.0));
        bucket.backdate(Duration::from_secs(60));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
