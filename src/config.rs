//! Runtime configuration.
//!
//! Plain struct with defaults and builder-style setters. Everything here
//! is a deployment knob: page geometry, liveness timing, rate limits, and
//! the low-memory flag the embedder flips when the process is under
//! pressure.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// A token-bucket rate: `capacity` tokens, refilled at `per_second`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub capacity: f64,
    pub per_second: f64,
}

/// Session runtime configuration.
#[derive(Clone)]
pub struct Config {
    /// Size of one pooled output page in bytes. A single wire command must
    /// fit in one page; exceeding it is a fatal configuration error.
    pub page_size: usize,

    /// How often the liveness sweep runs and pings connected windows.
    pub ping_interval: Duration,

    /// A connected window with no pong for this long is marked disconnected.
    pub pong_timeout: Duration,

    /// A disconnected window is destroyed after this long without a
    /// reconnect. Ignored while `low_memory` is set: disconnected windows
    /// are then evicted on the next sweep regardless of elapsed time.
    pub destroy_timeout: Duration,

    /// Window-creation budget, keyed by client IP.
    pub create_rate: RateLimit,

    /// Input-message budget per window. Messages over budget are dropped
    /// and counted, never queued.
    pub message_rate: RateLimit,

    /// Pending block deletes are flushed early once this many accumulate.
    pub delete_buffer_cap: usize,

    /// Set by the embedder under memory pressure. The liveness sweep evicts
    /// disconnected windows eagerly while this is set.
    pub low_memory: Arc<AtomicBool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 16 * 1024,
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(15),
            destroy_timeout: Duration::from_secs(60),
            create_rate: RateLimit {
                capacity: 5.0,
                per_second: 1.0,
            },
            message_rate: RateLimit {
                capacity: 64.0,
                per_second: 32.0,
            },
            delete_buffer_cap: 64,
            low_memory: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.ping_interval = d;
        self
    }

    pub fn pong_timeout(mut self, d: Duration) -> Self {
        self.pong_timeout = d;
        self
    }

    pub fn destroy_timeout(mut self, d: Duration) -> Self {
        self.destroy_timeout = d;
        self
    }

    pub fn create_rate(mut self, rate: RateLimit) -> Self {
        self.create_rate = rate;
        self
    }

    pub fn message_rate(mut self, rate: RateLimit) -> Self {
        self.message_rate = rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let cfg = Config::new()
            .page_size(4096)
            .pong_timeout(Duration::from_secs(3));
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.pong_timeout, Duration::from_secs(3));
        // Untouched fields keep defaults.
        assert_eq!(cfg.delete_buffer_cap, 64);
    }
}
