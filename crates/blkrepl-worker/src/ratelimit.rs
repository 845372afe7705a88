//! Rate limiting for log messages emitted from completion context.
//!
//! A token bucket decides whether a message may be printed; suppressed
//! messages are counted and reported with the next one that gets through.

use std::time::Instant;

use parking_lot::Mutex;

/// Messages allowed in a burst.
pub const DEFAULT_BURST: u64 = 10;
/// Interval over which the burst refills, in microseconds.
pub const DEFAULT_INTERVAL_US: u64 = 5_000_000;

/// Token bucket over a monotonic microsecond clock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: u64,
    interval_us: u64,
    last_refill_us: u64,
}

impl TokenBucket {
    /// Create a full bucket refilling `capacity` tokens every `interval_us`.
    pub fn new(capacity: u64, interval_us: u64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            interval_us: interval_us.max(1),
            last_refill_us: 0,
        }
    }

    /// Refill tokens based on elapsed time since last refill.
    pub fn refill(&mut self, now_us: u64) {
        let elapsed_us = now_us.saturating_sub(self.last_refill_us);
        let to_add =
            (self.capacity as u128 * elapsed_us as u128 / self.interval_us as u128) as u64;
        if to_add == 0 {
            // partial tokens keep accruing
            return;
        }
        self.tokens = self.capacity.min(self.tokens.saturating_add(to_add));
        if self.tokens == self.capacity {
            self.last_refill_us = now_us;
        } else {
            let used_us = to_add as u128 * self.interval_us as u128 / self.capacity as u128;
            self.last_refill_us += used_us as u64;
        }
    }

    /// Try to take one token.
    pub fn try_take(&mut self, now_us: u64) -> bool {
        self.refill(now_us);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> u64 {
        self.tokens
    }
}

struct LimiterState {
    bucket: TokenBucket,
    suppressed: u64,
}

/// Decides whether a log line may be emitted.
pub struct LogRateLimiter {
    origin: Instant,
    state: Mutex<LimiterState>,
}

impl LogRateLimiter {
    /// Burst of 10 messages per 5 seconds.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BURST, DEFAULT_INTERVAL_US)
    }

    /// Custom burst and refill interval.
    pub fn with_limits(burst: u64, interval_us: u64) -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::new(burst, interval_us),
                suppressed: 0,
            }),
        }
    }

    /// Returns `Some(suppressed)` if a message may be printed now, where
    /// `suppressed` is how many were dropped since the last one.
    pub fn check(&self) -> Option<u64> {
        let now_us = self.origin.elapsed().as_micros() as u64;
        self.check_at(now_us)
    }

    /// [`LogRateLimiter::check`] with an explicit clock.
    pub fn check_at(&self, now_us: u64) -> Option<u64> {
        let mut state = self.state.lock();
        if state.bucket.try_take(now_us) {
            Some(std::mem::take(&mut state.suppressed))
        } else {
            state.suppressed += 1;
            None
        }
    }
}

impl Default for LogRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Log through `$limiter` with the given tracing macro, noting suppressed lines.
#[macro_export]
macro_rules! ratelimited {
    ($limiter:expr, $level:ident, $($arg:tt)+) => {
        if let Some(suppressed) = $limiter.check() {
            if suppressed > 0 {
                tracing::$level!("{} messages suppressed", suppressed);
            }
            tracing::$level!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_burst_then_empty() {
        let mut b = TokenBucket::new(3, 1_000_000);
        assert!(b.try_take(0));
        assert!(b.try_take(0));
        assert!(b.try_take(0));
        assert!(!b.try_take(0));
    }

    #[test]
    fn test_bucket_refills() {
        let mut b = TokenBucket::new(2, 1_000_000);
        b.try_take(0);
        b.try_take(0);
        assert!(!b.try_take(1));
        assert!(b.try_take(500_000));
    }

    #[test]
    fn test_bucket_carries_partial_tokens() {
        let mut b = TokenBucket::new(2, 1_000_000);
        b.try_take(0);
        b.try_take(0);
        assert!(!b.try_take(300_000));
        assert!(b.try_take(500_000));
        assert!(!b.try_take(999_999));
        assert!(b.try_take(1_000_000));
        assert_eq!(b.available(), 0);
    }

    #[test]
    fn test_bucket_caps_at_capacity() {
        let mut b = TokenBucket::new(3, 1_000);
        b.try_take(0);
        b.refill(1_000_000);
        assert_eq!(b.available(), 3);
    }

    #[test]
    fn test_limiter_counts_suppressed() {
        let l = LogRateLimiter::with_limits(1, 1_000_000);
        assert_eq!(l.check_at(0), Some(0));
        assert_eq!(l.check_at(10), None);
        assert_eq!(l.check_at(20), None);
        assert_eq!(l.check_at(2_000_000), Some(2));
    }
}
