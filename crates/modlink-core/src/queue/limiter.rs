//! Delay policies for the reconcile work queue.
//!
//! Failed items back off exponentially per key while a global token bucket
//! caps the aggregate requeue rate; the effective delay is the larger of the
//! two, mirroring the classic controller work queue configuration.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Default base delay for the per-item exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default cap for the per-item exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default refill rate of the global token bucket, in items per second.
pub const DEFAULT_BUCKET_RATE: f64 = 50.0;

/// Default burst capacity of the global token bucket.
pub const DEFAULT_BUCKET_BURST: u32 = 300;

/// Per-item exponential backoff: `base * 2^failures`, capped.
#[derive(Debug)]
pub struct ItemBackoff {
    base: Duration,
    cap: Duration,
    failures: HashMap<String, u32>,
}

impl ItemBackoff {
    /// Creates a backoff policy with the given base delay and cap.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: HashMap::new(),
        }
    }

    /// Records a failure for the key and returns the delay before its retry.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = *failures;
        *failures += 1;

        // Saturate the exponent well before the f64 math can overflow.
        let delay =
            Duration::from_secs_f64(self.base.as_secs_f64() * 2f64.powi(exponent.min(62) as i32));
        delay.min(self.cap)
    }

    /// Clears the failure history for a key after a successful pass.
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of recorded failures for a key.
    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Global token bucket limiting the aggregate requeue rate.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket refilling at `rate` tokens per second with the given
    /// burst capacity, starting full.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    /// Takes one token, returning how long the caller must wait for it.
    pub fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Combined limiter: the effective delay for a key is the maximum of its
/// exponential backoff and the global bucket reservation.
#[derive(Debug)]
pub struct QueueRateLimiter {
    backoff: ItemBackoff,
    bucket: TokenBucket,
}

impl QueueRateLimiter {
    /// Creates a limiter with explicit tuning.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, rate: f64, burst: u32) -> Self {
        Self {
            backoff: ItemBackoff::new(base, cap),
            bucket: TokenBucket::new(rate, burst),
        }
    }

    /// Creates a limiter with the standard controller tuning: 500 ms base
    /// delay capped at 1000 s, 50 items/s with a burst of 300.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BUCKET_RATE,
            DEFAULT_BUCKET_BURST,
        )
    }

    /// Records a failure for the key and returns the delay before its retry.
    pub fn delay(&mut self, key: &str) -> Duration {
        self.backoff.next_delay(key).max(self.bucket.reserve())
    }

    /// Clears the failure history for a key.
    pub fn forget(&mut self, key: &str) {
        self.backoff.forget(key);
    }

    /// Number of recorded failures for a key.
    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.backoff.failures(key)
    }
}

impl Default for QueueRateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(500), Duration::from_secs(4));

        assert_eq!(backoff.next_delay("key"), Duration::from_millis(500));
        assert_eq!(backoff.next_delay("key"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("key"), Duration::from_secs(2));
        assert_eq!(backoff.next_delay("key"), Duration::from_secs(4));
        // Capped from here on.
        assert_eq!(backoff.next_delay("key"), Duration::from_secs(4));
    }

    #[test]
    fn backoff_tracks_keys_independently() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(500), Duration::from_secs(1000));

        assert_eq!(backoff.next_delay("a"), Duration::from_millis(500));
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("b"), Duration::from_millis(500));
    }

    #[test]
    fn forget_resets_the_failure_count() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(500), Duration::from_secs(1000));
        backoff.next_delay("key");
        backoff.next_delay("key");
        assert_eq!(backoff.failures("key"), 2);

        backoff.forget("key");
        assert_eq!(backoff.failures("key"), 0);
        assert_eq!(backoff.next_delay("key"), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_burst_is_free_then_rate_limited() {
        let mut bucket = TokenBucket::new(10.0, 3);

        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);

        // The bucket is empty: the next reservations queue up behind the
        // 10/s refill rate.
        let fourth = bucket.reserve();
        let fifth = bucket.reserve();
        assert!(fourth > Duration::ZERO);
        assert!(fifth > fourth);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(10.0, 1);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert!(bucket.reserve() > Duration::ZERO);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }
}
