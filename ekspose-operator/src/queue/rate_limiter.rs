//! Retry delays for the work queue.
//!
//! [`ControllerRateLimiter`] combines two limits and uses whichever asks for
//! the longer wait:
//!
//! - [`ItemExponentialBackoff`]: per key, doubling on every failure up to a cap.
//!   Cleared by `forget` once the key reconciles successfully.
//! - [`TokenBucket`]: shared by all keys, bounding the overall retry rate so a
//!   burst of failing keys cannot turn into a retry storm.

use crate::config::QueueConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Per-key exponential backoff.
pub struct ItemExponentialBackoff<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialBackoff<K> {
    /// Create a backoff starting at `base_delay` and capped at `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long it should wait.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }
}

/// Token bucket shared by every key.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket refilling at `qps` tokens per second.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Reserve one token and return how long the caller must wait for it.
    pub fn reserve(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

/// Default limiter for the controller queue: the slower of per-key
/// exponential backoff and the shared token bucket.
pub struct ControllerRateLimiter<K> {
    backoff: ItemExponentialBackoff<K>,
    bucket: TokenBucket,
}

impl<K: Eq + Hash + Clone> ControllerRateLimiter<K> {
    /// Build the limiter from queue configuration.
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            backoff: ItemExponentialBackoff::new(config.base_delay(), config.max_delay()),
            bucket: TokenBucket::new(config.qps, config.burst),
        }
    }

    /// Delay before `key` may be retried.
    pub fn when(&self, key: &K) -> Duration {
        self.backoff.when(key).max(self.bucket.reserve())
    }

    /// Failures recorded for `key`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.backoff.num_requeues(key)
    }

    /// Clear the per-key history of `key`.
    pub fn forget(&self, key: &K) {
        self.backoff.forget(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "ns1/web".to_string();

        let delays: Vec<_> = (0..10).map(|_| backoff.when(&key)).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert_eq!(delays[7], Duration::from_millis(640));
        assert_eq!(delays[8], Duration::from_secs(1));
        assert_eq!(delays[9], Duration::from_secs(1));
        assert_eq!(backoff.num_requeues(&key), 10);
    }

    #[test]
    fn backoff_survives_huge_failure_counts() {
        let backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = "ns1/web".to_string();
        for _ in 0..200 {
            assert!(backoff.when(&key) <= Duration::from_secs(1000));
        }
        assert_eq!(backoff.when(&key), Duration::from_secs(1000));
    }

    #[test]
    fn backoff_is_tracked_per_key_and_forgotten() {
        let backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let a = "ns1/a".to_string();
        let b = "ns1/b".to_string();

        backoff.when(&a);
        backoff.when(&a);
        assert_eq!(backoff.when(&b), Duration::from_millis(5));
        assert_eq!(backoff.num_requeues(&a), 2);

        backoff.forget(&a);
        assert_eq!(backoff.num_requeues(&a), 0);
        assert_eq!(backoff.when(&a), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let bucket = TokenBucket::new(10.0, 2);

        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_millis(100));
        assert_eq!(bucket.reserve(), Duration::from_millis(200));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_limiter_takes_the_longer_delay() {
        let config = QueueConfig {
            base_delay_ms: 5,
            max_delay_secs: 1000,
            qps: 1.0,
            burst: 1,
        };
        let limiter = ControllerRateLimiter::new(&config);
        let key = "ns1/web".to_string();

        // Burst token available, per-key backoff wins.
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        // Bucket empty, its one-second refill wins.
        assert_eq!(limiter.when(&key), Duration::from_secs(1));

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
