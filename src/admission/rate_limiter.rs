// src/admission/rate_limiter.rs
//! Token bucket rate limiting
//!
//! Tokens are floats refilled by `elapsed_secs * refill_rate` on every check,
//! clamped at the bucket size. [`TokenBucket::allow`] never blocks: a denied
//! call leaves the bucket untouched and the caller decides whether to wait.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Single token bucket
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket holding `rate` tokens, refilled at `rate` per second. Starts full.
    pub fn new(rate: f64) -> Self {
        Self::with_capacity(rate, rate)
    }

    pub fn with_capacity(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `cost` tokens if available
    pub fn allow(&self, cost: f64) -> bool {
        self.allow_at(cost, Instant::now())
    }

    fn allow_at(&self, cost: f64, now: Instant) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        state.last_refill = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens available as of the last check
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Token buckets keyed by an arbitrary string (usually a domain)
pub struct KeyedRateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
    default_rate: f64,
}

impl KeyedRateLimiter {
    /// Buckets created on first use get `default_rate` tokens per second
    pub fn new(default_rate: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            default_rate,
        }
    }

    /// Check a cost-1 request for `key`
    pub fn allow(&self, key: &str) -> bool {
        self.bucket(key).allow(1.0)
    }

    /// Replace the bucket for `key` with a fresh one at `rate` per second
    pub fn set_rate(&self, key: impl Into<String>, rate: f64) {
        self.buckets.insert(key.into(), Arc::new(TokenBucket::new(rate)));
    }

    /// Refill rate that applies to `key`
    pub fn rate_for(&self, key: &str) -> f64 {
        self.buckets
            .get(key)
            .map(|bucket| bucket.refill_rate())
            .unwrap_or(self.default_rate)
    }

    pub fn default_rate(&self) -> f64 {
        self.default_rate
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.default_rate)));
        Arc::clone(bucket.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_deny() {
        let bucket = TokenBucket::new(3.0);
        assert!(bucket.allow(1.0));
        assert!(bucket.allow(1.0));
        assert!(bucket.allow(1.0));
        assert!(!bucket.allow(1.0));
    }

    #[test]
    fn test_denied_call_has_no_side_effect() {
        let bucket = TokenBucket::with_capacity(5.0, 0.0);
        assert!(bucket.allow(4.0));
        assert!(!bucket.allow(2.0));
        // the failed call above must not have consumed the remaining token
        assert!(bucket.allow(1.0));
    }

    #[test]
    fn test_refill_proportional_to_elapsed() {
        let bucket = TokenBucket::new(10.0);
        let start = Instant::now();
        for _ in 0..10 {
            assert!(bucket.allow_at(1.0, start));
        }
        assert!(!bucket.allow_at(1.0, start));

        // half a second at 10/s buys five tokens
        let later = start + Duration::from_millis(500);
        for _ in 0..5 {
            assert!(bucket.allow_at(1.0, later));
        }
        assert!(!bucket.allow_at(1.0, later));
    }

    #[test]
    fn test_refill_clamped_at_max() {
        let bucket = TokenBucket::new(2.0);
        let start = Instant::now();
        assert!(bucket.allow_at(2.0, start));

        let much_later = start + Duration::from_secs(3600);
        assert!(bucket.allow_at(0.0, much_later));
        assert_eq!(bucket.tokens(), 2.0);
    }

    #[test]
    fn test_keyed_buckets_are_independent() {
        let limiter = KeyedRateLimiter::new(1.0);
        assert!(limiter.allow("a.example.com"));
        assert!(!limiter.allow("a.example.com"));
        assert!(limiter.allow("b.example.com"));
    }

    #[test]
    fn test_set_rate_override() {
        let limiter = KeyedRateLimiter::new(100.0);
        limiter.set_rate("slow.example.com", 2.0);

        assert_eq!(limiter.rate_for("slow.example.com"), 2.0);
        assert_eq!(limiter.rate_for("other.example.com"), 100.0);

        assert!(limiter.allow("slow.example.com"));
        assert!(limiter.allow("slow.example.com"));
        assert!(!limiter.allow("slow.example.com"));
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_in_range(
            rate in 1.0f64..50.0,
            steps in prop::collection::vec((0u64..400, 0.0f64..5.0), 1..60),
        ) {
            let bucket = TokenBucket::new(rate);
            let mut now = Instant::now();

            for (advance_ms, cost) in steps {
                now += Duration::from_millis(advance_ms);
                bucket.allow_at(cost, now);
                let tokens = bucket.tokens();
                prop_assert!(tokens >= 0.0);
                prop_assert!(tokens <= rate);
            }
        }

        #[test]
        fn prop_saturated_window_bounded(rate in 1u32..40) {
            let bucket = TokenBucket::new(rate as f64);
            let start = Instant::now();

            // drain the initial burst
            while bucket.allow_at(1.0, start) {}

            // one second of evenly spaced attempts can admit at most `rate`
            let mut allowed = 0;
            for i in 1..=1000u64 {
                if bucket.allow_at(1.0, start + Duration::from_millis(i)) {
                    allowed += 1;
                }
            }
            prop_assert!(allowed <= rate);
        }
    }
}
