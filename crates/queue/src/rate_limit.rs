//! Retry delay policies for [`crate::WorkQueue::add_rate_limited`].

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long an item waits before it is re-added.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Clear failure tracking for `item`.
    fn forget(&self, item: &T);
    /// Consecutive failures recorded for `item`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let backoff = 1u128
            .checked_shl(exp)
            .and_then(|factor| self.base.as_nanos().checked_mul(factor))
            .filter(|nanos| *nanos < self.max.as_nanos())
            .and_then(|nanos| u64::try_from(nanos).ok());
        match backoff {
            Some(nanos) => Duration::from_nanos(nanos),
            None => self.max,
        }
    }

    fn forget(&self, item: &T) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item: `qps` refill rate, `burst` capacity.
///
/// A `qps` that is not a positive finite number disables the bucket.
pub struct BucketRateLimiter {
    qps: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let qps = (qps.is_finite() && qps > 0.0).then_some(qps);
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let Some(qps) = self.qps else { return Duration::ZERO };
        let mut b = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.last = now;
        b.tokens = (b.tokens + elapsed * qps).min(self.burst) - 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Combines limiters by taking the longest delay.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Per-item exponential backoff (5ms .. 1000s) combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}
