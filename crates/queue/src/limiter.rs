//! Rate limiters deciding how long a failed item waits before its next attempt.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Per-item retry policy consulted by [`crate::WorkQueue::add_rate_limited`].
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again. Each call counts as one failure.
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item` (called after a successful sync).
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialFailure<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ExponentialFailure<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ExponentialFailure<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let n = failures.entry(item.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        // 2^exp overflows quickly; compare in float space and clamp.
        let nanos = self.base.as_nanos() as f64 * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items: `qps` refill rate, `burst` capacity.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: if qps > 0.0 { qps } else { 1.0 },
            burst,
            state: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let mut b = lock(&self.state);
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.last = now;
        // Reserve a token even when the bucket is empty; the deficit is the wait.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Worst case of several limiters.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        // Every limiter must observe the failure, so no short-circuiting here.
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

/// Per-item exponential backoff combined with an overall bucket, the classic
/// controller default: 5ms doubling up to 1000s, 10 qps with a burst of 100.
pub fn default_controller_rate_limiter<T>() -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    controller_rate_limiter(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
}

pub fn controller_rate_limiter<T>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOf::new(vec![
        Box::new(ExponentialFailure::<T>::new(base, max)),
        Box::new(TokenBucket::new(qps, burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let l = ExponentialFailure::new(Duration::from_millis(10), Duration::from_millis(70));
        let got: Vec<u128> = (0..5).map(|_| l.when(&"a").as_millis()).collect();
        assert_eq!(got, vec![10, 20, 40, 70, 70]);
        assert_eq!(l.num_requeues(&"a"), 5);
        // other items are tracked independently
        assert_eq!(l.when(&"b"), Duration::from_millis(10));
    }

    #[test]
    fn exponential_forget_resets() {
        let l = ExponentialFailure::new(Duration::from_millis(1), Duration::from_secs(1));
        l.when(&1u32);
        l.when(&1u32);
        l.forget(&1u32);
        assert_eq!(l.num_requeues(&1u32), 0);
        assert_eq!(l.when(&1u32), Duration::from_millis(1));
    }

    #[test]
    fn exponential_survives_huge_failure_counts() {
        let l = ExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1000));
        let mut prev = Duration::ZERO;
        for _ in 0..2000 {
            let d = l.when(&"x");
            assert!(d >= prev, "delays must not decrease");
            assert!(d <= Duration::from_secs(1000));
            prev = d;
        }
        assert_eq!(prev, Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let b = TokenBucket::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(RateLimiter::<u8>::when(&b, &0), Duration::ZERO);
        }
        let d1 = RateLimiter::<u8>::when(&b, &0);
        let d2 = RateLimiter::<u8>::when(&b, &0);
        assert!(d1 > Duration::from_millis(90) && d1 <= Duration::from_millis(100), "d1={:?}", d1);
        assert!(d2 > d1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<u8>::when(&b, &0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_is_dominated_by_backoff_within_burst() {
        let l = default_controller_rate_limiter::<&str>();
        assert_eq!(l.when(&"k"), Duration::from_millis(5));
        assert_eq!(l.when(&"k"), Duration::from_millis(10));
        assert_eq!(l.num_requeues(&"k"), 2);
        l.forget(&"k");
        assert_eq!(l.num_requeues(&"k"), 0);
    }
}
