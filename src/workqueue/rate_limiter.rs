//! Per-key rate limiters
//!
//! A rate limiter decides how long a key waits before it is retried. It keeps
//! one attempt counter per key; `when` advances it and `forget` resets it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use super::lock;

/// Default base delay of [`ExponentialBackoff`]
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default maximum delay of [`ExponentialBackoff`]
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Computes retry delays per key
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be retried; counts as one more attempt
    fn when(&self, item: &K) -> Duration;

    /// Reset the attempt counter of `item`
    fn forget(&self, item: &K);

    /// Attempts recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &K) -> u32;
}

/// `base * 2^attempts`, capped at `max`
///
/// Deterministic doubling: the first retry waits `base`, every consecutive
/// failure doubles the wait until `max` is reached.
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl<K> Default for ExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Delay for the given exponent, saturating at `max` instead of overflowing
fn backoff_delay(base: Duration, max: Duration, exponent: u32) -> Duration {
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

impl<K> RateLimiter<K> for ExponentialBackoff<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn when(&self, item: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let attempts = failures.entry(item.clone()).or_insert(0);
        let exponent = *attempts;
        *attempts = attempts.saturating_add(1);
        backoff_delay(self.base, self.max, exponent)
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

/// `fast` for the first `max_fast_attempts` retries, `slow` afterwards
pub struct FastSlow<K> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    attempts: Mutex<HashMap<K, u32>>,
}

impl<K> FastSlow<K> {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> RateLimiter<K> for FastSlow<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn when(&self, item: &K) -> Duration {
        let mut attempts = lock(&self.attempts);
        let count = attempts.entry(item.clone()).or_insert(0);
        *count = count.saturating_add(1);
        if *count <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, item: &K) {
        lock(&self.attempts).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.attempts).get(item).copied().unwrap_or(0)
    }
}

/// Worst case of several limiters
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&self, item: &K) -> Duration {
        // Every limiter must see the attempt, so no short-circuiting here.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

impl<K, R> RateLimiter<K> for Box<R>
where
    R: RateLimiter<K> + ?Sized,
{
    fn when(&self, item: &K) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &K) {
        (**self).forget(item)
    }

    fn num_requeues(&self, item: &K) -> u32 {
        (**self).num_requeues(item)
    }
}
