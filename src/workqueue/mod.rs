//! Deduplicating, rate-limited work queue
//!
//! The queue is the only shared mutable state between event handlers and
//! workers. It guarantees:
//! - a key is queued at most once
//! - a key is handed to at most one worker at a time
//! - a key added while a worker holds it is handed out again after `done`
//! - failing keys come back after a per-key backoff

mod queue;
pub mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{ExponentialBackoff, FastSlow, MaxOf, RateLimiter};

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Longest delay the queue schedules; longer delays are held this long
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Lock a mutex, recovering the data if a holder panicked
///
/// Queue state stays consistent across a panic because every mutation is a
/// single set/deque operation.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The instant `delay` from now, saturating at [`FAR_FUTURE`] instead of overflowing
pub(crate) fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(FAR_FUTURE)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_after_saturates() {
        let before = Instant::now();
        let at = instant_after(Duration::MAX);
        assert!(at >= before + FAR_FUTURE);

        let soon = instant_after(Duration::from_secs(1));
        assert!(soon < at);
    }
}
