//! Work queue implementation

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use prometheus::{Counter, Gauge};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{instant_after, lock};
use super::rate_limiter::{ExponentialBackoff, RateLimiter};
use crate::metrics;

/// Deduplicating, rate-limited queue with in-flight tracking
///
/// Keys move through three sets:
/// - `queue`: ready to be handed out, in FIFO order
/// - `processing`: handed out by [`get`](Self::get), not yet [`done`](Self::done)
/// - `dirty`: needs processing; every queued key is dirty, and an in-flight
///   key becomes dirty when it is added again
///
/// Delayed keys wait in a min-heap until their release time and then go
/// through the same path as [`add`](Self::add).
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    getters: AtomicUsize,
    limiter: Box<dyn RateLimiter<K>>,
    depth: Gauge,
    adds: Counter,
    retries: Counter,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BinaryHeap<Waiting<K>>,
    /// Earliest pending release time per delayed key
    ready_at: HashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

/// A delayed key; ordered so the heap pops the earliest release first
struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    item: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> State<K>
where
    K: Clone + Eq + Hash,
{
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            ready_at: HashMap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true if the key became available to getters
    fn insert(&mut self, item: K) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            // handed out again by done()
            return false;
        }
        self.queue.push_back(item);
        true
    }

    /// Returns true if the earliest release time of the key moved
    fn schedule(&mut self, item: K, ready_at: Instant) -> bool {
        if let Some(existing) = self.ready_at.get(&item) {
            if *existing <= ready_at {
                return false;
            }
        }
        self.ready_at.insert(item.clone(), ready_at);
        self.seq = self.seq.wrapping_add(1);
        self.waiting.push(Waiting {
            ready_at,
            seq: self.seq,
            item,
        });
        true
    }

    /// Move every delayed key whose release time has passed into the queue
    fn promote(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(top) = self.waiting.peek() {
            if top.ready_at > now {
                break;
            }
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            // Entries superseded by an earlier schedule are stale.
            if self.ready_at.get(&entry.item) != Some(&entry.ready_at) {
                continue;
            }
            self.ready_at.remove(&entry.item);
            if self.insert(entry.item) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.ready_at)
    }
}

/// Decrements the waiting-getter count when a `get` stops waiting
struct GetterGuard<'a>(&'a AtomicUsize);

impl<'a> GetterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, AtomicOrdering::SeqCst);
        Self(counter)
    }
}

impl Drop for GetterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue; `name` labels its metrics and logs
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        let name = name.into();
        let depth = metrics::WORKQUEUE_DEPTH.with_label_values(&[name.as_str()]);
        let adds = metrics::WORKQUEUE_ADDS.with_label_values(&[name.as_str()]);
        let retries = metrics::WORKQUEUE_RETRIES.with_label_values(&[name.as_str()]);
        depth.set(0.0);

        Self {
            name,
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            getters: AtomicUsize::new(0),
            limiter: Box::new(limiter),
            depth,
            adds,
            retries,
        }
    }

    /// Create a queue with the default exponential backoff
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, ExponentialBackoff::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `item` unless it is already queued
    ///
    /// If `item` is being processed it is marked dirty and handed out again
    /// once the worker calls [`done`](Self::done). Never blocks.
    pub fn add(&self, item: K) {
        let mut state = lock(&self.state);
        if state.shutting_down {
            return;
        }
        self.adds.inc();
        if state.insert(item) {
            self.depth.set(state.queue.len() as f64);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Queue `item` no earlier than `delay` from now
    ///
    /// Several pending delays for the same key collapse to the earliest.
    pub fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let mut state = lock(&self.state);
        if state.shutting_down {
            return;
        }
        let ready_at = instant_after(delay);
        if state.schedule(item, ready_at) {
            drop(state);
            // getters sleeping until a later release time must re-arm
            self.notify.notify_waiters();
        }
    }

    /// Queue `item` after the delay its rate limiter assigns
    pub fn add_rate_limited(&self, item: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.limiter.when(&item);
        self.retries.inc();
        trace!(queue = %self.name, delay_ms = delay.as_millis() as u64, "Rate limited requeue");
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    /// Rate-limited requeues of `item` since it was last forgotten
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next key and mark it in flight
    ///
    /// Returns `None` once the queue is shutting down; keys still queued at
    /// that point are not handed out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add cannot be missed.
            notified.as_mut().enable();

            let wake_at = {
                let mut state = lock(&self.state);
                if state.shutting_down {
                    return None;
                }
                state.promote(Instant::now());
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.depth.set(state.queue.len() as f64);
                    return Some(item);
                }
                state.next_ready_at()
            };

            let _waiting = GetterGuard::enter(&self.getters);
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `item` as no longer in flight
    ///
    /// If it was added while in flight it is queued again right away.
    pub fn done(&self, item: &K) {
        let mut state = lock(&self.state);
        state.processing.remove(item);
        if state.shutting_down || !state.dirty.contains(item) {
            return;
        }
        state.queue.push_back(item.clone());
        self.depth.set(state.queue.len() as f64);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Keys ready to be handed out; delayed and in-flight keys are not counted
    pub fn len(&self) -> usize {
        let mut state = lock(&self.state);
        let promoted = state.promote(Instant::now());
        let len = state.queue.len();
        if promoted > 0 {
            self.depth.set(len as f64);
            drop(state);
            self.notify.notify_waiters();
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently handed out and not yet done
    pub fn in_flight(&self) -> usize {
        lock(&self.state).processing.len()
    }

    /// Keys waiting out a delay
    pub fn delayed(&self) -> usize {
        lock(&self.state).ready_at.len()
    }

    /// Callers currently blocked in [`get`](Self::get)
    pub fn waiting_getters(&self) -> usize {
        self.getters.load(AtomicOrdering::SeqCst)
    }

    /// Stop handing out keys and release every blocked getter
    pub fn shut_down(&self) {
        let mut state = lock(&self.state);
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        debug!(
            queue = %self.name,
            queued = state.queue.len(),
            in_flight = state.processing.len(),
            "Shutting down work queue"
        );
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.state).shutting_down
    }
}
