//! Fan-out handler
//!
//! Enqueues requests for *other* objects computed from the changed one, e.g.
//! every Pod scheduled on a Node whose capacity changed.

use super::EventHandler;
use crate::inject::Dependencies;
use crate::reconciler::Request;
use crate::workqueue::WorkQueue;

/// Computes the requests an object change fans out to
///
/// Mappers are expected to be total. A panicking mapper propagates to the
/// caller of the handler and leaves the queue untouched for that event.
pub trait Mapper<K>: Send + Sync {
    fn map(&self, obj: &K) -> Vec<Request>;

    /// Receive dependencies once, when the owning handler is registered
    fn inject(&mut self, _deps: &Dependencies) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Mapper backed by a closure, see [`map_fn`]
pub struct MapFn<F> {
    f: F,
}

/// Build a mapper from a closure
pub fn map_fn<K, F>(f: F) -> MapFn<F>
where
    F: Fn(&K) -> Vec<Request> + Send + Sync,
{
    MapFn { f }
}

impl<K, F> Mapper<K> for MapFn<F>
where
    F: Fn(&K) -> Vec<Request> + Send + Sync,
{
    fn map(&self, obj: &K) -> Vec<Request> {
        (self.f)(obj)
    }
}

/// Enqueues the requests a [`Mapper`] computes for each event
///
/// On update the mapper runs on both the old and the new object and every
/// resulting request is enqueued, so targets that were related before the
/// change are notified as well as the ones related after it. Duplicates
/// collapse in the queue.
pub struct EnqueueRequestsFromMapFunc<K> {
    mapper: Box<dyn Mapper<K>>,
}

impl<K> EnqueueRequestsFromMapFunc<K> {
    pub fn new(mapper: impl Mapper<K> + 'static) -> Self {
        Self {
            mapper: Box::new(mapper),
        }
    }

    /// Shorthand for `EnqueueRequestsFromMapFunc::new(map_fn(f))`
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&K) -> Vec<Request> + Send + Sync + 'static,
    {
        Self::new(map_fn(f))
    }

    fn map_and_enqueue(&self, obj: &K, queue: &WorkQueue<Request>) {
        enqueue_all(self.mapper.map(obj), queue);
    }
}

fn enqueue_all(requests: Vec<Request>, queue: &WorkQueue<Request>) {
    for request in requests {
        queue.add(request);
    }
}

impl<K> EventHandler<K> for EnqueueRequestsFromMapFunc<K> {
    fn create(&self, obj: &K, queue: &WorkQueue<Request>) {
        self.map_and_enqueue(obj, queue);
    }

    fn update(&self, old: &K, new: &K, queue: &WorkQueue<Request>) {
        // Map both sides before adding so a mapper panic leaves the queue untouched.
        let mut requests = self.mapper.map(old);
        requests.extend(self.mapper.map(new));
        enqueue_all(requests, queue);
    }

    fn delete(&self, obj: &K, queue: &WorkQueue<Request>) {
        self.map_and_enqueue(obj, queue);
    }

    fn generic(&self, obj: &K, queue: &WorkQueue<Request>) {
        self.map_and_enqueue(obj, queue);
    }

    fn inject(&mut self, deps: &Dependencies) -> anyhow::Result<()> {
        self.mapper.inject(deps)
    }
}
