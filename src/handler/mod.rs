//! Event handlers
//!
//! A handler turns a [`ChangeEvent`] into zero or more [`Request`]s and adds
//! them to the controller's work queue. Handlers never block: the queue has no
//! capacity limit and duplicate requests collapse inside it.

mod enqueue;
mod enqueue_mapped;
mod enqueue_owner;

pub use enqueue::EnqueueRequestForObject;
pub use enqueue_mapped::{map_fn, EnqueueRequestsFromMapFunc, MapFn, Mapper};
pub use enqueue_owner::EnqueueRequestForOwner;

use crate::event::ChangeEvent;
use crate::inject::Dependencies;
use crate::reconciler::Request;
use crate::workqueue::WorkQueue;

/// Maps change events on `K` to reconcile requests
///
/// One entry point per event kind. Handlers may be called concurrently and
/// only ever write to the queue.
pub trait EventHandler<K>: Send + Sync {
    fn create(&self, obj: &K, queue: &WorkQueue<Request>);

    /// Called with both states; handlers decide which of them matter
    fn update(&self, old: &K, new: &K, queue: &WorkQueue<Request>);

    fn delete(&self, obj: &K, queue: &WorkQueue<Request>);

    fn generic(&self, obj: &K, queue: &WorkQueue<Request>);

    /// Dispatch `event` to the matching entry point
    fn handle(&self, event: &ChangeEvent<K>, queue: &WorkQueue<Request>) {
        match event {
            ChangeEvent::Created(obj) => self.create(obj, queue),
            ChangeEvent::Updated { old, new } => self.update(old, new, queue),
            ChangeEvent::Deleted(obj) => self.delete(obj, queue),
            ChangeEvent::Generic(obj) => self.generic(obj, queue),
        }
    }

    /// Receive dependencies once, when registered with a controller
    fn inject(&mut self, _deps: &Dependencies) -> anyhow::Result<()> {
        Ok(())
    }
}
