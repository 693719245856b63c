use kube::Resource;

use super::EventHandler;
use crate::reconciler::Request;
use crate::workqueue::WorkQueue;

/// Requests reconciliation of the object the event is about
///
/// Updates enqueue the new object only; the old state is informational.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnqueueRequestForObject;

impl<K> EventHandler<K> for EnqueueRequestForObject
where
    K: Resource,
{
    fn create(&self, obj: &K, queue: &WorkQueue<Request>) {
        queue.add(Request::from_resource(obj));
    }

    fn update(&self, _old: &K, new: &K, queue: &WorkQueue<Request>) {
        queue.add(Request::from_resource(new));
    }

    fn delete(&self, obj: &K, queue: &WorkQueue<Request>) {
        queue.add(Request::from_resource(obj));
    }

    fn generic(&self, obj: &K, queue: &WorkQueue<Request>) {
        queue.add(Request::from_resource(obj));
    }
}
