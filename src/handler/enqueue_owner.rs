use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use super::EventHandler;
use crate::reconciler::Request;
use crate::workqueue::WorkQueue;

/// Requests reconciliation of the owners of the changed object
///
/// Matches owner references by kind and API group. Owners are looked up in the
/// namespace of the owned object.
#[derive(Clone, Debug)]
pub struct EnqueueRequestForOwner {
    group: String,
    kind: String,
    controller_only: bool,
}

impl EnqueueRequestForOwner {
    /// Match owner references of type `O`
    pub fn new<O>() -> Self
    where
        O: Resource<DynamicType = ()>,
    {
        Self {
            group: O::group(&()).into_owned(),
            kind: O::kind(&()).into_owned(),
            controller_only: false,
        }
    }

    /// Only follow the owner reference marked as the managing controller
    pub fn controller_only(mut self) -> Self {
        self.controller_only = true;
        self
    }

    fn matches(&self, owner: &OwnerReference) -> bool {
        if owner.kind != self.kind {
            return false;
        }
        if self.controller_only && owner.controller != Some(true) {
            return false;
        }
        // "apps/v1" has group "apps", core "v1" has the empty group
        let group = owner
            .api_version
            .split_once('/')
            .map_or("", |(group, _)| group);
        group == self.group
    }

    fn enqueue_owners<K: Resource>(&self, obj: &K, queue: &WorkQueue<Request>) {
        let namespace = obj.namespace();
        for owner in obj.owner_references().iter().filter(|o| self.matches(o)) {
            queue.add(Request {
                namespace: namespace.clone(),
                name: owner.name.clone(),
            });
        }
    }
}

impl<K> EventHandler<K> for EnqueueRequestForOwner
where
    K: Resource,
{
    fn create(&self, obj: &K, queue: &WorkQueue<Request>) {
        self.enqueue_owners(obj, queue);
    }

    /// Both states: an object that changed owners notifies the previous one too
    fn update(&self, old: &K, new: &K, queue: &WorkQueue<Request>) {
        self.enqueue_owners(old, queue);
        self.enqueue_owners(new, queue);
    }

    fn delete(&self, obj: &K, queue: &WorkQueue<Request>) {
        self.enqueue_owners(obj, queue);
    }

    fn generic(&self, obj: &K, queue: &WorkQueue<Request>) {
        self.enqueue_owners(obj, queue);
    }
}
