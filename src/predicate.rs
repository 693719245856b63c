//! Event filters
//!
//! A watch delivers an event to its handler only if every predicate of the
//! watch accepts it.

use kube::Resource;

use crate::event::ChangeEvent;

/// Filters change events on `K`; every kind is accepted unless overridden
pub trait Predicate<K>: Send + Sync {
    fn create(&self, _obj: &K) -> bool {
        true
    }

    fn update(&self, _old: &K, _new: &K) -> bool {
        true
    }

    fn delete(&self, _obj: &K) -> bool {
        true
    }

    fn generic(&self, _obj: &K) -> bool {
        true
    }

    fn accepts(&self, event: &ChangeEvent<K>) -> bool {
        match event {
            ChangeEvent::Created(obj) => self.create(obj),
            ChangeEvent::Updated { old, new } => self.update(old, new),
            ChangeEvent::Deleted(obj) => self.delete(obj),
            ChangeEvent::Generic(obj) => self.generic(obj),
        }
    }
}

/// Passes updates only when `metadata.generation` changed
///
/// Skips status-only and metadata-only updates of objects with a spec.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenerationChanged;

impl<K: Resource> Predicate<K> for GenerationChanged {
    fn update(&self, old: &K, new: &K) -> bool {
        old.meta().generation != new.meta().generation
    }
}

/// Passes updates only when `metadata.resourceVersion` changed
///
/// Drops the periodic resync updates that carry an unchanged object.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceVersionChanged;

impl<K: Resource> Predicate<K> for ResourceVersionChanged {
    fn update(&self, old: &K, new: &K) -> bool {
        old.meta().resource_version != new.meta().resource_version
    }
}

/// Predicate backed by a closure over the whole event, see [`from_fn`]
pub struct PredicateFn<F> {
    f: F,
}

pub fn from_fn<K, F>(f: F) -> PredicateFn<F>
where
    F: Fn(&ChangeEvent<K>) -> bool + Send + Sync,
{
    PredicateFn { f }
}

impl<K, F> Predicate<K> for PredicateFn<F>
where
    F: Fn(&ChangeEvent<K>) -> bool + Send + Sync,
{
    fn accepts(&self, event: &ChangeEvent<K>) -> bool {
        (self.f)(event)
    }
}

/// Whether every predicate accepts `event`; an empty set accepts everything
pub(crate) fn all_accept<K>(predicates: &[Box<dyn Predicate<K>>], event: &ChangeEvent<K>) -> bool {
    predicates.iter().all(|p| p.accepts(event))
}
