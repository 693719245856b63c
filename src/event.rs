//! Change events delivered by sources

/// A change observed on an object
///
/// Events are read-only once created; handlers only derive requests from them.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent<K> {
    /// The object was created (or first seen)
    Created(K),
    /// The object changed from `old` to `new`
    Updated { old: K, new: K },
    /// The object was deleted
    Deleted(K),
    /// Something outside the API signalled the object, e.g. an external system
    Generic(K),
}

impl<K> ChangeEvent<K> {
    /// The object that represents the current state
    pub fn object(&self) -> &K {
        match self {
            ChangeEvent::Created(obj) | ChangeEvent::Deleted(obj) | ChangeEvent::Generic(obj) => obj,
            ChangeEvent::Updated { new, .. } => new,
        }
    }

    /// Short name of the event kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Created(_) => "created",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Deleted(_) => "deleted",
            ChangeEvent::Generic(_) => "generic",
        }
    }
}
