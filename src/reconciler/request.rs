//! Reconcile request key

use std::fmt;

use kube::{Resource, ResourceExt};

/// Identifies one object to reconcile
///
/// Carries no payload: reconcilers re-read the current state of the object,
/// which is why two equal requests are the same unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    /// Namespace of the object, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Name of the object
    pub name: String,
}

impl Request {
    /// Request for a cluster-scoped object
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Request for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Request for the given object
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}
