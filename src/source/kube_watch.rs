//! Kubernetes watch source
//!
//! Adapts a kube-rs watcher into change events. The watcher only reports
//! "applied" and "deleted", so the source keeps the last seen state of every
//! object to tell creations from updates and to hand handlers the old state.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use kube::{
    api::ListParams,
    runtime::{
        watcher::{self, watcher, Event as WatchEvent},
        WatchStreamExt,
    },
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{EventStream, Source};
use crate::event::ChangeEvent;
use crate::inject::Dependencies;
use crate::reconciler::Request;

/// Watches objects of type `K` through the Kubernetes API
pub struct KubeWatch<K>
where
    K: Resource,
{
    api: Option<Api<K>>,
    config: watcher::Config,
}

impl<K> KubeWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Watch through the given API handle
    pub fn new(api: Api<K>) -> Self {
        Self {
            api: Some(api),
            config: watcher::Config::default(),
        }
    }

    /// Watch all namespaces using the controller's injected client
    pub fn all() -> Self {
        Self {
            api: None,
            config: watcher::Config::default(),
        }
    }

    /// Restrict the watch, e.g. with a label selector
    pub fn with_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }
}

impl<K> Source<K> for KubeWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn start(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<EventStream<K>>> {
        let KubeWatch { api, config } = *self;
        async move {
            let api = api.ok_or_else(|| {
                anyhow::anyhow!("watch source has no API handle; no client was injected")
            })?;
            let kind = K::kind(&K::DynamicType::default()).into_owned();

            // Fail registration early if the resource type is not served.
            api.list(&ListParams::default().limit(1))
                .await
                .map_err(|e| anyhow::anyhow!("cannot list {}: {}", kind, e))?;
            info!(kind = %kind, "Watch established");

            let mut cache = WatchCache::default();
            let events = watcher(api, config)
                .default_backoff()
                .map(move |event| match event {
                    Ok(event) => cache.apply(event),
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Watch error, retrying");
                        Vec::new()
                    }
                })
                .flat_map(stream::iter)
                .boxed();
            Ok(events)
        }
        .boxed()
    }

    fn inject(&mut self, deps: &Dependencies) -> anyhow::Result<()> {
        if self.api.is_none() {
            self.api = Some(Api::all(deps.require_client()?));
        }
        Ok(())
    }
}

/// Last seen state of every watched object
struct WatchCache<K> {
    objects: HashMap<Request, K>,
    /// Keys seen since the current relist started
    relisting: Option<HashSet<Request>>,
}

impl<K> Default for WatchCache<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            relisting: None,
        }
    }
}

impl<K> WatchCache<K>
where
    K: Resource + Clone,
{
    fn apply(&mut self, event: WatchEvent<K>) -> Vec<ChangeEvent<K>> {
        match event {
            WatchEvent::Apply(obj) => vec![self.upsert(obj)],
            WatchEvent::Delete(obj) => {
                self.objects.remove(&Request::from_resource(&obj));
                vec![ChangeEvent::Deleted(obj)]
            }
            WatchEvent::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            WatchEvent::InitApply(obj) => {
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(Request::from_resource(&obj));
                }
                vec![self.upsert(obj)]
            }
            WatchEvent::InitDone => {
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                // Objects deleted while the watch was down.
                let gone: Vec<Request> = self
                    .objects
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                if !gone.is_empty() {
                    debug!(count = gone.len(), "Objects disappeared during relist");
                }
                gone.iter()
                    .filter_map(|key| self.objects.remove(key))
                    .map(ChangeEvent::Deleted)
                    .collect()
            }
        }
    }

    fn upsert(&mut self, obj: K) -> ChangeEvent<K> {
        match self.objects.insert(Request::from_resource(&obj), obj.clone()) {
            Some(old) => ChangeEvent::Updated { old, new: obj },
            None => ChangeEvent::Created(obj),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, resource_version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_distinguishes_create_and_update() {
        let mut cache = WatchCache::default();

        let events = cache.apply(WatchEvent::Apply(pod("a", "1")));
        assert_eq!(events, vec![ChangeEvent::Created(pod("a", "1"))]);

        let events = cache.apply(WatchEvent::Apply(pod("a", "2")));
        assert_eq!(
            events,
            vec![ChangeEvent::Updated {
                old: pod("a", "1"),
                new: pod("a", "2"),
            }]
        );
    }

    #[test]
    fn test_delete_forgets_object() {
        let mut cache = WatchCache::default();
        cache.apply(WatchEvent::Apply(pod("a", "1")));

        let events = cache.apply(WatchEvent::Delete(pod("a", "1")));
        assert_eq!(events, vec![ChangeEvent::Deleted(pod("a", "1"))]);

        let events = cache.apply(WatchEvent::Apply(pod("a", "3")));
        assert_eq!(events, vec![ChangeEvent::Created(pod("a", "3"))]);
    }

    #[test]
    fn test_relist_reports_missing_objects_as_deleted() {
        let mut cache = WatchCache::default();
        cache.apply(WatchEvent::Apply(pod("a", "1")));
        cache.apply(WatchEvent::Apply(pod("b", "1")));

        assert!(cache.apply(WatchEvent::Init).is_empty());
        let events = cache.apply(WatchEvent::InitApply(pod("a", "2")));
        assert!(matches!(events.as_slice(), [ChangeEvent::Updated { .. }]));

        let events = cache.apply(WatchEvent::InitDone);
        assert_eq!(events, vec![ChangeEvent::Deleted(pod("b", "1"))]);
        assert_eq!(cache.objects.len(), 1);
    }
}
