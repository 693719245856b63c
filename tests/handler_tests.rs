//! Integration tests for event handlers
//!
//! These tests verify which requests each handler enqueues for every kind of
//! change event, and that duplicates collapse in the queue.

use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use reconcile_engine::handler::{
    map_fn, EnqueueRequestForObject, EnqueueRequestForOwner, EnqueueRequestsFromMapFunc,
    EventHandler,
};
use reconcile_engine::workqueue::WorkQueue;
use reconcile_engine::{ChangeEvent, Request};

// ============================================================================
// Test Helpers
// ============================================================================

fn pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn node(name: &str, pool: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([("pool".to_string(), pool.to_string())])),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn owned_pod(name: &str, owners: Vec<OwnerReference>) -> Pod {
    let mut pod = pod("shop", name);
    pod.metadata.owner_references = Some(owners);
    pod
}

fn owner_ref(api_version: &str, kind: &str, name: &str, controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{}", name),
        controller: Some(controller),
        ..Default::default()
    }
}

/// Pods scheduled in each node pool
fn pods_in_pool(node: &Node) -> Vec<Request> {
    let pool = node
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("pool"))
        .map(String::as_str);
    match pool {
        Some("blue") => vec![Request::namespaced("web", "blue-1"), Request::namespaced("web", "shared")],
        Some("green") => vec![Request::namespaced("web", "green-1"), Request::namespaced("web", "shared")],
        _ => Vec::new(),
    }
}

async fn drain(queue: &WorkQueue<Request>) -> Vec<Request> {
    let mut requests = Vec::new();
    while !queue.is_empty() {
        let Some(request) = queue.get().await else {
            break;
        };
        queue.done(&request);
        requests.push(request);
    }
    requests
}

// ============================================================================
// EnqueueRequestForObject
// ============================================================================

#[tokio::test]
async fn object_handler_enqueues_the_object_for_every_kind() {
    let queue = WorkQueue::with_default_rate_limiter("handler-object");
    let handler = EnqueueRequestForObject;

    handler.handle(&ChangeEvent::Created(pod("a", "created")), &queue);
    handler.handle(&ChangeEvent::Deleted(pod("a", "deleted")), &queue);
    handler.handle(&ChangeEvent::Generic(pod("a", "generic")), &queue);

    assert_eq!(
        drain(&queue).await,
        vec![
            Request::namespaced("a", "created"),
            Request::namespaced("a", "deleted"),
            Request::namespaced("a", "generic"),
        ]
    );
}

#[tokio::test]
async fn object_handler_enqueues_only_the_new_object_on_update() {
    let queue = WorkQueue::with_default_rate_limiter("handler-object-update");
    let handler = EnqueueRequestForObject;

    handler.handle(
        &ChangeEvent::Updated {
            old: pod("a", "old-name"),
            new: pod("a", "new-name"),
        },
        &queue,
    );

    assert_eq!(drain(&queue).await, vec![Request::namespaced("a", "new-name")]);
}

#[tokio::test]
async fn repeated_events_collapse_to_one_request() {
    let queue = WorkQueue::with_default_rate_limiter("handler-object-dedup");
    let handler = EnqueueRequestForObject;

    for _ in 0..5 {
        handler.handle(&ChangeEvent::Generic(pod("a", "x")), &queue);
    }
    assert_eq!(queue.len(), 1);
}

// ============================================================================
// EnqueueRequestsFromMapFunc
// ============================================================================

#[tokio::test]
async fn mapped_handler_fans_out_create() {
    let queue = WorkQueue::with_default_rate_limiter("handler-mapped-create");
    let handler = EnqueueRequestsFromMapFunc::from_fn(pods_in_pool);

    handler.handle(&ChangeEvent::Created(node("n1", "blue")), &queue);

    assert_eq!(
        drain(&queue).await,
        vec![Request::namespaced("web", "blue-1"), Request::namespaced("web", "shared")]
    );
}

#[tokio::test]
async fn mapped_handler_enqueues_union_of_old_and_new_on_update() {
    let queue = WorkQueue::with_default_rate_limiter("handler-mapped-update");
    let handler = EnqueueRequestsFromMapFunc::new(map_fn(pods_in_pool));

    handler.handle(
        &ChangeEvent::Updated {
            old: node("n1", "blue"),
            new: node("n1", "green"),
        },
        &queue,
    );

    assert_eq!(queue.len(), 3, "shared pod must be queued once");
    let queued: HashSet<Request> = drain(&queue).await.into_iter().collect();
    let expected: HashSet<Request> = [
        Request::namespaced("web", "blue-1"),
        Request::namespaced("web", "green-1"),
        Request::namespaced("web", "shared"),
    ]
    .into_iter()
    .collect();
    assert_eq!(queued, expected);
}

#[tokio::test]
async fn mapped_handler_may_enqueue_nothing() {
    let queue = WorkQueue::with_default_rate_limiter("handler-mapped-empty");
    let handler = EnqueueRequestsFromMapFunc::from_fn(pods_in_pool);

    handler.handle(&ChangeEvent::Deleted(node("n1", "red")), &queue);
    handler.handle(&ChangeEvent::Generic(node("n2", "red")), &queue);

    assert!(queue.is_empty());
}

#[test]
fn panicking_mapper_propagates_and_leaves_queue_untouched() {
    let queue = WorkQueue::with_default_rate_limiter("handler-mapped-panic");
    let handler = EnqueueRequestsFromMapFunc::from_fn(|_: &Node| -> Vec<Request> {
        panic!("mapper bug")
    });

    let result = catch_unwind(AssertUnwindSafe(|| {
        handler.handle(&ChangeEvent::Created(node("n1", "blue")), &queue);
    }));

    assert!(result.is_err());
    assert!(queue.is_empty());
}

#[test]
fn mapper_panic_on_new_object_enqueues_nothing_for_update() {
    let queue = WorkQueue::with_default_rate_limiter("handler-mapped-update-panic");
    let handler = EnqueueRequestsFromMapFunc::from_fn(|node: &Node| -> Vec<Request> {
        if node.metadata.name.as_deref() == Some("broken") {
            panic!("mapper bug");
        }
        pods_in_pool(node)
    });

    let result = catch_unwind(AssertUnwindSafe(|| {
        handler.handle(
            &ChangeEvent::Updated {
                old: node("n1", "blue"),
                new: node("broken", "green"),
            },
            &queue,
        );
    }));

    assert!(result.is_err());
    assert_eq!(queue.len(), 0, "requests of the old object must not leak in");
}

// ============================================================================
// EnqueueRequestForOwner
// ============================================================================

#[tokio::test]
async fn owner_handler_enqueues_matching_owners() {
    let queue = WorkQueue::with_default_rate_limiter("handler-owner");
    let handler = EnqueueRequestForOwner::new::<ReplicaSet>();

    let pod = owned_pod(
        "web-abc",
        vec![
            owner_ref("apps/v1", "ReplicaSet", "web", true),
            owner_ref("v1", "ConfigMap", "settings", false),
            owner_ref("example.com/v1", "ReplicaSet", "impostor", false),
        ],
    );
    handler.handle(&ChangeEvent::Created(pod), &queue);

    assert_eq!(drain(&queue).await, vec![Request::namespaced("shop", "web")]);
}

#[tokio::test]
async fn owner_handler_controller_only() {
    let queue = WorkQueue::with_default_rate_limiter("handler-owner-controller");
    let handler = EnqueueRequestForOwner::new::<ReplicaSet>().controller_only();

    let pod = owned_pod(
        "web-abc",
        vec![
            owner_ref("apps/v1", "ReplicaSet", "adopter", false),
            owner_ref("apps/v1", "ReplicaSet", "web", true),
        ],
    );
    handler.handle(&ChangeEvent::Generic(pod), &queue);

    assert_eq!(drain(&queue).await, vec![Request::namespaced("shop", "web")]);
}

#[tokio::test]
async fn owner_handler_notifies_previous_owner_on_update() {
    let queue = WorkQueue::with_default_rate_limiter("handler-owner-update");
    let handler = EnqueueRequestForOwner::new::<ReplicaSet>();

    handler.handle(
        &ChangeEvent::Updated {
            old: owned_pod("web-abc", vec![owner_ref("apps/v1", "ReplicaSet", "old-rs", true)]),
            new: owned_pod("web-abc", vec![owner_ref("apps/v1", "ReplicaSet", "new-rs", true)]),
        },
        &queue,
    );

    assert_eq!(
        drain(&queue).await,
        vec![Request::namespaced("shop", "old-rs"), Request::namespaced("shop", "new-rs")]
    );
}
