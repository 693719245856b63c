//! Integration tests for the work queue
//!
//! These tests exercise the queue the way controller workers use it:
//! concurrent getters, adds racing with processing, backoff and shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reconcile_engine::workqueue::{ExponentialBackoff, WorkQueue};
use reconcile_engine::Request;
use tokio::task::JoinSet;
use tokio::time::Instant;

// ============================================================================
// Test Helpers
// ============================================================================

fn request(name: &str) -> Request {
    Request::namespaced("a", name)
}

fn backoff_queue(name: &str, base_ms: u64, max_ms: u64) -> WorkQueue<Request> {
    WorkQueue::new(
        name,
        ExponentialBackoff::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        ),
    )
}

async fn wait_until_idle(queue: &WorkQueue<Request>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(queue.is_empty() && queue.in_flight() == 0 && queue.delayed() == 0) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue did not drain");
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn add_twice_before_get_queues_once() {
    let queue = backoff_queue("it-dedup", 5, 1000);
    queue.add(request("x"));
    queue.add(request("x"));
    assert_eq!(queue.len(), 1);

    assert_eq!(queue.get().await, Some(request("x")));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn keys_are_handed_out_in_fifo_order() {
    let queue = backoff_queue("it-fifo", 5, 1000);
    for name in ["x", "y", "z"] {
        queue.add(request(name));
    }
    queue.add(request("x"));

    assert_eq!(queue.get().await, Some(request("x")));
    assert_eq!(queue.get().await, Some(request("y")));
    assert_eq!(queue.get().await, Some(request("z")));
}

// ============================================================================
// In-flight tracking
// ============================================================================

#[tokio::test]
async fn add_while_in_flight_is_requeued_on_done() {
    let queue = backoff_queue("it-dirty", 5, 1000);
    queue.add(request("x"));
    let item = queue.get().await.unwrap();

    queue.add(request("x"));
    assert_eq!(queue.len(), 0, "in-flight key must not be queued twice");

    queue.done(&item);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some(request("x")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_request_is_processed_by_two_workers_at_once() {
    let queue = Arc::new(backoff_queue("it-exclusive", 1, 10));
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let in_flight = in_flight.clone();
        let violations = violations.clone();
        let processed = processed.clone();
        workers.spawn(async move {
            while let Some(req) = queue.get().await {
                if !in_flight.lock().unwrap().insert(req.clone()) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight.lock().unwrap().remove(&req);
                processed.fetch_add(1, Ordering::SeqCst);
                queue.done(&req);
            }
        });
    }

    for round in 0..50 {
        for name in ["x", "y", "z"] {
            queue.add(request(name));
        }
        if round % 10 == 0 {
            queue.add_rate_limited(request("x"));
        }
        tokio::time::sleep(Duration::from_micros(300)).await;
    }

    wait_until_idle(&queue).await;
    queue.shut_down();
    while let Some(joined) = workers.join_next().await {
        joined.unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(processed.load(Ordering::SeqCst) >= 3);
}

// ============================================================================
// Backoff
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rate_limited_delay_grows_caps_and_resets_after_forget() {
    let queue = backoff_queue("it-backoff", 10, 80);
    let key = request("x");

    let mut delays = Vec::new();
    for _ in 0..6 {
        let start = Instant::now();
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.get().await, Some(key.clone()));
        delays.push(start.elapsed());
        queue.done(&key);
    }

    let expected_ms = [10, 20, 40, 80, 80, 80];
    for (delay, expected) in delays.iter().zip(expected_ms) {
        let expected = Duration::from_millis(expected);
        assert!(*delay >= expected, "delay {:?} shorter than {:?}", delay, expected);
        assert!(*delay < expected + Duration::from_millis(5));
    }
    assert!(delays.windows(2).all(|w| w[1] + Duration::from_millis(2) >= w[0]));

    queue.forget(&key);
    let start = Instant::now();
    queue.add_rate_limited(key.clone());
    assert_eq!(queue.get().await, Some(key.clone()));
    let reset = start.elapsed();
    assert!(reset >= Duration::from_millis(10));
    assert!(reset < Duration::from_millis(15));
}

#[tokio::test(start_paused = true)]
async fn delayed_add_does_not_block_ready_keys() {
    let queue = backoff_queue("it-delay-mixed", 5, 1000);
    queue.add_after(request("later"), Duration::from_secs(10));
    queue.add(request("now"));

    let start = Instant::now();
    assert_eq!(queue.get().await, Some(request("now")));
    assert!(start.elapsed() < Duration::from_millis(1));

    assert_eq!(queue.get().await, Some(request("later")));
    assert!(start.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn earlier_delayed_add_wakes_sleeping_getter() {
    let queue = Arc::new(backoff_queue("it-delay-rearm", 5, 1000));
    queue.add_after(request("x"), Duration::from_secs(60));

    let getter = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let item = queue.get().await;
            (item, start.elapsed())
        })
    };
    tokio::task::yield_now().await;
    queue.add_after(request("x"), Duration::from_secs(1));

    let (item, elapsed) = getter.await.unwrap();
    assert_eq!(item, Some(request("x")));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn unbounded_delay_is_held_without_blocking_other_keys() {
    let queue = backoff_queue("it-delay-max", 5, 1000);
    queue.add_after(request("never"), Duration::MAX);
    queue.add(request("now"));

    assert_eq!(queue.get().await, Some(request("now")));
    assert_eq!(queue.delayed(), 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn uncapped_backoff_saturates_instead_of_overflowing() {
    let queue = WorkQueue::new(
        "it-backoff-uncapped",
        ExponentialBackoff::new(Duration::from_secs(3600), Duration::MAX),
    );
    for _ in 0..200 {
        queue.add_rate_limited(request("x"));
    }

    assert_eq!(queue.num_requeues(&request("x")), 200);
    assert_eq!(queue.delayed(), 1);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_releases_every_blocked_getter() {
    let queue = Arc::new(backoff_queue("it-shutdown", 5, 1000));
    let mut getters = JoinSet::new();
    for _ in 0..3 {
        let queue = queue.clone();
        getters.spawn(async move { queue.get().await });
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.waiting_getters() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("getters never blocked");

    queue.shut_down();
    while let Some(joined) = getters.join_next().await {
        assert_eq!(joined.unwrap(), None);
    }
    assert_eq!(queue.waiting_getters(), 0);
}

#[tokio::test]
async fn in_flight_work_can_finish_after_shutdown() {
    let queue = backoff_queue("it-shutdown-in-flight", 5, 1000);
    queue.add(request("x"));
    queue.add(request("y"));
    let item = queue.get().await.unwrap();

    queue.shut_down();
    queue.add(request("x"));
    queue.done(&item);

    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.get().await, None, "queued work is not handed out after shutdown");
}
