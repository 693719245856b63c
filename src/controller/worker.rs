//! Worker loop
//!
//! Each worker repeatedly takes a request from the queue, runs the reconciler
//! on it, and turns the outcome into a queue operation:
//!
//! | outcome                  | queue                          |
//! |--------------------------|--------------------------------|
//! | `Ok(done)`               | forget                         |
//! | `Ok(requeue)`            | add rate limited               |
//! | `Ok(requeue_after(d))`   | forget, add after `d`          |
//! | `Err(_)`, panic, timeout | add rate limited               |
//!
//! followed by `done` in every case.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use prometheus::Gauge;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::metrics;
use crate::reconciler::{ReconcileContext, ReconcileResult, Reconciler, Request};
use crate::workqueue::{instant_after, WorkQueue};

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) controller: Arc<str>,
    pub(crate) queue: Arc<WorkQueue<Request>>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) scope: CancellationToken,
    pub(crate) timeout: Option<Duration>,
    pub(crate) running: Arc<AtomicUsize>,
}

/// Counts a live worker until dropped, including when its task panics or is aborted
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tracks a reconcile in the active-workers gauge
struct ActiveGuard(Gauge);

impl ActiveGuard {
    fn enter(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl Worker {
    /// Process requests until the queue shuts down
    pub(crate) async fn run(self) {
        let _running = RunningGuard::enter(self.running.clone());
        debug!(controller = %self.controller, worker = self.id, "Worker started");

        while let Some(request) = self.queue.get().await {
            self.process(request).await;
        }

        debug!(controller = %self.controller, worker = self.id, "Worker stopped");
    }

    async fn process(&self, request: Request) {
        let attempt = self.queue.num_requeues(&request);
        let token = self.scope.child_token();
        let deadline = self.timeout.map(instant_after);

        let mut ctx = ReconcileContext::new(self.controller.clone(), token.clone()).with_attempt(attempt);
        if let Some(deadline) = deadline {
            ctx = ctx.with_deadline(deadline);
        }

        let span = info_span!(
            "reconcile",
            controller = %self.controller,
            request = %request,
            worker = self.id,
            attempt
        );

        let outcome = {
            let _active = ActiveGuard::enter(
                metrics::ACTIVE_WORKERS.with_label_values(&[&*self.controller]),
            );
            let _timer = metrics::RECONCILE_DURATION
                .with_label_values(&[&*self.controller])
                .start_timer();
            self.invoke(ctx, request.clone(), deadline, &token)
                .instrument(span.clone())
                .await
        };

        span.in_scope(|| self.dispose(&request, outcome));
        self.queue.done(&request);
    }

    /// Run the reconciler, turning a panic or a timeout into an error
    async fn invoke(
        &self,
        ctx: ReconcileContext,
        request: Request,
        deadline: Option<Instant>,
        token: &CancellationToken,
    ) -> anyhow::Result<ReconcileResult> {
        let call = AssertUnwindSafe(self.reconciler.reconcile(ctx, request)).catch_unwind();

        let caught = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                Ok(caught) => caught,
                Err(_) => {
                    token.cancel();
                    return Err(anyhow::anyhow!(
                        "reconcile did not finish within {:?}",
                        self.timeout.unwrap_or_default()
                    ));
                }
            },
            None => call.await,
        };

        caught.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "reconciler panicked: {}",
                panic_message(panic.as_ref())
            ))
        })
    }

    fn dispose(&self, request: &Request, outcome: anyhow::Result<ReconcileResult>) {
        let result_label = match outcome {
            Err(e) => {
                error!(error = %format!("{:#}", e), "Reconciler error, requeueing with backoff");
                metrics::RECONCILE_ERRORS
                    .with_label_values(&[&*self.controller])
                    .inc();
                self.queue.add_rate_limited(request.clone());
                "error"
            }
            Ok(result) => match result.requeue_after.filter(|delay| !delay.is_zero()) {
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "Requeue after delay");
                    self.queue.forget(request);
                    self.queue.add_after(request.clone(), delay);
                    "requeue_after"
                }
                None if result.requeue => {
                    debug!("Requeue with backoff");
                    self.queue.add_rate_limited(request.clone());
                    "requeue"
                }
                None => {
                    debug!("Reconciled");
                    self.queue.forget(request);
                    "success"
                }
            },
        };

        metrics::RECONCILE_TOTAL
            .with_label_values(&[&*self.controller, result_label])
            .inc();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
