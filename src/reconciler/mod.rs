//! Reconciler contract
//!
//! A reconciler is the user-supplied logic that drives one object toward its
//! desired state. The engine only decides *when* it runs; the result tells the
//! engine whether and when to run it again.

mod request;

pub use request::Request;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::inject::Dependencies;

/// Outcome of a successful reconcile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue with rate-limited backoff
    pub requeue: bool,
    /// Requeue after a fixed delay; takes precedence over `requeue` when non-zero
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// The object converged; forget its backoff and wait for the next event
    pub fn done() -> Self {
        Self::default()
    }

    /// Try again with backoff
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Re-check after `delay`, without counting it as a failure
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// Per-reconcile context handed to the reconciler
#[derive(Clone, Debug)]
pub struct ReconcileContext {
    controller: Arc<str>,
    cancellation: CancellationToken,
    attempt: u32,
    deadline: Option<Instant>,
}

impl ReconcileContext {
    /// Create a context bound to `cancellation`
    pub fn new(controller: impl Into<Arc<str>>, cancellation: CancellationToken) -> Self {
        Self {
            controller: controller.into(),
            cancellation,
            attempt: 0,
            deadline: None,
        }
    }

    /// Set the number of rate-limited requeues seen before this run
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the instant after which the engine abandons this run
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Name of the controller running this reconcile
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Rate-limited requeues of this request since it last succeeded
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the controller is stopping or this run timed out
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the controller is stopping or this run timed out
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// User reconciliation logic
///
/// Called concurrently for different requests, never concurrently for the
/// same request. Must be idempotent: the engine may deliver a request again
/// even when nothing changed.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconcile the object identified by `request`
    async fn reconcile(
        &self,
        ctx: ReconcileContext,
        request: Request,
    ) -> anyhow::Result<ReconcileResult>;

    /// Receive dependencies once, before the first reconcile
    fn inject(&mut self, _deps: &Dependencies) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reconciler backed by an async closure, see [`from_fn`]
pub struct ReconcilerFn<F> {
    f: F,
}

/// Build a reconciler from an async closure
pub fn from_fn<F, Fut>(f: F) -> ReconcilerFn<F>
where
    F: Fn(ReconcileContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ReconcileResult>> + Send + 'static,
{
    ReconcilerFn { f }
}

#[async_trait]
impl<F, Fut> Reconciler for ReconcilerFn<F>
where
    F: Fn(ReconcileContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ReconcileResult>> + Send + 'static,
{
    async fn reconcile(
        &self,
        ctx: ReconcileContext,
        request: Request,
    ) -> anyhow::Result<ReconcileResult> {
        (self.f)(ctx, request).await
    }
}
