//! Watch registrations
//!
//! A registration binds a source, a handler and its predicates for one object
//! type. Controllers hold registrations of many object types, so the type is
//! erased behind [`Watch`].

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::handler::EventHandler;
use crate::predicate::{all_accept, Predicate};
use crate::reconciler::Request;
use crate::source::Source;
use crate::workqueue::WorkQueue;

/// A type-erased watch registration
pub(crate) trait Watch: Send {
    /// Start the source; on success returns the task feeding its events to the queue
    fn start(
        self: Box<Self>,
        queue: Arc<WorkQueue<Request>>,
        scope: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<BoxFuture<'static, ()>>>;
}

pub(crate) struct WatchRegistration<K> {
    controller: Arc<str>,
    source: Box<dyn Source<K>>,
    handler: Box<dyn EventHandler<K>>,
    predicates: Vec<Box<dyn Predicate<K>>>,
}

impl<K> WatchRegistration<K> {
    pub(crate) fn new(
        controller: Arc<str>,
        source: Box<dyn Source<K>>,
        handler: Box<dyn EventHandler<K>>,
        predicates: Vec<Box<dyn Predicate<K>>>,
    ) -> Self {
        Self {
            controller,
            source,
            handler,
            predicates,
        }
    }
}

impl<K> Watch for WatchRegistration<K>
where
    K: Send + 'static,
{
    fn start(
        self: Box<Self>,
        queue: Arc<WorkQueue<Request>>,
        scope: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<BoxFuture<'static, ()>>> {
        let WatchRegistration {
            controller,
            source,
            handler,
            predicates,
        } = *self;

        async move {
            let mut events = source.start().await?;
            let dispatch = async move {
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        event = events.next() => {
                            let Some(event) = event else {
                                break;
                            };
                            if all_accept(&predicates, &event) {
                                handler.handle(&event, &queue);
                            } else {
                                trace!(controller = %controller, event = event.kind(), "Event filtered by predicate");
                            }
                        }
                    }
                }
                trace!(controller = %controller, "Event dispatch stopped");
            };
            Ok(dispatch.boxed())
        }
        .boxed()
    }
}
