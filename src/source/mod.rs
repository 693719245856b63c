//! Event sources
//!
//! A source is the boundary to whatever observes changes: a Kubernetes watch,
//! an in-process channel, a timer. Once started it yields [`ChangeEvent`]s
//! which the controller filters through predicates and hands to a handler.

mod channel;
mod kube_watch;

pub use channel::ChannelSource;
pub use kube_watch::KubeWatch;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::event::ChangeEvent;
use crate::inject::Dependencies;

/// Stream of change events produced by a started source
pub type EventStream<K> = BoxStream<'static, ChangeEvent<K>>;

/// Produces change events for objects of type `K`
pub trait Source<K>: Send {
    /// Establish the watch; an error aborts the registration
    fn start(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<EventStream<K>>>;

    /// Receive dependencies once, when registered with a controller
    fn inject(&mut self, _deps: &Dependencies) -> anyhow::Result<()> {
        Ok(())
    }
}
