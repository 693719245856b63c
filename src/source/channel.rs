use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::{EventStream, Source};
use crate::event::ChangeEvent;

/// Events pushed in-process through a channel
///
/// Useful for signals that do not come from the API server, e.g. an external
/// system asking for a re-check, which are sent as `ChangeEvent::Generic`.
/// The stream ends when every sender is dropped.
pub struct ChannelSource<K> {
    rx: mpsc::Receiver<ChangeEvent<K>>,
}

impl<K> ChannelSource<K>
where
    K: Send + 'static,
{
    pub fn new(rx: mpsc::Receiver<ChangeEvent<K>>) -> Self {
        Self { rx }
    }

    /// Create a bounded channel and the source reading from it
    pub fn channel(buffer: usize) -> (mpsc::Sender<ChangeEvent<K>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

impl<K> Source<K> for ChannelSource<K>
where
    K: Send + 'static,
{
    fn start(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<EventStream<K>>> {
        let events = stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();
        future::ready(Ok(events)).boxed()
    }
}
