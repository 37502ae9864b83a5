//! Uniform view over the ways a streaming method can produce items.
//!
//! Whatever the source, the dispatcher sees a stream of [`StreamEvent`]s
//! that always ends with exactly one `Completed` or `Failed`. Cancellation
//! counts as a clean completion.

use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use hubwire_core::errors::{HubError, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fallible item stream.
pub type ItemStream = BoxStream<'static, Result<Value>>;

/// Producer that pushes items into a [`StreamSink`] until done or cancelled.
pub type PushProducer =
    Box<dyn FnOnce(StreamSink, CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// What a streaming method returns.
pub enum StreamSource {
    /// An async sequence of items.
    Stream(ItemStream),
    /// A channel another task writes into.
    Channel(mpsc::Receiver<Result<Value>>),
    /// A synchronous, already-materialized sequence.
    Iter(Box<dyn Iterator<Item = Value> + Send>),
    /// A producer driven on its own task through a bounded sink.
    Push(PushProducer),
}

impl StreamSource {
    /// Wrap any fallible stream.
    pub fn from_stream<S>(items: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::Stream(items.boxed())
    }

    /// Wrap a synchronous sequence.
    pub fn from_values<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::Iter(Box::new(items.into_iter()))
    }

    /// A bounded channel whose sender side is handed back as a sink.
    pub fn channel(capacity: usize) -> (StreamSink, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (StreamSink { tx }, Self::Channel(rx))
    }

    /// Drive `producer` on its own task.
    pub fn push<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(StreamSink, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Push(Box::new(move |sink, token| producer(sink, token).boxed()))
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Stream(_) => "Stream",
            Self::Channel(_) => "Channel",
            Self::Iter(_) => "Iter",
            Self::Push(_) => "Push",
        };
        f.debug_tuple("StreamSource").field(&kind).finish()
    }
}

/// Writing half of a channel or push source.
#[derive(Clone, Debug)]
pub struct StreamSink {
    tx: mpsc::Sender<Result<Value>>,
}

impl StreamSink {
    /// Send one item, waiting for buffer space. Fails with
    /// [`HubError::Canceled`] once the consumer has gone away.
    pub async fn send(&self, item: Value) -> Result<()> {
        self.tx.send(Ok(item)).await.map_err(|_| HubError::Canceled)
    }

    /// Serialize and send one item.
    pub async fn send_serialized<T: Serialize + ?Sized>(&self, item: &T) -> Result<()> {
        let value = serde_json::to_value(item).map_err(HubError::internal)?;
        self.send(value).await
    }

    /// End the stream with an error.
    pub async fn fail(&self, error: HubError) -> Result<()> {
        self.tx.send(Err(error)).await.map_err(|_| HubError::Canceled)
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One step of an adapted stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An item to forward.
    Item(Value),
    /// The source ended or was cancelled.
    Completed,
    /// The source failed.
    Failed(HubError),
}

impl StreamEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Item(_))
    }
}

fn receiver_stream(rx: mpsc::Receiver<Result<Value>>) -> ItemStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn into_items(source: StreamSource, cancel: &CancellationToken, capacity: usize) -> ItemStream {
    match source {
        StreamSource::Stream(items) => items,
        StreamSource::Channel(rx) => receiver_stream(rx),
        StreamSource::Iter(items) => stream::iter(items.map(Ok)).boxed(),
        StreamSource::Push(producer) => {
            let (sink, rx) = {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (StreamSink { tx }, rx)
            };
            let failure = sink.clone();
            let run = producer(sink, cancel.clone());
            drop(tokio::spawn(async move {
                if let Err(err) = run.await {
                    if failure.fail(err).await.is_err() {
                        debug!("stream producer failed after the consumer left");
                    }
                }
            }));
            receiver_stream(rx)
        }
    }
}

/// Adapt `source` into events, stopping at the first of: end of items,
/// an error, or `cancel` firing.
///
/// Once the returned stream ends or is dropped, the source is dropped with
/// it, so producers stop at their next send.
pub fn adapt(
    source: StreamSource,
    cancel: CancellationToken,
    capacity: usize,
) -> BoxStream<'static, StreamEvent> {
    let mut items = into_items(source, &cancel, capacity);
    async_stream::stream! {
        loop {
            // Iterator sources are always ready; yield now and then so
            // other tasks (including whoever cancels) get to run.
            tokio::task::consume_budget().await;
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => StreamEvent::Completed,
                next = items.next() => match next {
                    Some(Ok(item)) => StreamEvent::Item(item),
                    Some(Err(HubError::Canceled)) | None => StreamEvent::Completed,
                    Some(Err(err)) => StreamEvent::Failed(err),
                },
            };
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                break;
            }
        }
    }
    .boxed()
}
