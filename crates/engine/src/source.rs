use core::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use liveboard_primitives::error::{CatchUpError, TransportError};
use liveboard_primitives::event::{Event, SequenceNo};
use liveboard_primitives::topic::Topic;

/// Push stream of events for one topic.
///
/// An `Err` item is the transport's distinguishable disconnect signal; the
/// stream ending means the subscription was closed. Dropping the stream
/// cancels the upstream subscription within one scheduling tick.
pub type EventStream<R> = Pin<Box<dyn Stream<Item = Result<Event<R>, TransportError>> + Send>>;

/// Backend collaborator producing per-topic event streams.
///
/// Implementations wrap the hosted backend's realtime channel plus its
/// history endpoint. No filtering happens here — everything the backend
/// delivers for the topic is passed through, in whatever order it arrives;
/// ordering and de-duplication are the buffer's job.
#[async_trait]
pub trait EventSource<R>: Send + Sync + 'static {
    /// Open a live subscription to `topic`.
    async fn subscribe(&self, topic: &Topic) -> Result<EventStream<R>, TransportError>;

    /// Fetch every event with `sequence_no > since`, ordered by sequence.
    ///
    /// Used to reconcile the gap after a reconnect; `since = 0` doubles as
    /// the initial load.
    async fn fetch_since(
        &self,
        topic: &Topic,
        since: SequenceNo,
    ) -> Result<Vec<Event<R>>, CatchUpError>;
}
