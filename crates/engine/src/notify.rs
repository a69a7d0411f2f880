//! Fan-out of committed changes to local subscribers.
//!
//! Each subscriber owns a dedicated delivery task fed by an unbounded
//! channel: publishing never blocks, delivery per subscriber is sequential
//! and in-order, and one slow or failing subscriber never affects another.

use std::collections::{hash_map, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use liveboard_primitives::error::SubscriberError;
use liveboard_primitives::event::{Change, Record, SequenceNo};
use liveboard_primitives::subscription::SubscriptionId;
use liveboard_primitives::topic::Topic;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Predicate narrowing a subscription to a subset of a topic's records.
pub type Filter<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// Consumer callback invoked once per committed change, in commit order.
pub type Callback<R> = Box<dyn FnMut(Change<R>) -> Result<(), SubscriberError> + Send>;

/// Proof of registration; pass back to [`Notifier::unregister`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: Topic,
}

impl SubscriptionHandle {
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

struct Subscriber<R> {
    topic: Topic,
    filter: Filter<R>,
    changes: mpsc::UnboundedSender<Change<R>>,
    high_water_mark: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

/// Routes committed changes to registered subscribers.
pub struct Notifier<R> {
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber<R>>>,
}

impl<R: Record> Notifier<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `topic`, narrowed by `filter`.
    ///
    /// Spawns the subscriber's delivery task; must be called within a
    /// tokio runtime.
    pub fn register(
        &self,
        topic: Topic,
        filter: Filter<R>,
        callback: Callback<R>,
    ) -> SubscriptionHandle {
        let (changes, queue) = mpsc::unbounded_channel();
        let high_water_mark = Arc::new(AtomicU64::new(0));

        let mut subscribers = self.subscribers.lock();

        let id = loop {
            let id = SubscriptionId::new(rand::random());

            if let hash_map::Entry::Vacant(_) = subscribers.entry(id) {
                break id;
            }
        };

        let worker = tokio::spawn(deliver_loop(id, queue, callback, high_water_mark.clone()));

        let _ignored = subscribers.insert(
            id,
            Subscriber {
                topic: topic.clone(),
                filter,
                changes,
                high_water_mark,
                worker,
            },
        );

        debug!(subscription_id = %id, %topic, "subscriber registered");

        SubscriptionHandle { id, topic }
    }

    pub fn unregister(&self, handle: SubscriptionHandle) {
        if let Some(subscriber) = self.subscribers.lock().remove(&handle.id) {
            subscriber.worker.abort();
            debug!(subscription_id = %handle.id, topic = %handle.topic, "subscriber unregistered");
        }
    }

    /// Enqueue `change` for every matching subscriber of `topic`.
    ///
    /// Never blocks; a delete carries no payload, so the record filter
    /// cannot run and the change goes to every subscriber of the topic.
    pub fn publish(&self, topic: &Topic, change: &Change<R>) {
        let subscribers = self.subscribers.lock();

        for subscriber in subscribers.values() {
            if subscriber.topic != *topic {
                continue;
            }

            if let Some(record) = &change.record {
                if !(subscriber.filter)(record) {
                    continue;
                }
            }

            if subscriber.changes.send(change.clone()).is_err() {
                // Delivery task already gone; unregister will reap it.
                debug!(%topic, "change dropped for a closed subscriber");
            }
        }
    }

    /// Sequence number up to which a subscriber has confirmed delivery.
    #[must_use]
    pub fn high_water_mark(&self, id: SubscriptionId) -> Option<SequenceNo> {
        self.subscribers
            .lock()
            .get(&id)
            .map(|subscriber| SequenceNo::new(subscriber.high_water_mark.load(Ordering::Acquire)))
    }

    /// Drop every subscriber of `topic` (topic closed).
    pub fn drop_topic(&self, topic: &Topic) {
        self.subscribers.lock().retain(|id, subscriber| {
            if subscriber.topic != *topic {
                return true;
            }

            subscriber.worker.abort();
            debug!(subscription_id = %id, %topic, "subscriber dropped with its topic");

            false
        });
    }

    pub fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock();

        for subscriber in subscribers.values() {
            subscriber.worker.abort();
        }

        subscribers.clear();
    }
}

impl<R: Record> Default for Notifier<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> core::fmt::Debug for Notifier<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

/// Sequential delivery loop for one subscriber.
///
/// At-most-once per change: redelivered sequence numbers at or below the
/// high-water mark are skipped. A callback error or panic is logged, the
/// high-water mark still advances, and the next change is delivered
/// (drop-and-continue).
async fn deliver_loop<R: Record>(
    id: SubscriptionId,
    mut queue: mpsc::UnboundedReceiver<Change<R>>,
    mut callback: Callback<R>,
    high_water_mark: Arc<AtomicU64>,
) {
    while let Some(change) = queue.recv().await {
        let sequence_no = change.sequence_no;

        if let Some(sequence_no) = sequence_no {
            if sequence_no.get() <= high_water_mark.load(Ordering::Acquire) {
                debug!(
                    subscription_id = %id,
                    %sequence_no,
                    "already-delivered change skipped"
                );

                continue;
            }
        }

        match catch_unwind(AssertUnwindSafe(|| callback(change))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(subscription_id = %id, %err, "subscriber callback failed; continuing");
            }
            Err(_panic) => {
                error!(subscription_id = %id, "subscriber callback panicked; continuing");
            }
        }

        if let Some(sequence_no) = sequence_no {
            high_water_mark.store(sequence_no.get(), Ordering::Release);
        }
    }
}
