//! Engine facade: one explicitly-constructed instance per session.

use std::collections::HashMap;
use std::sync::Arc;

use liveboard_primitives::event::{Change, CorrelationId, Record};
use liveboard_primitives::subscription::ConnectionState;
use liveboard_primitives::topic::Topic;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::buffer::ViewBuffer;
use crate::config::EngineConfig;
use crate::notify::{Callback, Filter, Notifier, SubscriptionHandle};
use crate::resync::TopicWorker;
use crate::source::EventSource;

struct TopicHandle<R> {
    buffer: Arc<Mutex<ViewBuffer<R>>>,
    state: watch::Receiver<ConnectionState>,
    worker: JoinHandle<()>,
}

/// The real-time merge engine for one backend session.
///
/// Construct one per process/session with the backend collaborator
/// injected; whoever composes the application owns its lifecycle. There is
/// no ambient global state — dropping the engine stops every topic worker.
pub struct SyncEngine<R, S> {
    config: EngineConfig,
    source: Arc<S>,
    notifier: Arc<Notifier<R>>,
    topics: Mutex<HashMap<Topic, TopicHandle<R>>>,
}

impl<R: Record, S: EventSource<R>> SyncEngine<R, S> {
    #[must_use]
    pub fn new(source: S, config: EngineConfig) -> Self {
        Self {
            config,
            source: Arc::new(source),
            notifier: Arc::new(Notifier::new()),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a supervisor is running for `topic`. Idempotent; must be
    /// called within a tokio runtime.
    pub fn open_topic(&self, topic: &Topic) {
        let mut topics = self.topics.lock();

        if topics.contains_key(topic) {
            return;
        }

        let buffer = Arc::new(Mutex::new(ViewBuffer::new(
            topic.clone(),
            self.config.deferred_window,
        )));
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let worker = TopicWorker::new(
            topic.clone(),
            self.config,
            Arc::clone(&self.source),
            Arc::clone(&buffer),
            Arc::clone(&self.notifier),
            state_tx,
        );

        let task = tokio::spawn(worker.run());

        info!(%topic, "topic opened");

        let _ignored = topics.insert(
            topic.clone(),
            TopicHandle {
                buffer,
                state: state_rx,
                worker: task,
            },
        );
    }

    /// Register a subscriber; opens the topic lazily.
    pub fn register(
        &self,
        topic: Topic,
        filter: Filter<R>,
        callback: Callback<R>,
    ) -> SubscriptionHandle {
        self.open_topic(&topic);

        self.notifier.register(topic, filter, callback)
    }

    pub fn unregister(&self, handle: SubscriptionHandle) {
        self.notifier.unregister(handle);
    }

    /// Ordered snapshot for initial render.
    ///
    /// Keeps serving the last-known-good view while the topic is degraded;
    /// empty for topics that were never opened.
    #[must_use]
    pub fn current_view(&self, topic: &Topic) -> Vec<R> {
        self.topics
            .lock()
            .get(topic)
            .map(|handle| handle.buffer.lock().snapshot())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn connection_state(&self, topic: &Topic) -> ConnectionState {
        self.topics
            .lock()
            .get(topic)
            .map(|handle| *handle.state.borrow())
            .unwrap_or_default()
    }

    /// Observe connection-state transitions, e.g. to drive a stale-data
    /// indicator.
    #[must_use]
    pub fn watch_connection(&self, topic: &Topic) -> Option<watch::Receiver<ConnectionState>> {
        self.topics
            .lock()
            .get(topic)
            .map(|handle| handle.state.clone())
    }

    /// Optimistically add a locally-constructed record ahead of the
    /// backend's confirmation, correlated by `correlation_id`.
    pub fn submit_local(&self, topic: &Topic, record: R, correlation_id: CorrelationId) {
        let Some(buffer) = self
            .topics
            .lock()
            .get(topic)
            .map(|handle| Arc::clone(&handle.buffer))
        else {
            debug!(%topic, "local record for an unopened topic ignored");
            return;
        };

        let mut committed: Vec<Change<R>> = Vec::new();

        {
            let mut buffer = buffer.lock();
            let _record_id = buffer.apply_local(record, correlation_id, &mut committed);
        }

        for change in &committed {
            self.notifier.publish(topic, change);
        }
    }

    /// Stop supervision of `topic`: aborts its worker (and any in-flight
    /// catch-up fetch), drops its view state and its subscribers.
    pub fn close_topic(&self, topic: &Topic) {
        let Some(handle) = self.topics.lock().remove(topic) else {
            return;
        };

        handle.worker.abort();
        self.notifier.drop_topic(topic);

        info!(%topic, "topic closed");
    }

    pub fn shutdown(&self) {
        let mut topics = self.topics.lock();

        for (topic, handle) in topics.drain() {
            handle.worker.abort();
            debug!(%topic, "topic closed");
        }

        drop(topics);

        self.notifier.shutdown();
    }
}

impl<R, S> Drop for SyncEngine<R, S> {
    fn drop(&mut self) {
        for handle in self.topics.lock().values() {
            handle.worker.abort();
        }
    }
}

impl<R, S> core::fmt::Debug for SyncEngine<R, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("topics", &self.topics.lock().len())
            .finish_non_exhaustive()
    }
}
