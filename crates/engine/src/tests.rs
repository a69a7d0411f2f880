//! End-to-end scenarios against a scripted in-memory backend: live
//! delivery, deferred resolution, redelivery, disconnect/resync and
//! optimistic local records.

use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use liveboard_primitives::error::{CatchUpError, TransportError};
use liveboard_primitives::event::{Event, EventOp, SequenceNo};
use liveboard_primitives::topic::Topic;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::{BackoffConfig, EngineConfig};
use crate::engine::SyncEngine;
use crate::notify::Callback;
use crate::source::{EventSource, EventStream};
use crate::test_utils::{insert, note, topic, update, Note};

#[derive(Default)]
struct BackendInner {
    /// The authoritative append-only log, served by `fetch_since`.
    log: Vec<Event<Note>>,
    /// The current live connection, if any.
    live: Option<mpsc::UnboundedSender<Result<Event<Note>, TransportError>>>,
    fail_fetches: usize,
    subscribes: usize,
    fetches: Vec<SequenceNo>,
}

/// Scripted stand-in for the hosted backend: an event log plus one live
/// push channel per subscribe, with injectable failures.
#[derive(Clone, Default)]
struct TestBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl TestBackend {
    fn new() -> Self {
        Self::default()
    }

    /// Append to the log and push to the live connection, like a backend
    /// commit observed by both the pull and the push path.
    fn commit(&self, event: Event<Note>) {
        let mut inner = self.inner.lock();

        inner.log.push(event.clone());

        if let Some(live) = &inner.live {
            let _ignored = live.send(Ok(event));
        }
    }

    /// Push on the live channel without logging: a transport redelivery.
    fn redeliver(&self, event: Event<Note>) {
        if let Some(live) = &self.inner.lock().live {
            let _ignored = live.send(Ok(event));
        }
    }

    /// Sever the live connection with a transport error.
    fn drop_connection(&self) {
        if let Some(live) = self.inner.lock().live.take() {
            let _ignored = live.send(Err(TransportError::ConnectionLost(
                "scripted drop".to_owned(),
            )));
        }
    }

    fn fail_next_fetches(&self, count: usize) {
        self.inner.lock().fail_fetches = count;
    }

    fn fetches(&self) -> Vec<SequenceNo> {
        self.inner.lock().fetches.clone()
    }

    fn subscribes(&self) -> usize {
        self.inner.lock().subscribes
    }
}

#[async_trait]
impl EventSource<Note> for TestBackend {
    async fn subscribe(&self, _topic: &Topic) -> Result<EventStream<Note>, TransportError> {
        let (live, queue) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock();
        inner.subscribes += 1;
        inner.live = Some(live);

        Ok(Box::pin(UnboundedReceiverStream::new(queue)))
    }

    async fn fetch_since(
        &self,
        _topic: &Topic,
        since: SequenceNo,
    ) -> Result<Vec<Event<Note>>, CatchUpError> {
        let mut inner = self.inner.lock();

        inner.fetches.push(since);

        if inner.fail_fetches > 0 {
            inner.fail_fetches -= 1;
            return Err(CatchUpError::Fetch("scripted failure".to_owned()));
        }

        Ok(inner
            .log
            .iter()
            .filter(|event| event.sequence_no > since)
            .cloned()
            .collect())
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        backoff: BackoffConfig {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(20),
        },
        deferred_window: Duration::from_millis(200),
        catch_up_timeout: Duration::from_secs(1),
    }
}

type Seen = Arc<Mutex<Vec<(EventOp, Option<String>, Option<u64>)>>>;

fn collector() -> (Seen, Callback<Note>) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let callback: Callback<Note> = Box::new(move |change| {
        sink.lock().push((
            change.op,
            change.record.map(|record| record.body),
            change.sequence_no.map(SequenceNo::get),
        ));

        Ok(())
    });

    (seen, callback)
}

fn init_tracing() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ignored = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn settled<T>(what: &str, check: impl Fn() -> Option<T>) -> T {
    for _ in 0..400 {
        if let Some(value) = check() {
            return value;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("{what} did not settle in time");
}

async fn connected(engine: &SyncEngine<Note, TestBackend>) {
    let target = topic();

    let _state = settled("connection", || {
        engine.connection_state(&target).is_live().then_some(())
    })
    .await;
}

fn bodies(view: &[Note]) -> Vec<&str> {
    view.iter().map(|note| note.body.as_str()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn initial_catch_up_loads_existing_records() {
    init_tracing();

    let backend = TestBackend::new();

    // History exists before anyone subscribes.
    backend.commit(insert("d-1", "first", 100, 1));
    backend.commit(insert("d-2", "second", 105, 2));

    let engine = SyncEngine::new(backend.clone(), config());
    let (_seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    let view = settled("initial view", || {
        let view = engine.current_view(&topic());
        (view.len() == 2).then_some(view)
    })
    .await;

    assert_eq!(bodies(&view), vec!["first", "second"], "history loaded");
    assert_eq!(
        backend.fetches(),
        vec![SequenceNo::ZERO],
        "initial load is a catch-up from zero"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn live_insert_then_update_shows_the_update() {
    init_tracing();

    let backend = TestBackend::new();
    let engine = SyncEngine::new(backend.clone(), config());
    let (seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    backend.commit(insert("d-1", "first", 100, 1));
    backend.commit(update("d-1", "second", 105, 2));

    let view = settled("updated view", || {
        let view = engine.current_view(&topic());
        (bodies(&view) == vec!["second"]).then_some(view)
    })
    .await;

    assert_eq!(view.len(), 1, "one record");

    let changes = settled("both deliveries", || {
        let changes = seen.lock().clone();
        (changes.len() == 2).then_some(changes)
    })
    .await;
    assert_eq!(
        changes,
        vec![
            (EventOp::Insert, Some("first".to_owned()), Some(1)),
            (EventOp::Update, Some("second".to_owned()), Some(2)),
        ],
        "subscriber observed both commits in order"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn update_delivered_before_insert_resolves_on_arrival() {
    init_tracing();

    let backend = TestBackend::new();
    let engine = SyncEngine::new(backend.clone(), config());
    let (_seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    // The transport reorders: the update overtakes its insert.
    backend.commit(update("d-1", "second", 105, 2));

    assert!(
        engine.current_view(&topic()).is_empty(),
        "no phantom record while the update waits"
    );

    backend.commit(insert("d-1", "first", 100, 1));

    let view = settled("deferred resolution", || {
        let view = engine.current_view(&topic());
        (!view.is_empty()).then_some(view)
    })
    .await;

    assert_eq!(bodies(&view), vec!["second"], "final state reflects seq 2");
}

#[tokio::test(flavor = "multi_thread")]
async fn redelivered_events_reach_subscribers_once() {
    init_tracing();

    let backend = TestBackend::new();
    let engine = SyncEngine::new(backend.clone(), config());
    let (seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    let event = insert("d-1", "first", 100, 1);
    backend.commit(event.clone());
    backend.redeliver(event);
    backend.commit(insert("d-2", "second", 105, 2));

    let changes = settled("deliveries", || {
        let changes = seen.lock().clone();
        (changes.len() == 2).then_some(changes)
    })
    .await;

    assert_eq!(
        changes,
        vec![
            (EventOp::Insert, Some("first".to_owned()), Some(1)),
            (EventOp::Insert, Some("second".to_owned()), Some(2)),
        ],
        "the redelivered event was observed exactly once"
    );
    assert_eq!(engine.current_view(&topic()).len(), 2, "view unchanged");
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_then_resync_misses_nothing() {
    init_tracing();

    let backend = TestBackend::new();
    let engine = SyncEngine::new(backend.clone(), config());
    let (seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    for seq in 1..=5_u64 {
        backend.commit(insert(&format!("d-{seq}"), &format!("m{seq}"), seq * 10, seq));
    }

    let _view = settled("pre-drop view", || {
        let view = engine.current_view(&topic());
        (view.len() == 5).then_some(view)
    })
    .await;

    backend.drop_connection();

    // Committed while this client is (possibly) away; the catch-up fetch
    // and the fresh live channel overlap, and the buffer de-duplicates.
    for seq in 6..=8_u64 {
        backend.commit(insert(&format!("d-{seq}"), &format!("m{seq}"), seq * 10, seq));
    }

    connected(&engine).await;

    backend.commit(insert("d-9", "m9", 90, 9));

    let view = settled("post-resync view", || {
        let view = engine.current_view(&topic());
        (view.len() == 9).then_some(view)
    })
    .await;

    let got: Vec<String> = view.iter().map(|note| note.body.clone()).collect();
    let want: Vec<String> = (1..=9).map(|seq| format!("m{seq}")).collect();
    assert_eq!(got, want, "no gaps and no repeats across the disconnect");

    let sequences: Vec<Option<u64>> = settled("all deliveries", || {
        let changes = seen.lock().clone();
        (changes.len() == 9).then_some(changes.into_iter().map(|(_, _, seq)| seq).collect())
    })
    .await;

    assert_eq!(
        sequences,
        (1..=9_u64).map(Some).collect::<Vec<_>>(),
        "each accepted event was delivered exactly once, in order"
    );
    assert!(
        backend.subscribes() >= 2,
        "the transport was re-subscribed after the drop"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_catch_up_keeps_the_topic_disconnected() {
    init_tracing();

    let backend = TestBackend::new();
    backend.commit(insert("d-1", "first", 100, 1));
    backend.fail_next_fetches(2);

    let engine = SyncEngine::new(backend.clone(), config());
    let (_seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    assert_eq!(
        backend.fetches().len(),
        3,
        "two failed catch-ups were retried before the one that connected"
    );
    assert_eq!(
        bodies(&engine.current_view(&topic())),
        vec!["first"],
        "the view converged once catch-up succeeded"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn optimistic_local_record_is_superseded_by_confirmation() {
    init_tracing();

    let backend = TestBackend::new();
    let engine = SyncEngine::new(backend.clone(), config());
    let (seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    engine.submit_local(&topic(), note("tmp-9", "hello", 90), "corr-1".into());

    assert_eq!(
        bodies(&engine.current_view(&topic())),
        vec!["hello"],
        "the provisional record renders immediately"
    );

    backend.commit(insert("d-1", "hello", 100, 1).with_correlation("corr-1".into()));

    let view = settled("confirmed view", || {
        let view = engine.current_view(&topic());
        (view.len() == 1 && view[0].id.as_str() == "d-1").then_some(view)
    })
    .await;

    assert_eq!(bodies(&view), vec!["hello"], "exactly one copy, server id");

    let changes = settled("all three deliveries", || {
        let changes = seen.lock().clone();
        (changes.len() == 3).then_some(changes)
    })
    .await;
    assert_eq!(
        changes,
        vec![
            (EventOp::Insert, Some("hello".to_owned()), None),
            (EventOp::Delete, None, None),
            (EventOp::Insert, Some("hello".to_owned()), Some(1)),
        ],
        "provisional insert, retraction, then the authoritative insert"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_a_topic_stops_supervision_and_subscribers() {
    init_tracing();

    let backend = TestBackend::new();
    let engine = SyncEngine::new(backend.clone(), config());
    let (seen, callback) = collector();
    let _handle = engine.register(topic(), Box::new(|_| true), callback);

    connected(&engine).await;

    engine.close_topic(&topic());

    assert!(
        engine.current_view(&topic()).is_empty(),
        "closed topics serve no view"
    );
    assert!(
        !engine.connection_state(&topic()).is_live(),
        "closed topics read as disconnected"
    );

    let before = backend.subscribes();
    backend.commit(insert("d-1", "late", 100, 1));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        backend.subscribes(),
        before,
        "no worker is reconnecting for a closed topic"
    );
    assert!(
        seen.lock().is_empty(),
        "no deliveries after the topic closed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unopened_topics_read_as_empty_and_disconnected() {
    init_tracing();

    let engine = SyncEngine::new(TestBackend::new(), config());
    let unknown = Topic::new("chat:room-1");

    assert!(engine.current_view(&unknown).is_empty(), "empty view");
    assert!(
        !engine.connection_state(&unknown).is_live(),
        "defaults to disconnected"
    );
    assert!(
        engine.watch_connection(&unknown).is_none(),
        "nothing to watch"
    );
}
