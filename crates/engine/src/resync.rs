//! Per-topic supervision: reconnect, catch-up, live delivery.
//!
//! One worker task per topic drives the connection state machine
//! `Disconnected -> Resyncing -> Connected -> Disconnected`, reconciling
//! the gap after every (re)connect with a bounded catch-up fetch before any
//! live event is applied, so nothing from the gap is lost or duplicated.

use std::sync::Arc;

use eyre::WrapErr;
use futures_util::StreamExt;
use liveboard_primitives::event::{Change, Event, Record};
use liveboard_primitives::subscription::ConnectionState;
use liveboard_primitives::topic::Topic;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::{ApplyOutcome, ViewBuffer};
use crate::config::EngineConfig;
use crate::notify::Notifier;
use crate::source::{EventSource, EventStream};

pub(crate) struct TopicWorker<R, S> {
    topic: Topic,
    config: EngineConfig,
    source: Arc<S>,
    buffer: Arc<Mutex<ViewBuffer<R>>>,
    notifier: Arc<Notifier<R>>,
    state: watch::Sender<ConnectionState>,
}

impl<R: Record, S: EventSource<R>> TopicWorker<R, S> {
    pub(crate) fn new(
        topic: Topic,
        config: EngineConfig,
        source: Arc<S>,
        buffer: Arc<Mutex<ViewBuffer<R>>>,
        notifier: Arc<Notifier<R>>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            topic,
            config,
            source,
            buffer,
            notifier,
            state,
        }
    }

    /// Supervision loop; runs until the owning engine aborts the task.
    pub(crate) async fn run(self) {
        let mut attempt = 0_u32;

        loop {
            // The engine dropped this topic's handle; nothing observes us.
            if self.state.is_closed() {
                debug!(topic = %self.topic, "topic handle dropped, stopping supervision");
                return;
            }

            self.set_state(ConnectionState::Disconnected);

            let mut stream = match self.source.subscribe(&self.topic).await {
                Ok(stream) => stream,
                Err(err) => {
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);

                    warn!(
                        topic = %self.topic,
                        %err,
                        ?delay,
                        "subscribe failed, applying exponential backoff"
                    );

                    time::sleep(delay).await;

                    continue;
                }
            };

            self.set_state(ConnectionState::Resyncing);

            if let Err(err) = self.catch_up().await {
                let delay = self.config.backoff.delay(attempt);
                attempt = attempt.saturating_add(1);

                // Not silently connected: the UI keeps its stale-data
                // indicator until the gap is confirmed closed.
                self.set_state(ConnectionState::Disconnected);

                error!(
                    topic = %self.topic,
                    %err,
                    ?delay,
                    "catch-up failed, staying disconnected"
                );

                time::sleep(delay).await;

                continue;
            }

            attempt = 0;
            self.set_state(ConnectionState::Connected);

            info!(topic = %self.topic, "live streaming resumed");

            self.live_loop(&mut stream).await;
        }
    }

    /// Fetch and apply everything missed since the last accepted sequence.
    async fn catch_up(&self) -> eyre::Result<()> {
        let since = self.buffer.lock().last_accepted();
        let start = time::Instant::now();

        let events = timeout(
            self.config.catch_up_timeout,
            self.source.fetch_since(&self.topic, since),
        )
        .await
        .wrap_err("catch-up fetch timed out")?
        .wrap_err("catch-up fetch failed")?;

        let took = start.elapsed();
        let fetched = events.len();
        let accepted = self.apply_and_publish(events);

        debug!(
            topic = %self.topic,
            %since,
            fetched,
            accepted,
            ?took,
            "catch-up complete"
        );

        Ok(())
    }

    async fn live_loop(&self, stream: &mut EventStream<R>) {
        let mut sweep = time::interval(self.config.deferred_window);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let _evicted = self.buffer.lock().evict_expired();
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let _accepted = self.apply_and_publish(vec![event]);
                    }
                    Some(Err(err)) => {
                        warn!(topic = %self.topic, %err, "transport dropped, reconnecting");
                        return;
                    }
                    None => {
                        warn!(topic = %self.topic, "event stream ended, reconnecting");
                        return;
                    }
                },
            }
        }
    }

    /// Apply a batch through the buffer, then fan out what committed.
    ///
    /// The buffer lock is released before publishing; `publish` only
    /// enqueues, so neither step blocks on a subscriber.
    fn apply_and_publish(&self, events: Vec<Event<R>>) -> usize {
        let mut committed: Vec<Change<R>> = Vec::new();
        let mut accepted = 0_usize;

        {
            let mut buffer = self.buffer.lock();

            for event in events {
                if buffer.apply(event, &mut committed) == ApplyOutcome::Accepted {
                    accepted += 1;
                }
            }
        }

        for change in &committed {
            self.notifier.publish(&self.topic, change);
        }

        accepted
    }

    fn set_state(&self, next: ConnectionState) {
        let _changed = self.state.send_if_modified(|state| {
            let current = *state;

            if current == next {
                return false;
            }

            debug!(topic = %self.topic, from = %current, to = %next, "connection state changed");

            *state = next;

            true
        });
    }
}
