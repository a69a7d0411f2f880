//! Ordering & de-dup buffer: the authoritative client-side view of one
//! topic's record set.
//!
//! The buffer owns the per-topic `record_id -> latest accepted record`
//! mapping and is the only place that mutates it. Events are applied in
//! monotonic sequence order per record; duplicates and superseded versions
//! are dropped, and mutations for records that have not been inserted yet
//! are parked for a bounded window instead of materializing phantom
//! records.

use core::time::Duration;
use std::collections::HashMap;

use liveboard_primitives::error::OrderingAnomaly;
use liveboard_primitives::event::{
    Change, CorrelationId, Event, EventOp, Record, RecordId, SequenceNo,
};
use liveboard_primitives::topic::Topic;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::resolve::{resolve, Resolution, Version};

/// Outcome of applying one event to the buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    /// The event advanced the view; a change was committed.
    Accepted,
    /// The sequence number had already been seen for that record.
    DuplicateIgnored,
    /// The sequence was new, but a newer version had already committed.
    StaleIgnored,
    /// Update/Delete for a record not yet known; parked for retry.
    Deferred,
}

#[derive(Debug)]
enum EntryState<R> {
    Live { record: R, version: Version },
    Tombstone,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Disposition {
    Commit,
    Stale,
    Defer,
}

#[derive(Debug)]
struct Entry<R> {
    /// Highest sequence number observed for this record id, including
    /// sequences whose payload was refused as stale. Never regresses.
    seen: SequenceNo,
    state: EntryState<R>,
}

#[derive(Debug)]
struct DeferredEvent<R> {
    event: Event<R>,
    received_at: Instant,
}

/// A locally-constructed record awaiting backend confirmation.
#[derive(Debug)]
struct LocalEntry<R> {
    record: R,
    correlation_id: CorrelationId,
}

/// Counters for diagnostics; cheap to take at any time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferStats {
    pub live: usize,
    pub tombstones: usize,
    pub deferred: usize,
    pub provisional: usize,
}

/// Merged view state for one topic.
#[derive(Debug)]
pub struct ViewBuffer<R> {
    topic: Topic,
    entries: HashMap<RecordId, Entry<R>>,
    deferred: HashMap<RecordId, Vec<DeferredEvent<R>>>,
    locals: HashMap<RecordId, LocalEntry<R>>,
    correlations: HashMap<CorrelationId, RecordId>,
    deferred_window: Duration,
    last_accepted: SequenceNo,
}

impl<R: Record> ViewBuffer<R> {
    #[must_use]
    pub fn new(topic: Topic, deferred_window: Duration) -> Self {
        Self {
            topic,
            entries: HashMap::new(),
            deferred: HashMap::new(),
            locals: HashMap::new(),
            correlations: HashMap::new(),
            deferred_window,
            last_accepted: SequenceNo::ZERO,
        }
    }

    /// Apply one event, pushing every committed change into `committed`.
    ///
    /// Accepting an insert can release deferred mutations for the same
    /// record, so a single call may commit several changes; the returned
    /// outcome describes the passed event only. Never blocks.
    pub fn apply(&mut self, event: Event<R>, committed: &mut Vec<Change<R>>) -> ApplyOutcome {
        let record_id = event.record_id.clone();
        let outcome = self.apply_inner(event, committed);

        if outcome == ApplyOutcome::Accepted {
            self.replay_deferred(&record_id, committed);
        }

        outcome
    }

    fn apply_inner(&mut self, event: Event<R>, committed: &mut Vec<Change<R>>) -> ApplyOutcome {
        let Event {
            op,
            record_id,
            payload,
            server_timestamp,
            sequence_no,
            correlation_id,
            ..
        } = event;

        if let Some(entry) = self.entries.get(&record_id) {
            if sequence_no <= entry.seen {
                debug!(
                    topic = %self.topic,
                    anomaly = %OrderingAnomaly::Duplicate {
                        record_id: record_id.clone(),
                        sequence_no,
                    },
                    "redelivered event ignored"
                );

                return ApplyOutcome::DuplicateIgnored;
            }
        }

        let version = Version::new(server_timestamp, sequence_no);

        match op {
            EventOp::Insert | EventOp::Update => {
                let Some(record) = payload else {
                    // A payload-less insert/update cannot advance the view.
                    warn!(
                        topic = %self.topic,
                        %record_id,
                        %sequence_no,
                        ?op,
                        "event without payload dropped"
                    );

                    return ApplyOutcome::StaleIgnored;
                };

                let disposition = match self.entries.get(&record_id) {
                    Some(entry) => match &entry.state {
                        EntryState::Live {
                            version: existing, ..
                        } => {
                            if resolve(*existing, version) == Resolution::KeepExisting {
                                Disposition::Stale
                            } else {
                                Disposition::Commit
                            }
                        }
                        // Updates must wait for the next lifecycle's
                        // insert; an insert starts it right here.
                        EntryState::Tombstone if op == EventOp::Update => Disposition::Defer,
                        EntryState::Tombstone => Disposition::Commit,
                    },
                    None if op == EventOp::Update => Disposition::Defer,
                    None => Disposition::Commit,
                };

                match disposition {
                    Disposition::Defer => self.defer(Event {
                        topic: self.topic.clone(),
                        op,
                        record_id,
                        payload: Some(record),
                        server_timestamp,
                        sequence_no,
                        correlation_id,
                    }),
                    Disposition::Stale => {
                        // The sequence was observed even though the payload
                        // lost; redelivery must come back as a duplicate.
                        if let Some(entry) = self.entries.get_mut(&record_id) {
                            entry.seen = sequence_no;
                        }

                        warn!(
                            topic = %self.topic,
                            anomaly = %OrderingAnomaly::Stale {
                                record_id: record_id.clone(),
                                sequence_no,
                            },
                            "out-of-order event superseded by a newer commit"
                        );

                        ApplyOutcome::StaleIgnored
                    }
                    Disposition::Commit => {
                        self.supersede_local(&record_id, correlation_id.as_ref(), committed);

                        let _ignored = self.entries.insert(
                            record_id.clone(),
                            Entry {
                                seen: sequence_no,
                                state: EntryState::Live {
                                    record: record.clone(),
                                    version,
                                },
                            },
                        );

                        self.commit(op, record_id, Some(record), sequence_no, committed);

                        ApplyOutcome::Accepted
                    }
                }
            }
            EventOp::Delete => {
                if let Some(entry) = self.entries.get_mut(&record_id) {
                    entry.seen = sequence_no;
                    entry.state = EntryState::Tombstone;

                    self.commit(op, record_id, None, sequence_no, committed);

                    ApplyOutcome::Accepted
                } else {
                    self.defer(Event {
                        topic: self.topic.clone(),
                        op,
                        record_id,
                        payload: None,
                        server_timestamp,
                        sequence_no,
                        correlation_id,
                    })
                }
            }
        }
    }

    fn commit(
        &mut self,
        op: EventOp,
        record_id: RecordId,
        record: Option<R>,
        sequence_no: SequenceNo,
        committed: &mut Vec<Change<R>>,
    ) {
        self.last_accepted = self.last_accepted.max(sequence_no);

        committed.push(Change {
            topic: self.topic.clone(),
            op,
            record_id,
            record,
            sequence_no: Some(sequence_no),
        });
    }

    fn defer(&mut self, event: Event<R>) -> ApplyOutcome {
        debug!(
            topic = %self.topic,
            record_id = %event.record_id,
            sequence_no = %event.sequence_no,
            ?event.op,
            "event deferred until its record arrives"
        );

        self.deferred
            .entry(event.record_id.clone())
            .or_default()
            .push(DeferredEvent {
                event,
                received_at: Instant::now(),
            });

        ApplyOutcome::Deferred
    }

    fn replay_deferred(&mut self, record_id: &RecordId, committed: &mut Vec<Change<R>>) {
        let Some(mut queued) = self.deferred.remove(record_id) else {
            return;
        };

        queued.sort_by_key(|deferred| deferred.event.sequence_no);

        debug!(
            topic = %self.topic,
            %record_id,
            count = queued.len(),
            "replaying deferred events"
        );

        for deferred in queued {
            let _outcome = self.apply_inner(deferred.event, committed);
        }
    }

    /// Supersede a provisional local record once the authoritative event
    /// for it arrives, either by record id or by correlation id.
    fn supersede_local(
        &mut self,
        record_id: &RecordId,
        correlation_id: Option<&CorrelationId>,
        committed: &mut Vec<Change<R>>,
    ) {
        if let Some(local) = self.locals.remove(record_id) {
            // Same id: the authoritative change replaces it in place.
            let _ignored = self.correlations.remove(&local.correlation_id);

            return;
        }

        let Some(correlation_id) = correlation_id else {
            return;
        };

        let Some(provisional_id) = self.correlations.remove(correlation_id) else {
            return;
        };

        if self.locals.remove(&provisional_id).is_some() {
            debug!(
                topic = %self.topic,
                %provisional_id,
                %correlation_id,
                "provisional record superseded by authoritative event"
            );

            // The server assigned a different id; retract the provisional
            // row before announcing the authoritative one.
            committed.push(Change {
                topic: self.topic.clone(),
                op: EventOp::Delete,
                record_id: provisional_id,
                record: None,
                sequence_no: None,
            });
        }
    }

    /// Insert a locally-constructed record ahead of backend confirmation.
    ///
    /// The record shows up in snapshots and is announced to subscribers
    /// immediately; the authoritative server event carrying
    /// `correlation_id` supersedes it deterministically.
    pub fn apply_local(
        &mut self,
        record: R,
        correlation_id: CorrelationId,
        committed: &mut Vec<Change<R>>,
    ) -> RecordId {
        let record_id = record.id().clone();

        debug!(
            topic = %self.topic,
            %record_id,
            %correlation_id,
            "provisional local record added"
        );

        committed.push(Change {
            topic: self.topic.clone(),
            op: EventOp::Insert,
            record_id: record_id.clone(),
            record: Some(record.clone()),
            sequence_no: None,
        });

        let _ignored = self
            .correlations
            .insert(correlation_id.clone(), record_id.clone());
        let _ignored = self.locals.insert(
            record_id.clone(),
            LocalEntry {
                record,
                correlation_id,
            },
        );

        record_id
    }

    /// Drop deferred events older than the window, logging each as an
    /// anomaly. Returns how many were evicted.
    pub fn evict_expired(&mut self) -> usize {
        let window = self.deferred_window;
        let topic = self.topic.clone();
        let mut evicted = 0_usize;

        self.deferred.retain(|record_id, queued| {
            queued.retain(|deferred| {
                let waited = deferred.received_at.elapsed();

                if waited <= window {
                    return true;
                }

                warn!(
                    %topic,
                    anomaly = %OrderingAnomaly::DeferredExpired {
                        op: deferred.event.op,
                        record_id: record_id.clone(),
                        waited,
                    },
                    "deferred event expired unresolved"
                );

                evicted += 1;

                false
            });

            !queued.is_empty()
        });

        evicted
    }

    /// Ordered snapshot of the current view: accepted records by
    /// `(server_timestamp, sequence_no)`, provisional locals last by their
    /// own `last_modified`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<R> {
        let mut live: Vec<(Version, &R)> = self
            .entries
            .values()
            .filter_map(|entry| match &entry.state {
                EntryState::Live { record, version } => Some((*version, record)),
                EntryState::Tombstone => None,
            })
            .collect();

        live.sort_by_key(|&(version, _)| version);

        let mut view: Vec<R> = live.into_iter().map(|(_, record)| record.clone()).collect();

        let mut provisional: Vec<&LocalEntry<R>> = self
            .locals
            .values()
            .filter(|local| !self.is_live(local.record.id()))
            .collect();

        provisional.sort_by_key(|local| local.record.last_modified());

        view.extend(provisional.into_iter().map(|local| local.record.clone()));

        view
    }

    fn is_live(&self, record_id: &RecordId) -> bool {
        self.entries
            .get(record_id)
            .is_some_and(|entry| matches!(entry.state, EntryState::Live { .. }))
    }

    /// Highest accepted sequence number for the topic — the resync
    /// high-water mark.
    #[must_use]
    pub const fn last_accepted(&self) -> SequenceNo {
        self.last_accepted
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            live: self
                .entries
                .values()
                .filter(|entry| matches!(entry.state, EntryState::Live { .. }))
                .count(),
            tombstones: self
                .entries
                .values()
                .filter(|entry| matches!(entry.state, EntryState::Tombstone))
                .count(),
            deferred: self.deferred.values().map(Vec::len).sum(),
            provisional: self.locals.len(),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}
