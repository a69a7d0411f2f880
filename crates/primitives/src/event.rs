use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::topic::Topic;

/// Position of an event in its topic's externally-ordered append-only
/// stream. Assigned by the backend; the ordering authority together with
/// [`Timestamp`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct SequenceNo(u64);

impl SequenceNo {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server-assigned wall-clock timestamp, milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier of a synchronized record within its topic.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RecordId(Arc<str>);

impl RecordId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Client-generated id correlating an optimistic local record with the
/// authoritative server event that later confirms it.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventOp {
    Insert,
    Update,
    Delete,
}

impl EventOp {
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(*self, Self::Delete)
    }
}

/// A tagged mutation produced by the backend for one topic.
///
/// Events are immutable once received. `payload` is absent for deletes;
/// `correlation_id` is present when the mutation originated from this
/// client's own optimistic submission.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event<R> {
    pub topic: Topic,
    pub op: EventOp,
    pub record_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<R>,
    pub server_timestamp: Timestamp,
    pub sequence_no: SequenceNo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl<R> Event<R> {
    #[must_use]
    pub fn insert(
        topic: Topic,
        record_id: RecordId,
        payload: R,
        server_timestamp: Timestamp,
        sequence_no: SequenceNo,
    ) -> Self {
        Self {
            topic,
            op: EventOp::Insert,
            record_id,
            payload: Some(payload),
            server_timestamp,
            sequence_no,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn update(
        topic: Topic,
        record_id: RecordId,
        payload: R,
        server_timestamp: Timestamp,
        sequence_no: SequenceNo,
    ) -> Self {
        Self {
            topic,
            op: EventOp::Update,
            record_id,
            payload: Some(payload),
            server_timestamp,
            sequence_no,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn delete(
        topic: Topic,
        record_id: RecordId,
        server_timestamp: Timestamp,
        sequence_no: SequenceNo,
    ) -> Self {
        Self {
            topic,
            op: EventOp::Delete,
            record_id,
            payload: None,
            server_timestamp,
            sequence_no,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Capability set the engine requires of a synchronized domain object.
///
/// The engine never looks inside a record beyond these two accessors;
/// doubts, chat messages and notifications all qualify.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &RecordId;

    fn last_modified(&self) -> Timestamp;
}

/// A committed mutation of a topic's view, as observed by subscribers.
///
/// `record` is absent for deletes. `sequence_no` is absent for provisional
/// local records that have not been confirmed by the backend yet.
#[derive(Clone, Debug)]
pub struct Change<R> {
    pub topic: Topic,
    pub op: EventOp,
    pub record_id: RecordId,
    pub record: Option<R>,
    pub sequence_no: Option<SequenceNo>,
}
