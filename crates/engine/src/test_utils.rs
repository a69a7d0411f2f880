//! Shared fixtures for the crate's test suites.

use liveboard_primitives::event::{Event, Record, RecordId, SequenceNo, Timestamp};
use liveboard_primitives::topic::Topic;

/// A minimal synchronized record, standing in for a doubt, chat message or
/// notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Note {
    pub id: RecordId,
    pub body: String,
    pub modified: Timestamp,
}

impl Record for Note {
    fn id(&self) -> &RecordId {
        &self.id
    }

    fn last_modified(&self) -> Timestamp {
        self.modified
    }
}

pub(crate) fn topic() -> Topic {
    Topic::new("doubts:session-42")
}

pub(crate) fn note(id: &str, body: &str, modified: u64) -> Note {
    Note {
        id: RecordId::new(id),
        body: body.to_owned(),
        modified: Timestamp::from_millis(modified),
    }
}

pub(crate) fn insert(id: &str, body: &str, ts: u64, seq: u64) -> Event<Note> {
    Event::insert(
        topic(),
        RecordId::new(id),
        note(id, body, ts),
        Timestamp::from_millis(ts),
        SequenceNo::new(seq),
    )
}

pub(crate) fn update(id: &str, body: &str, ts: u64, seq: u64) -> Event<Note> {
    Event::update(
        topic(),
        RecordId::new(id),
        note(id, body, ts),
        Timestamp::from_millis(ts),
        SequenceNo::new(seq),
    )
}

pub(crate) fn delete(id: &str, ts: u64, seq: u64) -> Event<Note> {
    Event::delete(
        topic(),
        RecordId::new(id),
        Timestamp::from_millis(ts),
        SequenceNo::new(seq),
    )
}
