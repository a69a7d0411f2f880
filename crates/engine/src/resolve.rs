use core::cmp::Ordering;

use liveboard_primitives::event::{SequenceNo, Timestamp};

/// Version stamp of an accepted record or an incoming event.
///
/// Ordered last-writer-wins: server timestamp first, sequence number as the
/// deterministic tie-break (the backend's sequence assignment is total, so
/// two versions never compare equal unless they are the same event).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Version {
    pub server_timestamp: Timestamp,
    pub sequence_no: SequenceNo,
}

impl Version {
    #[must_use]
    pub const fn new(server_timestamp: Timestamp, sequence_no: SequenceNo) -> Self {
        Self {
            server_timestamp,
            sequence_no,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    KeepExisting,
    ReplaceWithIncoming,
}

/// Decide which version of a record wins a concurrent update.
///
/// Whole-record replacement only — fields are never merged.
#[must_use]
pub fn resolve(existing: Version, incoming: Version) -> Resolution {
    match incoming.cmp(&existing) {
        Ordering::Greater => Resolution::ReplaceWithIncoming,
        Ordering::Less | Ordering::Equal => Resolution::KeepExisting,
    }
}
