use core::time::Duration;

use thiserror::Error;

use crate::event::{EventOp, RecordId, SequenceNo};

/// Transport-level failure of a topic subscription.
///
/// Always recoverable: the resync controller reconnects with backoff and
/// reconciles the gap before resuming live delivery.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("subscription rejected: {0}")]
    SubscribeFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection closed by the transport")]
    Closed,
}

/// Failure of a catch-up fetch during resync.
///
/// Retried with backoff; the topic stays `Disconnected` until a fetch
/// succeeds, so consumers never mistake a gap for live data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatchUpError {
    #[error("catch-up fetch failed: {0}")]
    Fetch(String),

    #[error("catch-up fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An event the ordering buffer refused to apply.
///
/// Anomalies are logged and counted, never surfaced to subscribers and
/// never allowed to corrupt view state.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum OrderingAnomaly {
    #[error("duplicate event for record {record_id} (sequence {sequence_no})")]
    Duplicate {
        record_id: RecordId,
        sequence_no: SequenceNo,
    },

    #[error("stale event for record {record_id} (sequence {sequence_no})")]
    Stale {
        record_id: RecordId,
        sequence_no: SequenceNo,
    },

    #[error("deferred {op:?} for unknown record {record_id} expired after {waited:?}")]
    DeferredExpired {
        op: EventOp,
        record_id: RecordId,
        waited: Duration,
    },
}

/// Error returned by a subscriber callback.
///
/// Logged and isolated to that subscriber; delivery to it resumes with the
/// next change and other subscribers are unaffected.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync + 'static>;
