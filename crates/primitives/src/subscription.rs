use core::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a registered subscriber.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Liveness of one topic's link to the backend.
///
/// Lifecycle: starts `Disconnected`, moves to `Resyncing` once a transport
/// subscription is established, to `Connected` once the catch-up fetch
/// completes, and back to `Disconnected` on a transport drop. A UI should
/// treat anything other than `Connected` as stale data.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionState {
    Disconnected,
    Resyncing,
    Connected,
}

impl ConnectionState {
    /// True once live events are flowing and the view is current.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(*self, Self::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::Disconnected => "disconnected",
            Self::Resyncing => "resyncing",
            Self::Connected => "connected",
        };

        f.pad(name)
    }
}
