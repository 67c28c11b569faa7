//! Call leg lifecycle states and the legal transition set.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one call leg. Terminal states are `Disconnected` and
/// `Failed`; nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, no INVITE exchanged yet.
    Idle,
    /// Dialog-forming INVITE sent or received, no ringing indication yet.
    Offering,
    /// Ringing; early media may loop through here repeatedly.
    Alerting,
    /// Call answered, session up.
    Established,
    /// Far end reported the call queued (182).
    Queued,
    /// Torn down normally.
    Disconnected,
    /// Torn down by failure.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// Past Idle and not yet torn down.
    pub fn is_live(self) -> bool {
        !self.is_terminal() && self != ConnectionState::Idle
    }

    /// Whether the lifecycle table allows moving from `self` to `next`.
    /// Re-entering the current state is always allowed (the early-media
    /// loop re-enters Alerting on every 18x).
    pub fn may_enter(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Idle, Offering | Disconnected | Failed) => true,
            (Offering, Alerting | Established | Queued | Disconnected | Failed) => true,
            (Alerting, Established | Queued | Disconnected | Failed) => true,
            (Queued, Alerting | Established | Disconnected | Failed) => true,
            (Established, Disconnected | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Offering => "offering",
            ConnectionState::Alerting => "alerting",
            ConnectionState::Established => "established",
            ConnectionState::Queued => "queued",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
