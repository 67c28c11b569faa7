//! SIP request methods understood by the call engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of request methods the call engine dispatches on.
///
/// Methods outside this set never reach the engine: the transport layer
/// answers them before delivery. Keeping the enum closed lets the state
/// machine match exhaustively instead of comparing method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Session initiation and in-dialog session modification.
    Invite,
    /// Acknowledges a final response to an INVITE.
    Ack,
    /// Terminates an established dialog.
    Bye,
    /// Cancels a pending INVITE transaction.
    Cancel,
    /// Capability query.
    Options,
    /// Asks the peer to initiate a call to a third party (transfer).
    Refer,
    /// Reports transfer progress back to the referrer.
    Notify,
    /// Mid-dialog application payload (DTMF and similar).
    Info,
}

impl Method {
    /// Every method in the set, in Allow-header order.
    pub const SUPPORTED: [Method; 8] = [
        Method::Invite,
        Method::Ack,
        Method::Bye,
        Method::Cancel,
        Method::Options,
        Method::Refer,
        Method::Notify,
        Method::Info,
    ];

    /// Canonical method token as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Info => "INFO",
        }
    }

    /// True for the two methods that ride on an INVITE transaction rather
    /// than forming their own client transaction key.
    pub fn targets_invite(&self) -> bool {
        matches!(self, Method::Ack | Method::Cancel)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_token() {
        assert_eq!(Method::Invite.to_string(), "INVITE");
        assert_eq!(Method::Refer.to_string(), "REFER");
    }

    #[test]
    fn ack_and_cancel_target_invite() {
        assert!(Method::Ack.targets_invite());
        assert!(Method::Cancel.targets_invite());
        assert!(!Method::Bye.targets_invite());
    }
}
