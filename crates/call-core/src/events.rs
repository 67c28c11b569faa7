//! Call lifecycle events.
//!
//! Every observable outcome of call processing is reported to the
//! application as a `(kind, cause)` pair on the engine's event channel.
//! The enums are closed: applications can match exhaustively.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use ferrovox_sip_types::{Party, StatusCode};

use crate::connection::ConnectionId;

/// What happened to a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEventKind {
    /// A connection object came into existence.
    NewCall,
    /// Local dialing started.
    DialTone,
    /// The remote side is being offered our call.
    RemoteOffering,
    /// The remote side is ringing.
    RemoteAlerting,
    /// The call is established.
    Connected,
    /// Media is flowing again after hold.
    Bridged,
    /// This side put the call on hold.
    Held,
    /// The remote side put the call on hold.
    RemoteHeld,
    /// The dialog ended.
    Disconnected,
    /// An inbound call is being offered to us.
    Offering,
    /// We signalled ringing to the remote side.
    Alerting,
    /// The connection object was removed.
    Destroyed,
    /// Transfer progress; the cause carries the phase.
    Transfer,
}

/// Why it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CauseCode {
    Normal,
    Busy,
    ResourceLimit,
    Network,
    Redirected,
    NoResponse,
    TransferInitiated,
    TransferAccepted,
    TransferRinging,
    TransferSuccess,
    TransferFailure,
    SmimeFailure,
    BadRefer,
    NoKnownInvite,
    ByeDuringIdle,
    BadRedirect,
    TransactionDoesNotExist,
    Cancelled,
    NoCodecs,
    ServerError,
    NotAllowed,
    NetworkNotAllowed,
    IncompatibleDestination,
    DestNotObtainable,
    NetworkNotObtainable,
    NetworkCongestion,
    RemoteEncryptionUnsupported,
}

impl CauseCode {
    /// Deterministic cause for a failure response (>= 400) to an INVITE.
    ///
    /// Specific codes map individually; everything else falls back to its
    /// response class.
    pub fn from_failure_status(status: StatusCode) -> CauseCode {
        match status.as_u16() {
            401 => CauseCode::NotAllowed,
            407 => CauseCode::NetworkNotAllowed,
            404 => CauseCode::DestNotObtainable,
            408 => CauseCode::Cancelled,
            486 | 600 => CauseCode::Busy,
            488 => CauseCode::IncompatibleDestination,
            493 => CauseCode::NotAllowed,
            500 => CauseCode::ServerError,
            code if (400..500).contains(&code) => CauseCode::IncompatibleDestination,
            code if (500..600).contains(&code) => CauseCode::NetworkNotObtainable,
            _ => CauseCode::NetworkCongestion,
        }
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub connection: ConnectionId,
    pub kind: CallEventKind,
    pub cause: CauseCode,
    /// Remote party identity, set when the event introduces a leg
    /// (NewCall, Offering).
    pub remote: Option<Party>,
}

/// Per-connection handle for emitting lifecycle events.
///
/// Emission never blocks call processing: if the application falls behind
/// and the channel fills, the event is dropped with a warning.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    connection: ConnectionId,
    tx: mpsc::Sender<CallEvent>,
}

impl EventEmitter {
    pub fn new(connection: ConnectionId, tx: mpsc::Sender<CallEvent>) -> Self {
        EventEmitter { connection, tx }
    }

    pub fn emit(&self, kind: CallEventKind, cause: CauseCode) {
        self.emit_event(CallEvent {
            connection: self.connection,
            kind,
            cause,
            remote: None,
        });
    }

    pub fn emit_with_remote(&self, kind: CallEventKind, cause: CauseCode, remote: Party) {
        self.emit_event(CallEvent {
            connection: self.connection,
            kind,
            cause,
            remote: Some(remote),
        });
    }

    fn emit_event(&self, event: CallEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(connection = %self.connection, "lifecycle event dropped: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_mapping_specific_codes() {
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::Unauthorized),
            CauseCode::NotAllowed
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::ProxyAuthRequired),
            CauseCode::NetworkNotAllowed
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::RequestTimeout),
            CauseCode::Cancelled
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::NotAcceptableHere),
            CauseCode::IncompatibleDestination
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::NotFound),
            CauseCode::DestNotObtainable
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::Undecipherable),
            CauseCode::NotAllowed
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::BusyHere),
            CauseCode::Busy
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::BusyEverywhere),
            CauseCode::Busy
        );
    }

    #[test]
    fn failure_mapping_class_defaults() {
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::Custom(410)),
            CauseCode::IncompatibleDestination
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::ServiceUnavailable),
            CauseCode::NetworkNotObtainable
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::ServerInternalError),
            CauseCode::ServerError
        );
        assert_eq!(
            CauseCode::from_failure_status(StatusCode::Decline),
            CauseCode::NetworkCongestion
        );
    }

    #[tokio::test]
    async fn emitter_delivers_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = EventEmitter::new(ConnectionId::from_raw(9), tx);
        emitter.emit(CallEventKind::Connected, CauseCode::Normal);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, CallEventKind::Connected);
        assert_eq!(event.cause, CauseCode::Normal);
        assert_eq!(event.connection, ConnectionId::from_raw(9));
    }

    #[tokio::test]
    async fn emitter_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let emitter = EventEmitter::new(ConnectionId::from_raw(1), tx);
        emitter.emit(CallEventKind::NewCall, CauseCode::Normal);
        emitter.emit(CallEventKind::Connected, CauseCode::Normal);
        assert_eq!(rx.recv().await.unwrap().kind, CallEventKind::NewCall);
        assert!(rx.try_recv().is_err());
    }
}
