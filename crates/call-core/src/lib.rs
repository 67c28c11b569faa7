//! Call-control core for the ferrovox SIP endpoint.
//!
//! One [`CallEngine`] owns any number of call legs ([`Connection`]s) and a
//! shared transaction table. The engine task consumes transport events and
//! internal timers from a single loop; applications drive legs through the
//! engine's async operations and observe them through a stream of
//! [`CallEvent`]s.
//!
//! The crate speaks the typed message model from `ferrovox-sip-types` and
//! leaves wire I/O to a [`SipTransport`] implementation and media to a
//! [`MediaSession`] implementation, both supplied at engine construction.
//!
//! What lives where:
//! - [`engine`]: the event loop, message routing and the public call API
//! - [`connection`]: per-leg state machine (offer/answer, hold, teardown)
//! - [`transaction`]: transaction matching, retransmission and GC
//! - [`dialog`]: dialog identity, route sets and in-dialog targets
//! - [`transfer`]: REFER/NOTIFY call transfer on top of the above

pub mod config;
pub mod connection;
pub mod cseq;
pub mod dialog;
pub mod engine;
pub mod errors;
pub mod events;
pub mod media;
pub mod transaction;
pub mod transfer;
pub mod transport;
pub mod util;

mod timer;

pub use config::{CallEngineConfig, TimerSettings};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dialog::{Dialog, HoldState};
pub use engine::CallEngine;
pub use errors::{CallError, Result};
pub use events::{CallEvent, CallEventKind, CauseCode};
pub use media::{
    CodecSelection, MediaCapabilities, MediaConnectionId, MediaDestination, MediaError,
    MediaSession, MediaTransportOptions,
};
pub use transport::{event_channel, MessageStatus, SipEvent, SipTransport, TransportError};
pub use util::random::{RandomSource, SmallRngSource};
