//! Error types for the call engine.
//!
//! Everything that crosses the public API returns [`CallError`]. Failures
//! inside message processing never surface here; they resolve to lifecycle
//! events per the error-handling design.

use ferrovox_sip_types::SipTypesError;

use crate::connection::ConnectionId;
use crate::media::MediaError;
use crate::transport::TransportError;

/// Errors returned by engine and connection API calls.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The operation is not legal in the connection's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// No connection with the given id exists (or it was already destroyed).
    #[error("no such connection: {id}")]
    ConnectionNotFound { id: ConnectionId },

    /// The engine configuration failed validation.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// The transport refused or failed the send.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The media collaborator failed.
    #[error("media failure: {0}")]
    Media(#[from] MediaError),

    /// A dial string or address could not be interpreted.
    #[error(transparent)]
    Address(#[from] SipTypesError),

    /// A transfer was requested while another REFER is still outstanding.
    #[error("transfer already in progress on this connection")]
    TransferInProgress,

    /// The engine's event loop has shut down.
    #[error("engine stopped")]
    EngineStopped,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CallError>;
