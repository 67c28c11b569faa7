//! Error type for message construction.

/// Errors raised while building or interpreting typed messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SipTypesError {
    /// A dial string or address did not resolve to a usable URI.
    #[error("invalid URI: {uri}")]
    InvalidUri { uri: String },

    /// A builder was asked to derive a message from one missing a
    /// prerequisite, e.g. an ACK for a request that was never an INVITE.
    #[error("cannot derive {derived} from a {method} request")]
    WrongMethod {
        derived: &'static str,
        method: &'static str,
    },

    /// A request was constructed without a Via entry to take a branch from.
    #[error("request has no Via entry")]
    MissingVia,
}
