//! Typed SIP message model for the ferrovox call engine.
//!
//! The engine consumes messages through accessor contracts: one struct field
//! per header the call-control logic reads or writes, typed bodies for
//! offer/answer and sipfrag payloads, and derive-style builders carrying the
//! RFC 3261 copying rules. Wire parsing and serialization live at the
//! transport boundary, not here.

pub mod error;
pub mod headers;
pub mod message;
pub mod method;
pub mod sdp;
pub mod sipfrag;
pub mod status;
pub mod uri;

pub use error::SipTypesError;
pub use headers::{
    BRANCH_MAGIC_COOKIE, CSeq, EventKind, NameAddr, Party, ReferTo, Replaces, SubscriptionState,
    Via,
};
pub use message::{Body, DEFAULT_MAX_FORWARDS, Message, Request, Response, generate_call_id};
pub use method::Method;
pub use sdp::{Codec, NULL_MEDIA_ADDRESS, SessionDescription, SrtpParams};
pub use sipfrag::SipFrag;
pub use status::StatusCode;
pub use uri::{Scheme, Uri};

/// Common imports for crates building on the message model.
pub mod prelude {
    pub use crate::error::SipTypesError;
    pub use crate::headers::{CSeq, EventKind, NameAddr, Party, ReferTo, Replaces, Via};
    pub use crate::message::{Body, Message, Request, Response};
    pub use crate::method::Method;
    pub use crate::sdp::{Codec, SessionDescription};
    pub use crate::sipfrag::SipFrag;
    pub use crate::status::StatusCode;
    pub use crate::uri::{Scheme, Uri};
}
