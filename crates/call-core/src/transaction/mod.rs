//! Transaction engine: matching, retransmission state, and the table.
//!
//! A transaction is one request/response exchange. The table maps every
//! message, inbound or about to go out, to the transaction it belongs to
//! and says how the two relate: a retransmission to suppress, a new final
//! to dispatch, the ACK that closes an INVITE, and so on.
//!
//! Locking protocol: the table's bucket map is guarded by one mutex taken
//! only for structural changes. Each transaction carries its own async
//! lock; a successful find hands back the transaction already locked, and
//! dropping the guard makes it available again. Long work (a network send,
//! a media call) happens while holding only the per-transaction lock.

mod entry;
mod key;
mod table;

pub use entry::{ResendOutcome, TransactionData};
pub use key::TransactionMeta;
pub use table::{LockedTransaction, TransactionSlot, TransactionTable};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-unique transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn from_raw(raw: u64) -> Self {
        TransactionId(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Which side opened the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// We sent the request.
    Outgoing,
    /// The far end sent the request.
    Incoming,
}

/// How the transaction is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// User-agent transaction: Call-ID, From tag, To tag, CSeq.
    Ua,
    /// Proxy transaction: Call-ID plus top Via branch.
    Proxy,
}

/// How a message relates to the transaction it matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    /// Identical retransmission of something already seen.
    Duplicate,
    /// First final response.
    Final,
    /// Provisional (1xx) response.
    Provisional,
    /// A different final after one was already recorded, e.g. 200 after 487.
    NewFinal,
    /// ACK closing a non-2xx INVITE transaction.
    Ack,
    /// ACK for a 2xx final.
    TwoXxAck,
    /// CANCEL aimed at a matched INVITE transaction.
    Cancel,
    /// Response to the CANCEL inside an INVITE transaction.
    CancelResponse,
    /// A request with no matching transaction; caller starts one.
    Request,
    /// Nothing matched and nothing can be started from this message.
    Unknown,
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Relationship::Duplicate => "duplicate",
            Relationship::Final => "final",
            Relationship::Provisional => "provisional",
            Relationship::NewFinal => "new-final",
            Relationship::Ack => "ack",
            Relationship::TwoXxAck => "2xx-ack",
            Relationship::Cancel => "cancel",
            Relationship::CancelResponse => "cancel-response",
            Relationship::Request => "request",
            Relationship::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
