//! Immutable matching identity of a transaction.

use ferrovox_sip_types::{Method, Request, Response};

use crate::connection::ConnectionId;
use crate::transaction::{Direction, TransactionId, TransactionKind};

/// Fields fixed at creation that matching prefilters on. The To tag is the
/// one matching input that can be learned mid-transaction, so it lives in
/// the mutable data instead.
#[derive(Debug, Clone)]
pub struct TransactionMeta {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub direction: Direction,
    pub call_id: String,
    /// From tag of the request that opened the transaction.
    pub from_tag: Option<String>,
    /// CSeq number of the opening request.
    pub seq: u32,
    /// CSeq method of the opening request.
    pub method: Method,
    /// Top Via branch of the opening request.
    pub branch: Option<String>,
    /// Connection that owns this transaction, for routing late outcomes.
    pub owner: Option<ConnectionId>,
}

impl TransactionMeta {
    pub fn for_request(
        id: TransactionId,
        kind: TransactionKind,
        direction: Direction,
        request: &Request,
        owner: Option<ConnectionId>,
    ) -> Self {
        TransactionMeta {
            id,
            kind,
            direction,
            call_id: request.call_id.clone(),
            from_tag: request.from.tag.clone(),
            seq: request.cseq.seq,
            method: request.cseq.method,
            branch: request.branch().map(str::to_string),
            owner,
        }
    }

    /// Two metas describe the same transaction key. Used to refuse double
    /// insertion.
    pub fn same_key(&self, other: &TransactionMeta) -> bool {
        if self.kind != other.kind || self.direction != other.direction {
            return false;
        }
        match self.kind {
            TransactionKind::Ua => {
                self.call_id == other.call_id
                    && self.from_tag == other.from_tag
                    && self.seq == other.seq
                    && self.method == other.method
            }
            TransactionKind::Proxy => {
                self.call_id == other.call_id && self.branch == other.branch
            }
        }
    }

    /// Cheap prefilter for a response against this transaction. Ignores the
    /// To tag, which is checked against learned state under the entry lock.
    pub fn prefilter_response(&self, response: &Response) -> bool {
        if response.call_id != self.call_id {
            return false;
        }
        match self.kind {
            TransactionKind::Ua => {
                response.cseq.seq == self.seq
                    && response.from_tag() == self.from_tag.as_deref()
                    && self.cseq_method_compatible(response.cseq.method)
            }
            TransactionKind::Proxy => response.branch() == self.branch.as_deref(),
        }
    }

    /// Cheap prefilter for a request against this transaction.
    pub fn prefilter_request(&self, request: &Request) -> bool {
        if request.call_id != self.call_id {
            return false;
        }
        match self.kind {
            TransactionKind::Ua => {
                request.cseq.seq == self.seq
                    && request.from_tag() == self.from_tag.as_deref()
                    && self.request_method_compatible(request.method)
            }
            TransactionKind::Proxy => request.branch() == self.branch.as_deref(),
        }
    }

    /// A response CSeq method that can belong here: the transaction's own
    /// method, or CANCEL riding inside an INVITE transaction.
    fn cseq_method_compatible(&self, method: Method) -> bool {
        method == self.method || (self.method == Method::Invite && method == Method::Cancel)
    }

    /// A request method that can belong here: a retransmission of the
    /// opening request, or ACK/CANCEL aimed at an INVITE transaction.
    fn request_method_compatible(&self, method: Method) -> bool {
        method == self.method || (self.method == Method::Invite && method.targets_invite())
    }
}
