//! Mutable state of one transaction, guarded by the entry lock.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use ferrovox_sip_types::{Method, Request, Response};

use crate::timer::TimerHandle;
use crate::transaction::{Direction, Relationship};

/// What to do when a retransmission timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    /// Send the stored message again and rearm with this wait.
    Resend(Duration),
    /// Backoff ceiling reached without an answer.
    Exhausted,
    /// The answer arrived in the meantime; stop.
    Settled,
}

/// Per-transaction mutable state. Holding the entry lock is the "busy"
/// mark: nothing else may touch this while a guard is out.
#[derive(Debug)]
pub struct TransactionData {
    /// The request that opened the transaction, exclusively owned.
    pub request: Request,
    /// To tag learned from the first tagged message on this transaction.
    pub to_tag: Option<String>,
    /// Status of the newest provisional response seen.
    pub last_provisional: Option<u16>,
    /// Newest final response, kept to replay on duplicate requests.
    pub last_final: Option<Response>,
    /// CANCEL sent or received inside an INVITE transaction.
    pub cancel: Option<Request>,
    /// ACK we sent for a final response on an outgoing INVITE.
    pub ack: Option<Request>,
    /// An inbound INVITE transaction saw its ACK.
    pub ack_seen: bool,
    /// Extra observer; every newly matched response is forwarded here in
    /// addition to normal dispatch. Dropped once the receiver goes away.
    pub response_tx: Option<mpsc::UnboundedSender<Response>>,
    pub resend_count: u32,
    /// Wait before the next retransmission; doubles up to the ceiling.
    pub next_timeout: Duration,
    pub last_activity: Instant,
    pub retransmit_timer: Option<TimerHandle>,
}

impl TransactionData {
    pub fn new(request: Request, t1: Duration) -> Self {
        TransactionData {
            to_tag: request.to.tag.clone(),
            request,
            last_provisional: None,
            last_final: None,
            cancel: None,
            ack: None,
            ack_seen: false,
            response_tx: None,
            resend_count: 0,
            next_timeout: t1,
            last_activity: Instant::now(),
            retransmit_timer: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Advance the backoff schedule on a timer fire. `t2` is the wait
    /// ceiling; once a full ceiling wait passes unanswered the transaction
    /// is exhausted.
    ///
    /// What counts as answered depends on direction: an outgoing request
    /// stops once any response lands, an incoming INVITE keeps resending
    /// its final until the ACK lands.
    pub fn on_resend_timer(&mut self, t2: Duration, direction: Direction) -> ResendOutcome {
        let settled = match direction {
            Direction::Outgoing => {
                self.last_provisional.is_some() || self.last_final.is_some()
            }
            Direction::Incoming => self.ack_seen || self.last_final.is_none(),
        };
        if settled {
            return ResendOutcome::Settled;
        }
        if self.next_timeout >= t2 {
            return ResendOutcome::Exhausted;
        }
        self.resend_count += 1;
        self.next_timeout = (self.next_timeout * 2).min(t2);
        self.touch();
        ResendOutcome::Resend(self.next_timeout)
    }

    fn learn_to_tag(&mut self, tag: Option<&str>) {
        if self.to_tag.is_none() {
            if let Some(tag) = tag {
                self.to_tag = Some(tag.to_string());
            }
        }
    }

    /// To-tag compatibility: an unset tag on either side matches anything.
    fn to_tag_compatible(&self, tag: Option<&str>) -> bool {
        match (&self.to_tag, tag) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    fn forward(&mut self, response: &Response) {
        if let Some(tx) = &self.response_tx {
            if tx.send(response.clone()).is_err() {
                self.response_tx = None;
            }
        }
    }

    /// Classify a response against this transaction, learning tags and
    /// recording finals as a side effect. `None` means the response belongs
    /// to some other transaction (a forked dialog with a different tag).
    pub fn classify_response(
        &mut self,
        response: &Response,
        txn_method: Method,
    ) -> Option<Relationship> {
        if !self.to_tag_compatible(response.to_tag()) {
            return None;
        }

        if txn_method == Method::Invite && response.cseq.method == Method::Cancel {
            if self.cancel.is_some() {
                self.touch();
                self.forward(response);
                return Some(Relationship::CancelResponse);
            }
            return None;
        }

        self.touch();
        if response.status.is_provisional() {
            self.learn_to_tag(response.to_tag());
            let code = response.status.as_u16();
            if self.last_provisional == Some(code) {
                return Some(Relationship::Duplicate);
            }
            self.last_provisional = Some(code);
            self.retransmit_timer = None;
            self.forward(response);
            return Some(Relationship::Provisional);
        }

        self.learn_to_tag(response.to_tag());
        match &self.last_final {
            None => {
                self.last_final = Some(response.clone());
                self.retransmit_timer = None;
                self.forward(response);
                Some(Relationship::Final)
            }
            Some(prev) if prev.status == response.status => Some(Relationship::Duplicate),
            Some(_) => {
                // A different final after the first, e.g. 200 after 487 on
                // a fork. Keep the newest for duplicate suppression.
                self.last_final = Some(response.clone());
                self.forward(response);
                Some(Relationship::NewFinal)
            }
        }
    }

    /// Classify a request against this transaction. `None` means no match.
    pub fn classify_request(
        &mut self,
        request: &Request,
        txn_method: Method,
        direction: Direction,
    ) -> Option<Relationship> {
        if !self.to_tag_compatible(request.to_tag()) {
            return None;
        }

        if request.method == txn_method {
            self.touch();
            return Some(Relationship::Duplicate);
        }

        if txn_method != Method::Invite {
            return None;
        }

        match request.method {
            Method::Ack => {
                self.touch();
                match direction {
                    Direction::Incoming => {
                        if self.ack_seen {
                            return Some(Relationship::Duplicate);
                        }
                        self.ack_seen = true;
                        self.retransmit_timer = None;
                    }
                    Direction::Outgoing => {
                        // Our own ACK on its way out; keep it for replay
                        // when the far end retransmits the final.
                        self.ack = Some(request.clone());
                    }
                }
                let two_xx = self
                    .last_final
                    .as_ref()
                    .is_some_and(|f| f.status.is_success());
                if two_xx {
                    Some(Relationship::TwoXxAck)
                } else {
                    Some(Relationship::Ack)
                }
            }
            Method::Cancel => {
                self.touch();
                if self.cancel.is_some() {
                    return Some(Relationship::Duplicate);
                }
                self.cancel = Some(request.clone());
                Some(Relationship::Cancel)
            }
            _ => None,
        }
    }
}
