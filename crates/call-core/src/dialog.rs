//! Dialog identity and in-dialog bookkeeping.
//!
//! A [`Dialog`] pins down one SIP dialog: Call-ID plus the two tagged
//! parties, the captured route set, the remote target learned from Contact,
//! and the highest remote CSeq seen. The hold and re-INVITE gates that
//! serialize mid-call offers live here as small state enums; the connection
//! drives them.

use ferrovox_sip_types::{Party, Request, Response, Uri};

/// Media hold progression for one dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    /// Two-way media.
    Talking,
    /// Hold re-INVITE in flight.
    Holding,
    /// Far end confirmed the hold.
    Held,
    /// Resume re-INVITE in flight.
    Unholding,
}

impl HoldState {
    pub fn is_held(self) -> bool {
        matches!(self, HoldState::Held)
    }

    /// A hold or resume offer is outstanding.
    pub fn in_transition(self) -> bool {
        matches!(self, HoldState::Holding | HoldState::Unholding)
    }
}

/// Guards against overlapping INVITE transactions on one dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinviteGate {
    /// No INVITE outstanding; either side may start one.
    AcceptInvite,
    /// We sent a re-INVITE and are waiting for its final response.
    Reinviting,
    /// We received a re-INVITE and owe the answer and its ACK.
    Reinvited,
}

impl ReinviteGate {
    pub fn is_open(self) -> bool {
        matches!(self, ReinviteGate::AcceptInvite)
    }
}

/// One established (or establishing) dialog.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    /// Local party, always tagged.
    pub local: Party,
    /// Remote party; tag filled in once learned.
    pub remote: Party,
    /// True when we sent the dialog-forming INVITE.
    pub initiated_locally: bool,
    /// Proxy hops for in-dialog requests, in traversal order.
    pub route_set: Vec<Uri>,
    /// Remote Contact; in-dialog requests go here when present.
    pub remote_target: Option<Uri>,
    /// Highest CSeq number seen from the far end.
    pub last_remote_seq: u32,
    route_set_captured: bool,
}

impl Dialog {
    /// Dialog for a call we originate. The remote tag arrives with the
    /// first tagged response.
    pub fn initiated(call_id: String, local: Party, remote: Party) -> Self {
        Dialog {
            call_id,
            local,
            remote,
            initiated_locally: true,
            route_set: Vec::new(),
            remote_target: None,
            last_remote_seq: 0,
            route_set_captured: false,
        }
    }

    /// Dialog formed by an inbound dialog-forming request. The route set is
    /// the request's Record-Route in received order and the remote target
    /// its Contact.
    pub fn received(request: &Request, local_tag: impl Into<String>) -> Self {
        Dialog {
            call_id: request.call_id.clone(),
            local: request.to.clone().with_tag(local_tag),
            remote: request.from.clone(),
            initiated_locally: false,
            route_set: request.record_routes.clone(),
            remote_target: request.contact.as_ref().map(|c| c.uri.clone()),
            last_remote_seq: request.cseq.seq,
            route_set_captured: !request.record_routes.is_empty(),
        }
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.local.tag.as_deref()
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote.tag.as_deref()
    }

    /// Fold a response from the far end into the dialog: learn the remote
    /// tag, capture the route set (reversed, since we initiated), and track
    /// the Contact.
    pub fn absorb_response(&mut self, response: &Response) {
        if self.remote.tag.is_none() {
            if let Some(tag) = response.to.tag.clone() {
                self.remote.tag = Some(tag);
            }
        }
        if !self.route_set_captured && !response.record_routes.is_empty() {
            let mut routes = response.record_routes.clone();
            routes.reverse();
            self.route_set = routes;
            self.route_set_captured = true;
        }
        if let Some(contact) = &response.contact {
            self.remote_target = Some(contact.uri.clone());
        }
    }

    /// Fold an in-dialog request from the far end into the dialog.
    pub fn absorb_request(&mut self, request: &Request) {
        if self.remote.tag.is_none() {
            if let Some(tag) = request.from.tag.clone() {
                self.remote.tag = Some(tag);
            }
        }
        if request.cseq.seq > self.last_remote_seq {
            self.last_remote_seq = request.cseq.seq;
        }
        if let Some(contact) = &request.contact {
            self.remote_target = Some(contact.uri.clone());
        }
    }

    /// A request numbered below the highest we have seen arrived out of
    /// order and must be rejected.
    pub fn is_out_of_order(&self, seq: u32) -> bool {
        seq < self.last_remote_seq
    }

    /// Where in-dialog requests are addressed.
    pub fn request_target(&self) -> Uri {
        self.remote_target
            .clone()
            .unwrap_or_else(|| self.remote.addr.uri.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrovox_sip_types::{CSeq, Method, NameAddr, StatusCode};

    fn addr(user: &str, host: &str) -> Uri {
        Uri::sip(host).with_user(user)
    }

    fn inbound_invite() -> Request {
        let mut request = Request::new(
            Method::Invite,
            addr("bob", "b.test"),
            "dlg-1".to_string(),
            Party::new(addr("alice", "a.test")).with_tag("from-tag"),
            Party::new(addr("bob", "b.test")),
            4,
        );
        request.record_routes = vec![Uri::sip("p1.test"), Uri::sip("p2.test")];
        request.contact = Some(NameAddr::new(addr("alice", "10.0.0.1")));
        request
    }

    #[test]
    fn received_dialog_takes_routes_in_order() {
        let dialog = Dialog::received(&inbound_invite(), "local-tag");
        assert_eq!(dialog.local_tag(), Some("local-tag"));
        assert_eq!(dialog.remote_tag(), Some("from-tag"));
        assert_eq!(dialog.route_set[0].host, "p1.test");
        assert_eq!(dialog.last_remote_seq, 4);
        assert_eq!(dialog.request_target().host, "10.0.0.1");
    }

    #[test]
    fn initiator_reverses_recorded_routes() {
        let mut dialog = Dialog::initiated(
            "dlg-2".to_string(),
            Party::new(addr("alice", "a.test")).with_tag("lt"),
            Party::new(addr("bob", "b.test")),
        );
        let invite = Request::new(
            Method::Invite,
            addr("bob", "b.test"),
            "dlg-2".to_string(),
            dialog.local.clone(),
            dialog.remote.clone(),
            1,
        );
        let mut ok = Response::to_request(StatusCode::Ok, &invite).with_to_tag("rt");
        ok.record_routes = vec![Uri::sip("p1.test"), Uri::sip("p2.test")];
        ok.contact = Some(NameAddr::new(addr("bob", "10.0.0.2")));

        dialog.absorb_response(&ok);
        assert_eq!(dialog.remote_tag(), Some("rt"));
        assert_eq!(dialog.route_set[0].host, "p2.test");
        assert_eq!(dialog.request_target().host, "10.0.0.2");
    }

    #[test]
    fn route_set_captured_once() {
        let mut dialog = Dialog::initiated(
            "dlg-3".to_string(),
            Party::new(addr("alice", "a.test")).with_tag("lt"),
            Party::new(addr("bob", "b.test")),
        );
        let invite = Request::new(
            Method::Invite,
            addr("bob", "b.test"),
            "dlg-3".to_string(),
            dialog.local.clone(),
            dialog.remote.clone(),
            1,
        );
        let mut ringing = Response::to_request(StatusCode::Ringing, &invite).with_to_tag("rt");
        ringing.record_routes = vec![Uri::sip("early.test")];
        dialog.absorb_response(&ringing);

        let mut ok = Response::to_request(StatusCode::Ok, &invite).with_to_tag("rt");
        ok.record_routes = vec![Uri::sip("late.test")];
        dialog.absorb_response(&ok);

        assert_eq!(dialog.route_set.len(), 1);
        assert_eq!(dialog.route_set[0].host, "early.test");
    }

    #[test]
    fn out_of_order_detection_tracks_highest_seq() {
        let mut dialog = Dialog::received(&inbound_invite(), "lt");
        let mut refresh = inbound_invite();
        refresh.cseq = CSeq::new(6, Method::Invite);
        dialog.absorb_request(&refresh);
        assert!(dialog.is_out_of_order(5));
        assert!(!dialog.is_out_of_order(6));
        assert!(!dialog.is_out_of_order(7));
    }

    #[test]
    fn hold_state_transitions_flag_motion() {
        assert!(HoldState::Holding.in_transition());
        assert!(HoldState::Unholding.in_transition());
        assert!(!HoldState::Held.in_transition());
        assert!(HoldState::Held.is_held());
        assert!(ReinviteGate::AcceptInvite.is_open());
        assert!(!ReinviteGate::Reinviting.is_open());
    }
}
