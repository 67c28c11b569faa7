//! Typed request and response messages.
//!
//! These carry the header content the call engine reads and writes, one
//! field per header. Construction is explicit; the derive-style helpers
//! (`Response::to_request`, `Request::ack_for`, `Request::cancel_for`)
//! encode the RFC 3261 copying rules so callers cannot get them wrong.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SipTypesError;
use crate::headers::{CSeq, EventKind, NameAddr, Party, ReferTo, Replaces, SubscriptionState, Via};
use crate::method::Method;
use crate::sdp::SessionDescription;
use crate::sipfrag::SipFrag;
use crate::status::StatusCode;
use crate::uri::Uri;

/// Default Max-Forwards for locally originated requests.
pub const DEFAULT_MAX_FORWARDS: u8 = 70;

/// Fresh globally unique Call-ID.
pub fn generate_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// Message body, already decoded to its typed form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Body {
    #[default]
    None,
    /// An offer or answer.
    Session(SessionDescription),
    /// Transfer progress fragment.
    Sipfrag(SipFrag),
    /// Anything else, carried opaquely (INFO payloads and the like).
    Opaque { content_type: String, data: Bytes },
}

impl Body {
    pub fn session(&self) -> Option<&SessionDescription> {
        match self {
            Body::Session(sdp) => Some(sdp),
            _ => None,
        }
    }

    pub fn sipfrag(&self) -> Option<&SipFrag> {
        match self {
            Body::Sipfrag(frag) => Some(frag),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Body::None)
    }
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    /// Request-URI the message is addressed to.
    pub uri: Uri,
    pub call_id: String,
    pub from: Party,
    pub to: Party,
    pub cseq: CSeq,
    /// Via entries, topmost first. Locally originated requests carry one.
    pub via: Vec<Via>,
    pub max_forwards: u8,
    pub contact: Option<NameAddr>,
    /// Route set to traverse, topmost first.
    pub routes: Vec<Uri>,
    /// Record-Route entries accumulated by proxies, topmost first.
    pub record_routes: Vec<Uri>,
    /// Refer-To values; a well-formed REFER carries exactly one.
    pub refer_to: Vec<ReferTo>,
    /// Referred-By values; a well-formed REFER carries exactly one.
    pub referred_by: Vec<NameAddr>,
    pub replaces: Option<Replaces>,
    pub event: Option<EventKind>,
    pub subscription_state: Option<SubscriptionState>,
    pub body: Body,
}

impl Request {
    /// New request with the dialog identity filled in and everything else
    /// at its defaults.
    pub fn new(
        method: Method,
        uri: Uri,
        call_id: impl Into<String>,
        from: Party,
        to: Party,
        cseq: u32,
    ) -> Self {
        Request {
            method,
            uri,
            call_id: call_id.into(),
            from,
            to,
            cseq: CSeq::new(cseq, method),
            via: Vec::new(),
            max_forwards: DEFAULT_MAX_FORWARDS,
            contact: None,
            routes: Vec::new(),
            record_routes: Vec::new(),
            refer_to: Vec::new(),
            referred_by: Vec::new(),
            replaces: None,
            event: None,
            subscription_state: None,
            body: Body::None,
        }
    }

    pub fn with_via(mut self, via: Via) -> Self {
        self.via.insert(0, via);
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_routes(mut self, routes: Vec<Uri>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_refer_to(mut self, refer_to: ReferTo) -> Self {
        self.refer_to.push(refer_to);
        self
    }

    pub fn with_referred_by(mut self, referred_by: NameAddr) -> Self {
        self.referred_by.push(referred_by);
        self
    }

    pub fn with_replaces(mut self, replaces: Replaces) -> Self {
        self.replaces = Some(replaces);
        self
    }

    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_subscription_state(mut self, state: SubscriptionState) -> Self {
        self.subscription_state = Some(state);
        self
    }

    pub fn with_max_forwards(mut self, max_forwards: u8) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    /// Topmost Via entry.
    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    /// Branch of the topmost Via entry.
    pub fn branch(&self) -> Option<&str> {
        self.top_via().map(|v| v.branch.as_str())
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag.as_deref()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag.as_deref()
    }

    /// True for an INVITE that creates a dialog rather than modifying one:
    /// no To tag yet.
    pub fn is_initial_invite(&self) -> bool {
        self.method == Method::Invite && self.to.tag.is_none()
    }

    /// ACK for a final response to this INVITE.
    ///
    /// The caller supplies the request-URI and branch because the rules
    /// differ by response class: a non-2xx ACK reuses the INVITE's branch
    /// and URI, a 2xx ACK gets a fresh branch and the remote target.
    pub fn ack_for(
        invite: &Request,
        response: &Response,
        request_uri: Uri,
        branch: impl Into<String>,
    ) -> Result<Request, SipTypesError> {
        if invite.method != Method::Invite {
            return Err(SipTypesError::WrongMethod {
                derived: "ACK",
                method: invite.method.as_str(),
            });
        }
        let sent_by = invite
            .top_via()
            .ok_or(SipTypesError::MissingVia)?
            .sent_by
            .clone();
        let mut ack = Request::new(
            Method::Ack,
            request_uri,
            invite.call_id.clone(),
            invite.from.clone(),
            response.to.clone(),
            invite.cseq.seq,
        );
        ack.via = vec![Via::new(sent_by, branch)];
        ack.routes = invite.routes.clone();
        ack.contact = invite.contact.clone();
        Ok(ack)
    }

    /// CANCEL for this pending INVITE: same identity, same branch, same
    /// sequence number under the CANCEL method.
    pub fn cancel_for(invite: &Request) -> Result<Request, SipTypesError> {
        if invite.method != Method::Invite {
            return Err(SipTypesError::WrongMethod {
                derived: "CANCEL",
                method: invite.method.as_str(),
            });
        }
        let via = invite.top_via().ok_or(SipTypesError::MissingVia)?.clone();
        let mut cancel = Request::new(
            Method::Cancel,
            invite.uri.clone(),
            invite.call_id.clone(),
            invite.from.clone(),
            invite.to.clone(),
            invite.cseq.seq,
        );
        cancel.via = vec![via];
        cancel.routes = invite.routes.clone();
        Ok(cancel)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (Call-ID {}, CSeq {})",
            self.method, self.uri, self.call_id, self.cseq
        )
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub call_id: String,
    pub from: Party,
    pub to: Party,
    pub cseq: CSeq,
    pub via: Vec<Via>,
    pub contact: Option<NameAddr>,
    pub record_routes: Vec<Uri>,
    /// Methods advertised in an Allow header, when present.
    pub allow: Vec<Method>,
    pub body: Body,
}

impl Response {
    /// Response derived from a request per the RFC 3261 copying rules:
    /// Call-ID, From, To, CSeq, Via and Record-Route all come from the
    /// request. The UAS adds its To tag separately.
    pub fn to_request(status: StatusCode, request: &Request) -> Self {
        Response {
            reason: status.reason_phrase().to_string(),
            status,
            call_id: request.call_id.clone(),
            from: request.from.clone(),
            to: request.to.clone(),
            cseq: request.cseq,
            via: request.via.clone(),
            contact: None,
            record_routes: request.record_routes.clone(),
            allow: Vec::new(),
            body: Body::None,
        }
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to.tag = Some(tag.into());
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_record_routes(mut self, record_routes: Vec<Uri>) -> Self {
        self.record_routes = record_routes;
        self
    }

    pub fn with_allow(mut self, allow: Vec<Method>) -> Self {
        self.allow = allow;
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn branch(&self) -> Option<&str> {
        self.top_via().map(|v| v.branch.as_str())
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag.as_deref()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag.as_deref()
    }

    /// Redirect target from the Contact header of a 3xx.
    pub fn redirect_target(&self) -> Option<&Uri> {
        self.contact.as_ref().map(|c| &c.uri)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (Call-ID {}, CSeq {})",
            self.status.as_u16(),
            self.reason,
            self.call_id,
            self.cseq
        )
    }
}

/// Either kind of message, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(req) => Some(req),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(resp) => Some(resp),
            Message::Request(_) => None,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            Message::Request(req) => &req.call_id,
            Message::Response(resp) => &resp.call_id,
        }
    }

    pub fn cseq(&self) -> CSeq {
        match self {
            Message::Request(req) => req.cseq,
            Message::Response(resp) => resp.cseq,
        }
    }

    pub fn from_tag(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.from_tag(),
            Message::Response(resp) => resp.from_tag(),
        }
    }

    pub fn to_tag(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.to_tag(),
            Message::Response(resp) => resp.to_tag(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.branch(),
            Message::Response(resp) => resp.branch(),
        }
    }

    pub fn body(&self) -> &Body {
        match self {
            Message::Request(req) => &req.body,
            Message::Response(resp) => &resp.body,
        }
    }

    /// Method of a request, or the method named in a response's CSeq.
    pub fn method(&self) -> Method {
        match self {
            Message::Request(req) => req.method,
            Message::Response(resp) => resp.cseq.method,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.as_response().map(|r| r.status)
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(req) => req.fmt(f),
            Message::Response(resp) => resp.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::BRANCH_MAGIC_COOKIE;

    fn invite() -> Request {
        let from = Party::new(NameAddr::new(Uri::sip("here.test").with_user("alice")))
            .with_tag("ftag1");
        let to = Party::new(NameAddr::new(Uri::sip("there.test").with_user("bob")));
        Request::new(
            Method::Invite,
            Uri::sip("there.test").with_user("bob"),
            "call-1",
            from,
            to,
            7,
        )
        .with_via(Via::new(
            "10.0.0.1:5060",
            format!("{BRANCH_MAGIC_COOKIE}-inv1"),
        ))
        .with_contact(NameAddr::new(
            Uri::sip("10.0.0.1").with_user("alice").with_port(5060),
        ))
    }

    #[test]
    fn response_copies_identity_from_request() {
        let req = invite();
        let resp = Response::to_request(StatusCode::Ringing, &req).with_to_tag("ttag1");
        assert_eq!(resp.call_id, "call-1");
        assert_eq!(resp.cseq, req.cseq);
        assert_eq!(resp.from, req.from);
        assert_eq!(resp.to_tag(), Some("ttag1"));
        assert_eq!(resp.branch(), req.branch());
        assert_eq!(resp.reason, "Ringing");
    }

    #[test]
    fn cancel_reuses_branch_and_sequence() {
        let req = invite();
        let cancel = Request::cancel_for(&req).unwrap();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.cseq.seq, req.cseq.seq);
        assert_eq!(cancel.cseq.method, Method::Cancel);
        assert_eq!(cancel.branch(), req.branch());
        assert_eq!(cancel.call_id, req.call_id);
    }

    #[test]
    fn cancel_requires_an_invite() {
        let req = invite();
        let bye = Request::new(
            Method::Bye,
            req.uri.clone(),
            req.call_id.clone(),
            req.from.clone(),
            req.to.clone(),
            8,
        );
        assert!(Request::cancel_for(&bye).is_err());
    }

    #[test]
    fn ack_takes_to_from_response() {
        let req = invite();
        let resp = Response::to_request(StatusCode::Ok, &req).with_to_tag("ttag9");
        let ack = Request::ack_for(
            &req,
            &resp,
            Uri::sip("there.test").with_user("bob"),
            format!("{BRANCH_MAGIC_COOKIE}-ack1"),
        )
        .unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.cseq.seq, req.cseq.seq);
        assert_eq!(ack.cseq.method, Method::Ack);
        assert_eq!(ack.to_tag(), Some("ttag9"));
        assert_ne!(ack.branch(), req.branch());
    }

    #[test]
    fn initial_invite_has_no_to_tag() {
        let req = invite();
        assert!(req.is_initial_invite());
        let mut in_dialog = req;
        in_dialog.to.tag = Some("ttag1".to_string());
        assert!(!in_dialog.is_initial_invite());
    }

    #[test]
    fn message_accessors_cover_both_kinds() {
        let req = invite();
        let resp = Response::to_request(StatusCode::Ok, &req);
        let req_msg = Message::from(req.clone());
        let resp_msg = Message::from(resp);
        assert_eq!(req_msg.method(), Method::Invite);
        assert_eq!(resp_msg.method(), Method::Invite);
        assert_eq!(resp_msg.status(), Some(StatusCode::Ok));
        assert_eq!(req_msg.call_id(), resp_msg.call_id());
    }
}
