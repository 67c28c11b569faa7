//! Shared fixtures for the engine integration tests.
//!
//! Every test drives a real [`CallEngine`] over channel-backed fakes: a
//! transport that hands outbound messages to the test, a media backend that
//! records what the engine asks of it, and a seeded random source so tags
//! and branches are reproducible. The far endpoint is played by the test
//! itself, feeding requests and responses through the transport channel
//! exactly as the network would.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ferrovox_call_core::{
    event_channel, CallEngine, CallEngineConfig, CallEvent, CallEventKind, ConnectionId,
    MediaCapabilities, MediaConnectionId, MediaDestination, MediaError, MediaSession,
    MediaTransportOptions, MessageStatus, SipEvent, SipTransport, SmallRngSource, TransportError,
};
use ferrovox_sip_types::{
    Body, Codec, EventKind, Message, Method, NameAddr, Party, Request, Response,
    SessionDescription, SipFrag, StatusCode, SubscriptionState, Uri, Via, BRANCH_MAGIC_COOKIE,
};

/// Transport fake: outbound messages land on a channel the test reads.
#[derive(Debug)]
pub struct WireTransport {
    tx: mpsc::UnboundedSender<Message>,
    broken: AtomicBool,
}

impl WireTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WireTransport {
            tx,
            broken: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Make every send from now on fail.
    pub fn break_wire(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SipTransport for WireTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                reason: "wire down".to_string(),
            });
        }
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

/// Media fake that records destinations, flow state and releases.
#[derive(Debug, Default)]
pub struct ScriptedMedia {
    next_id: AtomicU64,
    pub fail_create: AtomicBool,
    pub sending: AtomicBool,
    pub receiving: AtomicBool,
    pub destinations: Mutex<Vec<MediaDestination>>,
    pub deleted: Mutex<Vec<MediaConnectionId>>,
}

impl ScriptedMedia {
    pub fn last_destination(&self) -> Option<MediaDestination> {
        self.destinations.lock().unwrap().last().cloned()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaSession for ScriptedMedia {
    async fn create_connection(
        &self,
        _local_address: &str,
        _options: MediaTransportOptions,
    ) -> Result<MediaConnectionId, MediaError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MediaError::ConnectionFailed {
                reason: "no ports left".to_string(),
            });
        }
        let raw = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MediaConnectionId::from_raw(raw))
    }

    async fn capabilities(
        &self,
        _id: MediaConnectionId,
        _max_candidates: usize,
    ) -> Result<MediaCapabilities, MediaError> {
        Ok(MediaCapabilities {
            addresses: vec!["192.0.2.10".to_string()],
            rtp_ports: vec![41000],
            rtcp_ports: vec![41001],
            video_ports: Vec::new(),
            codecs: test_codecs(),
            srtp: None,
            bandwidth_kbps: 64,
            framerate: 0,
        })
    }

    async fn start_rtp_send(
        &self,
        _id: MediaConnectionId,
        _codecs: &[Codec],
    ) -> Result<(), MediaError> {
        self.sending.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_rtp_receive(
        &self,
        _id: MediaConnectionId,
        _codecs: &[Codec],
    ) -> Result<(), MediaError> {
        self.receiving.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_rtp_send(&self, _id: MediaConnectionId) -> Result<(), MediaError> {
        self.sending.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_rtp_receive(&self, _id: MediaConnectionId) -> Result<(), MediaError> {
        self.receiving.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_destination(
        &self,
        _id: MediaConnectionId,
        destination: MediaDestination,
    ) -> Result<(), MediaError> {
        self.destinations.lock().unwrap().push(destination);
        Ok(())
    }

    async fn delete_connection(&self, id: MediaConnectionId) -> Result<(), MediaError> {
        self.deleted.lock().unwrap().push(id);
        Ok(())
    }
}

/// One engine wired to the fakes, with both ends of every channel.
pub struct TestCall {
    pub engine: Arc<CallEngine>,
    pub events: mpsc::Receiver<CallEvent>,
    pub net: mpsc::Sender<SipEvent>,
    pub wire: mpsc::UnboundedReceiver<Message>,
    pub media: Arc<ScriptedMedia>,
    pub transport: Arc<WireTransport>,
}

pub fn default_config() -> CallEngineConfig {
    CallEngineConfig::new(
        Uri::sip("alice.test").with_user("alice"),
        Uri::sip("192.0.2.10").with_user("alice").with_port(5060),
    )
}

impl TestCall {
    pub async fn start() -> Self {
        Self::start_with(default_config()).await
    }

    pub async fn start_with(config: CallEngineConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();

        let (transport, wire) = WireTransport::new();
        let media = Arc::new(ScriptedMedia::default());
        let random = Arc::new(SmallRngSource::seeded(7));
        let (engine, events) = CallEngine::new(config, transport.clone(), media.clone(), random)
            .expect("engine construction failed");
        let (net, net_rx) = event_channel(64);
        tokio::spawn(Arc::clone(&engine).run(net_rx));

        TestCall {
            engine,
            events,
            net,
            wire,
            media,
            transport,
        }
    }

    /// Deliver a message to the engine as inbound network traffic.
    pub async fn feed(&self, message: impl Into<Message>) {
        self.net
            .send(SipEvent::inbound(message))
            .await
            .expect("engine loop is gone");
    }

    /// Deliver a transport report for a message the engine sent.
    pub async fn feed_report(&self, message: impl Into<Message>, status: MessageStatus) {
        self.net
            .send(SipEvent::report(message, status))
            .await
            .expect("engine loop is gone");
    }

    /// Next message the engine put on the wire.
    pub async fn next_wire(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.wire.recv())
            .await
            .expect("engine wrote nothing to the wire")
            .expect("wire closed")
    }

    /// Assert the wire stays quiet for `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        match tokio::time::timeout(window, self.wire.recv()).await {
            Err(_) => {}
            Ok(Some(message)) => panic!("unexpected wire traffic: {message:?}"),
            Ok(None) => panic!("wire closed"),
        }
    }

    pub async fn next_event(&mut self) -> CallEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("no lifecycle event arrived")
            .expect("event channel closed")
    }

    /// Read events until one of `kind` arrives.
    pub async fn wait_for(&mut self, kind: CallEventKind) -> CallEvent {
        loop {
            let event = self.next_event().await;
            if event.kind == kind {
                return event;
            }
        }
    }

    /// Dial, ring and answer, leaving one established outbound leg.
    /// Returns the connection id and the INVITE as it went out.
    pub async fn establish_outbound(&mut self) -> (ConnectionId, Request) {
        let id = self
            .engine
            .dial(Uri::sip("b.test").with_user("bob"))
            .await
            .expect("dial failed");
        let invite = as_request(self.next_wire().await, Method::Invite);
        self.feed(ringing_for(&invite)).await;
        self.feed(answer_for(&invite, audio_answer(20000))).await;
        let _ack = as_request(self.next_wire().await, Method::Ack);
        self.wait_for(CallEventKind::Connected).await;
        (id, invite)
    }
}

/// Unwrap an outbound request, checking its method.
pub fn as_request(message: Message, method: Method) -> Request {
    match message {
        Message::Request(request) => {
            assert_eq!(request.method, method, "unexpected request on the wire");
            request
        }
        Message::Response(response) => {
            panic!("expected {method} on the wire, got response {}", response.status)
        }
    }
}

/// Unwrap an outbound response, checking its status.
pub fn as_response(message: Message, status: StatusCode) -> Response {
    match message {
        Message::Response(response) => {
            assert_eq!(response.status, status, "unexpected response on the wire");
            response
        }
        Message::Request(request) => {
            panic!("expected {status} on the wire, got request {}", request.method)
        }
    }
}

pub fn test_codecs() -> Vec<Codec> {
    vec![Codec::new("PCMU", 8000, 0), Codec::new("PCMA", 8000, 8)]
}

/// Session description the fake far endpoint offers and answers with.
pub fn audio_answer(port: u16) -> SessionDescription {
    SessionDescription {
        addresses: vec!["198.51.100.7".to_string()],
        rtp_ports: vec![port],
        rtcp_ports: vec![port + 1],
        video_ports: Vec::new(),
        codecs: test_codecs(),
        srtp: None,
        bandwidth_kbps: 64,
        framerate: 0,
    }
}

/// Hold variant of the far endpoint's description.
pub fn hold_answer() -> SessionDescription {
    audio_answer(20000).to_hold()
}

pub fn bob_uri() -> Uri {
    Uri::sip("b.test").with_user("bob")
}

pub fn bob_contact() -> NameAddr {
    NameAddr::new(Uri::sip("198.51.100.7").with_user("bob").with_port(5060))
}

pub fn bob_via(branch_tail: &str) -> Via {
    Via::new("198.51.100.7:5060", format!("{BRANCH_MAGIC_COOKIE}{branch_tail}"))
}

/// Dialog-forming INVITE from the fake far endpoint toward the engine.
pub fn inbound_invite(call_id: &str) -> Request {
    Request::new(
        Method::Invite,
        Uri::sip("192.0.2.10").with_user("alice").with_port(5060),
        call_id,
        Party::new(bob_uri()).with_tag("bob-tag"),
        Party::new(Uri::sip("alice.test").with_user("alice")),
        1,
    )
    .with_via(bob_via("inv1"))
    .with_contact(bob_contact())
    .with_body(Body::Session(audio_answer(20000)))
}

/// 180 for an INVITE the engine sent, tagging the callee side.
pub fn ringing_for(invite: &Request) -> Response {
    Response::to_request(StatusCode::Ringing, invite).with_to_tag("bob-tag")
}

/// 200 with an answer for an INVITE the engine sent.
pub fn answer_for(invite: &Request, answer: SessionDescription) -> Response {
    Response::to_request(StatusCode::Ok, invite)
        .with_to_tag("bob-tag")
        .with_contact(bob_contact())
        .with_body(Body::Session(answer))
}

/// Bare final for an INVITE the engine sent.
pub fn reply(status: StatusCode, request: &Request) -> Response {
    Response::to_request(status, request).with_to_tag("bob-tag")
}

/// In-dialog request from the far end of an outbound call, its identity
/// derived from the INVITE the engine sent.
pub fn remote_request(method: Method, invite: &Request, seq: u32, branch_tail: &str) -> Request {
    let caller_tag = invite.from.tag.clone().expect("caller tag missing");
    let contact = invite.contact.as_ref().expect("caller contact missing");
    Request::new(
        method,
        contact.uri.clone(),
        invite.call_id.clone(),
        Party::new(bob_uri()).with_tag("bob-tag"),
        Party::new(invite.from.addr.clone()).with_tag(caller_tag),
        seq,
    )
    .with_via(bob_via(branch_tail))
    .with_contact(bob_contact())
}

/// In-dialog request from the original caller of an inbound call, built
/// from its INVITE and the 200 that answered it.
pub fn caller_request(
    method: Method,
    invite: &Request,
    ok: &Response,
    seq: u32,
    branch_tail: &str,
) -> Request {
    let contact = ok.contact.as_ref().expect("callee contact missing");
    let mut request = Request::new(
        method,
        contact.uri.clone(),
        invite.call_id.clone(),
        invite.from.clone(),
        ok.to.clone(),
        seq,
    )
    .with_via(bob_via(branch_tail));
    request.contact = invite.contact.clone();
    request
}

/// Transfer-progress NOTIFY from the transferee back to the engine.
pub fn transfer_notify(
    invite: &Request,
    seq: u32,
    status: StatusCode,
    branch_tail: &str,
) -> Request {
    let state = if status.is_final() {
        SubscriptionState::Terminated
    } else {
        SubscriptionState::Active
    };
    remote_request(Method::Notify, invite, seq, branch_tail)
        .with_event(EventKind::Refer)
        .with_subscription_state(state)
        .with_body(Body::Sipfrag(SipFrag::from_status(status)))
}
