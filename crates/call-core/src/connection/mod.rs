//! The per-leg connection object.
//!
//! One [`Connection`] drives one call leg through its whole life: offer and
//! answer, ringing, hold and resume, transfer, teardown. The engine keeps
//! each connection behind its own async mutex and dispatches exactly one
//! message or API call at a time into it, so everything here takes `&mut
//! self` and never synchronizes internally.
//!
//! The implementation is split by concern: local API operations here,
//! inbound request handling in `invite`, response handling in `response`,
//! teardown paths in `teardown`, and the transfer flows in the crate-level
//! `transfer` module.

mod invite;
mod response;
mod state;
mod teardown;

pub use state::ConnectionState;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ferrovox_sip_types::{
    generate_call_id, Body, Message, Method, NameAddr, Party, Replaces, Request, Response,
    SessionDescription, StatusCode, Uri, Via,
};

use crate::config::CallEngineConfig;
use crate::cseq::{CSeqCategory, CSeqManager};
use crate::dialog::{Dialog, HoldState, ReinviteGate};
use crate::engine::EngineMsg;
use crate::errors::{CallError, Result};
use crate::events::{CallEvent, CallEventKind, CauseCode, EventEmitter};
use crate::media::{
    CodecSelection, MediaCapabilities, MediaConnectionId, MediaSession, MediaTransportOptions,
};
use crate::timer::{schedule, TimerHandle};
use crate::transaction::{Direction, TransactionKind, TransactionTable};
use crate::transfer::{HoldCompleteAction, TransferRole};
use crate::transport::SipTransport;
use crate::util::RandomSource;

/// Handle for one call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(raw: u64) -> Self {
        ConnectionId(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Collaborators every connection shares with the engine.
///
/// The internal queue is unbounded: the engine task both produces to it
/// while holding a connection lock and is its only consumer, so a bounded
/// queue could wedge the loop against itself.
#[derive(Debug, Clone)]
pub(crate) struct CallContext {
    pub config: Arc<CallEngineConfig>,
    pub transport: Arc<dyn SipTransport>,
    pub media: Arc<dyn MediaSession>,
    pub table: Arc<TransactionTable>,
    pub random: Arc<dyn RandomSource>,
    pub events: mpsc::Sender<CallEvent>,
    pub internal: mpsc::UnboundedSender<EngineMsg>,
}

/// One call leg and everything it owns.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    ctx: CallContext,
    events: EventEmitter,
    pub(crate) dialog: Dialog,
    state: ConnectionState,
    cause: CauseCode,
    pub(crate) hold_state: HoldState,
    pub(crate) reinvite_gate: ReinviteGate,
    /// The current offer/answer INVITE, exclusively owned. Replacing it
    /// drops the previous one.
    pub(crate) pending_invite: Option<Request>,
    pub(crate) cseq: CSeqManager,
    pub(crate) media_connection: Option<MediaConnectionId>,
    pub(crate) local_caps: Option<MediaCapabilities>,
    pub(crate) selected: CodecSelection,
    /// CANCEL sent; a 200 for the INVITE arriving now is a late success.
    pub(crate) cancelling: bool,
    /// Why the CANCEL went out, reported when the 487 lands.
    pub(crate) cancel_cause: CauseCode,
    pub(crate) hold_action: HoldCompleteAction,
    pub(crate) transfer: Option<TransferRole>,
    /// Referred-By identity to attach to the initial INVITE of a
    /// transfer-consult leg.
    pub(crate) referred_by: Option<NameAddr>,
    /// Replaces header for the initial INVITE of an attended-transfer leg.
    pub(crate) outgoing_replaces: Option<Replaces>,
    /// Leg this inbound INVITE replaces, resolved by the engine.
    pub(crate) replaces_of: Option<ConnectionId>,
    pub(crate) redirect_count: u32,
    pub(crate) offering_timer: Option<TimerHandle>,
    pub(crate) ring_timer: Option<TimerHandle>,
    pub(crate) cancel_safety_timer: Option<TimerHandle>,
    pub(crate) reinvite_retry_timer: Option<TimerHandle>,
    pub(crate) drop_timer: Option<TimerHandle>,
}

impl Connection {
    /// Leg for a call we will originate toward `remote`.
    pub(crate) fn new_outbound(
        id: ConnectionId,
        call_index: u64,
        ctx: CallContext,
        remote: Uri,
    ) -> Self {
        let local_tag = ctx.random.dialog_tag(call_index);
        let local = Party::new(Self::local_name_addr(&ctx.config)).with_tag(local_tag);
        let dialog = Dialog::initiated(generate_call_id(), local, Party::new(remote));
        Self::with_dialog(id, ctx, dialog)
    }

    /// Leg for an inbound dialog-forming INVITE.
    pub(crate) fn new_inbound(
        id: ConnectionId,
        call_index: u64,
        ctx: CallContext,
        invite: &Request,
    ) -> Self {
        let local_tag = ctx.random.dialog_tag(call_index);
        let dialog = Dialog::received(invite, local_tag);
        Self::with_dialog(id, ctx, dialog)
    }

    fn with_dialog(id: ConnectionId, ctx: CallContext, dialog: Dialog) -> Self {
        let events = EventEmitter::new(id, ctx.events.clone());
        Connection {
            id,
            ctx,
            events,
            dialog,
            state: ConnectionState::Idle,
            cause: CauseCode::Normal,
            hold_state: HoldState::Talking,
            reinvite_gate: ReinviteGate::AcceptInvite,
            pending_invite: None,
            cseq: CSeqManager::new(),
            media_connection: None,
            local_caps: None,
            selected: CodecSelection::default(),
            cancelling: false,
            cancel_cause: CauseCode::Cancelled,
            hold_action: HoldCompleteAction::None,
            transfer: None,
            referred_by: None,
            outgoing_replaces: None,
            replaces_of: None,
            redirect_count: 0,
            offering_timer: None,
            ring_timer: None,
            cancel_safety_timer: None,
            reinvite_retry_timer: None,
            drop_timer: None,
        }
    }

    fn local_name_addr(config: &CallEngineConfig) -> NameAddr {
        let mut addr = NameAddr::new(config.local_uri.clone());
        if let Some(name) = &config.display_name {
            addr = addr.with_display_name(name.clone());
        }
        addr
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cause(&self) -> CauseCode {
        self.cause
    }

    pub fn hold_state(&self) -> HoldState {
        self.hold_state
    }

    pub fn reinvite_gate(&self) -> ReinviteGate {
        self.reinvite_gate
    }

    pub fn call_id(&self) -> &str {
        &self.dialog.call_id
    }

    pub fn remote(&self) -> &Party {
        &self.dialog.remote
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    /// Does this inbound request belong to our dialog? Same Call-ID, and
    /// the tags line up with what the dialog has learned so far; a tag the
    /// dialog has not learned yet matches anything.
    pub(crate) fn dialog_matches(&self, request: &Request) -> bool {
        if request.call_id != self.dialog.call_id {
            return false;
        }
        let from_ok = match (self.dialog.remote_tag(), request.from_tag()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        };
        let to_ok = match (request.to_tag(), self.dialog.local_tag()) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => true,
        };
        from_ok && to_ok
    }

    /// Does this message we sent ourselves belong to our dialog? Our own
    /// tag sits in From on requests and To on responses.
    pub(crate) fn owns_message(&self, message: &Message) -> bool {
        if message.call_id() != self.dialog.call_id {
            return false;
        }
        match message {
            Message::Request(request) => request.from_tag() == self.dialog.local_tag(),
            Message::Response(response) => response.to_tag() == self.dialog.local_tag(),
        }
    }

    // ---- local API operations -------------------------------------------

    /// Originate the call: create media, build the offer, send the INVITE.
    pub async fn dial(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(self.invalid_state("dial"));
        }
        self.events.emit(CallEventKind::DialTone, CauseCode::Normal);

        let (media_id, caps) = match self.ensure_media().await {
            Ok(pair) => pair,
            Err(err) => {
                self.report_transfer_progress(StatusCode::ServiceUnavailable);
                self.fail(CauseCode::ResourceLimit).await;
                return Err(err);
            }
        };
        let offer = caps.to_offer(self.ctx.config.max_address_candidates);
        let Some(seq) = self.cseq.start_transaction(CSeqCategory::Invite) else {
            return Err(self.invalid_state("dial"));
        };

        let mut invite = Request::new(
            Method::Invite,
            self.dialog.remote.uri().clone(),
            self.dialog.call_id.clone(),
            self.dialog.local.clone(),
            Party::new(self.dialog.remote.addr.clone()),
            seq,
        )
        .with_via(self.new_via())
        .with_contact(self.local_contact())
        .with_body(Body::Session(offer.clone()));
        invite.referred_by = self.referred_by.iter().cloned().collect();
        invite.replaces = self.outgoing_replaces.clone();
        self.pending_invite = Some(invite.clone());

        match self.register_and_send(invite).await {
            Ok(()) => {
                // Prime receive so early media can flow before the answer.
                if let Err(err) = self
                    .ctx
                    .media
                    .start_rtp_receive(media_id, &offer.codecs)
                    .await
                {
                    warn!(connection = %self.id, "early media receive failed: {err}");
                }
                self.set_state(ConnectionState::Offering, CauseCode::Normal);
                self.events.emit_with_remote(
                    CallEventKind::RemoteOffering,
                    CauseCode::Normal,
                    self.dialog.remote.clone(),
                );
                Ok(())
            }
            Err(err) => {
                self.cseq.end_transaction(CSeqCategory::Invite);
                self.report_transfer_progress(StatusCode::ServiceUnavailable);
                self.fail(CauseCode::DestNotObtainable).await;
                Err(err)
            }
        }
    }

    /// Indicate ringing to the caller; optionally with an early-media
    /// answer in a 183.
    pub async fn accept(&mut self, early_media: bool) -> Result<()> {
        if self.state != ConnectionState::Offering || self.dialog.initiated_locally {
            return Err(self.invalid_state("accept"));
        }
        let invite = self
            .pending_invite
            .clone()
            .ok_or_else(|| self.invalid_state("accept"))?;
        self.offering_timer = None;

        let (status, body) = if early_media {
            let answer = self.negotiated_answer(&invite)?;
            (StatusCode::SessionProgress, Body::Session(answer))
        } else {
            (StatusCode::Ringing, Body::None)
        };
        self.respond(status, &invite, body, true).await?;
        self.set_state(ConnectionState::Alerting, CauseCode::Normal);
        self.events.emit(CallEventKind::Alerting, CauseCode::Normal);
        Ok(())
    }

    /// Answer the call with a final SDP answer and start media.
    pub async fn answer(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            ConnectionState::Offering | ConnectionState::Alerting
        ) || self.dialog.initiated_locally
        {
            return Err(self.invalid_state("answer"));
        }
        let invite = self
            .pending_invite
            .clone()
            .ok_or_else(|| self.invalid_state("answer"))?;
        self.offering_timer = None;

        let answer = match self.check_inbound_offer(&invite).await {
            Ok(answer) => answer,
            Err(err) => return Err(err),
        };
        let remote_hold = invite
            .body
            .session()
            .is_some_and(SessionDescription::is_hold);

        self.respond(StatusCode::Ok, &invite, Body::Session(answer), true)
            .await?;
        self.set_state(ConnectionState::Established, CauseCode::Normal);
        self.events
            .emit(CallEventKind::Connected, CauseCode::Normal);

        if remote_hold {
            self.hold_state = HoldState::Held;
            self.events
                .emit(CallEventKind::RemoteHeld, CauseCode::Normal);
            self.start_receive_only().await;
        } else if let Some(offer) = invite.body.session() {
            self.start_full_media(offer).await;
        }

        if let Some(replaced) = self.replaces_of.take() {
            let _ = self.ctx.internal.send(EngineMsg::HangupConnection(replaced));
        }
        Ok(())
    }

    /// Refuse the call. Defaults to 486; an INVITE that carried Replaces
    /// is refused with 487.
    pub async fn reject(&mut self, status: Option<StatusCode>) -> Result<()> {
        if !matches!(
            self.state,
            ConnectionState::Offering | ConnectionState::Alerting
        ) || self.dialog.initiated_locally
        {
            return Err(self.invalid_state("reject"));
        }
        let invite = self
            .pending_invite
            .clone()
            .ok_or_else(|| self.invalid_state("reject"))?;
        let status = status.unwrap_or(if invite.replaces.is_some() {
            StatusCode::RequestTerminated
        } else {
            StatusCode::BusyHere
        });

        self.respond(status, &invite, Body::None, false).await?;
        let cause = CauseCode::from_failure_status(status);
        self.fail(cause).await;
        Ok(())
    }

    /// Deflect the caller to another target with a 302.
    pub async fn redirect(&mut self, target: Uri) -> Result<()> {
        if !matches!(
            self.state,
            ConnectionState::Offering | ConnectionState::Alerting
        ) || self.dialog.initiated_locally
        {
            return Err(self.invalid_state("redirect"));
        }
        let invite = self
            .pending_invite
            .clone()
            .ok_or_else(|| self.invalid_state("redirect"))?;

        let mut response = self.build_response(StatusCode::MovedTemporarily, &invite, true);
        response.contact = Some(NameAddr::new(target));
        self.record_and_send_response(response).await?;
        self.disconnect(CauseCode::Redirected).await;
        Ok(())
    }

    /// Suspend media with a null-address re-INVITE.
    pub async fn hold(&mut self) -> Result<()> {
        if self.state != ConnectionState::Established || self.hold_state != HoldState::Talking {
            return Err(self.invalid_state("hold"));
        }
        let caps = self
            .local_caps
            .clone()
            .ok_or_else(|| self.invalid_state("hold"))?;
        let sdp = caps
            .to_offer(self.ctx.config.max_address_candidates)
            .to_hold();
        self.send_reinvite(sdp).await?;
        self.hold_state = HoldState::Holding;
        Ok(())
    }

    /// Resume media with a full re-INVITE.
    pub async fn off_hold(&mut self) -> Result<()> {
        if self.state != ConnectionState::Established || self.hold_state != HoldState::Held {
            return Err(self.invalid_state("off_hold"));
        }
        let caps = self
            .local_caps
            .clone()
            .ok_or_else(|| self.invalid_state("off_hold"))?;
        let sdp = caps.to_offer(self.ctx.config.max_address_candidates);
        self.send_reinvite(sdp).await?;
        self.hold_state = HoldState::Unholding;
        Ok(())
    }

    /// Send an in-dialog INFO with an opaque payload.
    pub async fn send_info(
        &mut self,
        content_type: impl Into<String>,
        data: bytes::Bytes,
    ) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Err(self.invalid_state("send_info"));
        }
        let Some(seq) = self.cseq.start_transaction(CSeqCategory::Info) else {
            return Err(self.invalid_state("send_info"));
        };
        let info = self
            .build_in_dialog_request(Method::Info, seq)
            .with_body(Body::Opaque {
                content_type: content_type.into(),
                data,
            });
        if let Err(err) = self.register_and_send(info).await {
            // Undeliverable in-dialog request: end the leg, as with BYE.
            self.cseq.end_transaction(CSeqCategory::Info);
            self.disconnect(CauseCode::Normal).await;
            return Err(err);
        }
        Ok(())
    }

    /// Session refresh: re-offer the current description to keep the
    /// session alive. Skipped while any offer/answer round is in motion.
    pub(crate) async fn refresh_session(&mut self) {
        if self.state != ConnectionState::Established
            || !self.reinvite_gate.is_open()
            || self.hold_state != HoldState::Talking
        {
            return;
        }
        let Some(caps) = self.local_caps.clone() else {
            return;
        };
        let sdp = caps.to_offer(self.ctx.config.max_address_candidates);
        if let Err(err) = self.send_reinvite(sdp).await {
            debug!(connection = %self.id, "session refresh not sent: {err}");
        }
    }

    // ---- construction and sending helpers --------------------------------

    /// Build and send a re-INVITE carrying `sdp`, replacing the pending
    /// INVITE slot and closing the gate.
    pub(crate) async fn send_reinvite(&mut self, sdp: SessionDescription) -> Result<()> {
        if !self.reinvite_gate.is_open() {
            return Err(self.invalid_state("re-invite"));
        }
        let Some(seq) = self.cseq.start_transaction(CSeqCategory::Invite) else {
            return Err(self.invalid_state("re-invite"));
        };
        let reinvite = self
            .build_in_dialog_request(Method::Invite, seq)
            .with_body(Body::Session(sdp));
        self.pending_invite = Some(reinvite.clone());
        self.reinvite_gate = ReinviteGate::Reinviting;

        if let Err(err) = self.register_and_send(reinvite).await {
            self.reinvite_gate = ReinviteGate::AcceptInvite;
            self.cseq.end_transaction(CSeqCategory::Invite);
            return Err(err);
        }
        Ok(())
    }

    /// In-dialog request addressed per the captured route set and remote
    /// target.
    pub(crate) fn build_in_dialog_request(&self, method: Method, seq: u32) -> Request {
        let mut request = Request::new(
            method,
            self.dialog.request_target(),
            self.dialog.call_id.clone(),
            self.dialog.local.clone(),
            self.dialog.remote.clone(),
            seq,
        )
        .with_via(self.new_via())
        .with_contact(self.local_contact());
        request.routes = self.dialog.route_set.clone();
        request
    }

    pub(crate) fn new_via(&self) -> Via {
        Via::new(self.sent_by(), self.ctx.random.branch())
    }

    fn sent_by(&self) -> String {
        let contact = &self.ctx.config.local_contact;
        match contact.port {
            Some(port) => format!("{}:{port}", contact.host),
            None => contact.host.clone(),
        }
    }

    pub(crate) fn local_contact(&self) -> NameAddr {
        NameAddr::new(self.ctx.config.local_contact.clone())
    }

    /// Local address of record, display name included.
    pub(crate) fn local_addr(&self) -> NameAddr {
        Self::local_name_addr(&self.ctx.config)
    }

    /// Register an outgoing transaction for `request`, arm its retransmit
    /// timer, then send. A send failure is returned for the caller to map
    /// to its failure transition.
    pub(crate) async fn register_and_send(&mut self, request: Request) -> Result<()> {
        let t1 = self.ctx.config.timers.t1;
        if let Some(mut txn) = self.ctx.table.add(
            TransactionKind::Ua,
            Direction::Outgoing,
            request.clone(),
            Some(self.id),
        ) {
            let id = txn.id();
            txn.retransmit_timer = Some(schedule(
                t1,
                self.ctx.internal.clone(),
                EngineMsg::Retransmit(id),
            ));
        }
        self.ctx.transport.send(request.into()).await?;
        Ok(())
    }

    /// Adopt a request the transport already resent with credentials. The
    /// retry carries a CSeq and branch the transport chose, so only the
    /// bookkeeping moves: the sequence gates track the new number and a
    /// transaction is registered so the eventual response finds its way
    /// here. Nothing is sent and no state changes.
    pub(crate) fn absorb_auth_retry(&mut self, request: Request) {
        let Some(category) = CSeqCategory::from_method(request.method) else {
            return;
        };
        debug!(connection = %self.id, method = %request.method, seq = request.cseq.seq,
            "adopting credentialed resend");
        if let Some(old) = self.cseq.in_flight(category) {
            if old != request.cseq.seq {
                self.ctx
                    .table
                    .retire(&request.call_id, self.id, request.method, old);
            }
        }
        self.cseq.observe_external(category, request.cseq.seq);
        if request.method == Method::Invite {
            self.pending_invite = Some(request.clone());
        }
        let t1 = self.ctx.config.timers.t1;
        if let Some(mut txn) =
            self.ctx
                .table
                .add(TransactionKind::Ua, Direction::Outgoing, request, Some(self.id))
        {
            let id = txn.id();
            txn.retransmit_timer = Some(schedule(
                t1,
                self.ctx.internal.clone(),
                EngineMsg::Retransmit(id),
            ));
        }
    }

    /// Build a response to `request` from the dialog's local identity.
    pub(crate) fn build_response(
        &self,
        status: StatusCode,
        request: &Request,
        with_contact: bool,
    ) -> Response {
        let mut response = Response::to_request(status, request);
        if let Some(tag) = self.dialog.local_tag() {
            response = response.with_to_tag(tag);
        }
        if with_contact {
            response.contact = Some(self.local_contact());
        }
        response
    }

    /// Respond to `request`, recording the response in its transaction so
    /// duplicates can be answered by replay.
    pub(crate) async fn respond(
        &mut self,
        status: StatusCode,
        request: &Request,
        body: Body,
        with_contact: bool,
    ) -> Result<()> {
        let mut response = self.build_response(status, request, with_contact);
        response.body = body;
        self.record_and_send_response(response).await
    }

    pub(crate) async fn record_and_send_response(&mut self, response: Response) -> Result<()> {
        let message: Message = response.into();
        let (txn, _) = self.ctx.table.find(&message, true).await;
        if let Some(mut txn) = txn {
            // An INVITE final is retransmitted until its ACK arrives.
            let is_invite_final = txn.meta().method == Method::Invite
                && message.status().is_some_and(|s| s.is_final());
            if is_invite_final && !txn.ack_seen {
                let id = txn.id();
                txn.retransmit_timer = Some(schedule(
                    self.ctx.config.timers.t1,
                    self.ctx.internal.clone(),
                    EngineMsg::Retransmit(id),
                ));
            }
        }
        self.ctx.transport.send(message).await?;
        Ok(())
    }

    // ---- media helpers ----------------------------------------------------

    /// Create the media connection if needed and cache the capability set.
    pub(crate) async fn ensure_media(&mut self) -> Result<(MediaConnectionId, MediaCapabilities)> {
        if let (Some(id), Some(caps)) = (self.media_connection, self.local_caps.clone()) {
            return Ok((id, caps));
        }
        let options = MediaTransportOptions {
            enable_video: false,
            srtp_required: self.ctx.config.require_encryption,
        };
        let id = self
            .ctx
            .media
            .create_connection(&self.ctx.config.local_contact.host, options)
            .await?;
        let caps = self
            .ctx
            .media
            .capabilities(id, self.ctx.config.max_address_candidates)
            .await?;
        self.media_connection = Some(id);
        self.local_caps = Some(caps.clone());
        Ok((id, caps))
    }

    /// Best-match the stored offer and build our answer, enforcing the
    /// encryption and codec-compatibility rules. On a rule violation the
    /// INVITE is refused here with 488 and the leg fails.
    async fn check_inbound_offer(&mut self, invite: &Request) -> Result<SessionDescription> {
        let (_, caps) = self.ensure_media().await?;
        let Some(offer) = invite.body.session() else {
            // Delayed offer: answer with our own description, the answer
            // comes back in the ACK.
            return Ok(caps.to_offer(self.ctx.config.max_address_candidates));
        };

        if self.ctx.config.require_encryption && offer.srtp.is_none() {
            self.respond(StatusCode::NotAcceptableHere, invite, Body::None, false)
                .await?;
            self.fail(CauseCode::RemoteEncryptionUnsupported).await;
            return Err(CallError::InvalidState {
                operation: "answer",
                state: "encryption required".to_string(),
            });
        }

        let selection = self.ctx.media.negotiate(&caps, offer);
        if selection.is_empty() {
            self.respond(StatusCode::NotAcceptableHere, invite, Body::None, false)
                .await?;
            self.fail(CauseCode::NoCodecs).await;
            return Err(CallError::InvalidState {
                operation: "answer",
                state: "no matching codecs".to_string(),
            });
        }

        self.selected = selection.clone();
        Ok(self.answer_description(&caps, &selection))
    }

    /// Early-media answer for a 183, negotiated but not failing the leg on
    /// mismatch; a mismatch simply reports no codecs upward.
    fn negotiated_answer(&mut self, invite: &Request) -> Result<SessionDescription> {
        let caps = self
            .local_caps
            .clone()
            .ok_or_else(|| self.invalid_state("accept"))?;
        match invite.body.session() {
            Some(offer) => {
                let selection = self.ctx.media.negotiate(&caps, offer);
                if selection.is_empty() {
                    return Err(CallError::InvalidState {
                        operation: "accept",
                        state: "no matching codecs".to_string(),
                    });
                }
                self.selected = selection.clone();
                Ok(self.answer_description(&caps, &selection))
            }
            None => Ok(caps.to_offer(1)),
        }
    }

    /// One-candidate description carrying the selected codec set.
    pub(crate) fn answer_description(
        &self,
        caps: &MediaCapabilities,
        selection: &CodecSelection,
    ) -> SessionDescription {
        let mut answer = caps.to_offer(1);
        answer.codecs = selection.codecs.clone();
        answer.bandwidth_kbps = selection.bandwidth_kbps;
        answer.framerate = selection.framerate;
        answer
    }

    /// Point media at the remote description and start both directions.
    pub(crate) async fn start_full_media(&mut self, remote: &SessionDescription) {
        let Some(media_id) = self.media_connection else {
            return;
        };
        if let Some(dest) = crate::media::MediaDestination::from_answer(remote) {
            if let Err(err) = self.ctx.media.set_destination(media_id, dest).await {
                warn!(connection = %self.id, "media destination rejected: {err}");
                return;
            }
        }
        let codecs = if self.selected.codecs.is_empty() {
            remote.codecs.clone()
        } else {
            self.selected.codecs.clone()
        };
        if let Err(err) = self.ctx.media.start_rtp_receive(media_id, &codecs).await {
            warn!(connection = %self.id, "rtp receive failed: {err}");
        }
        if let Err(err) = self.ctx.media.start_rtp_send(media_id, &codecs).await {
            warn!(connection = %self.id, "rtp send failed: {err}");
        }
    }

    /// Keep listening but stop sending, the far end asked for hold.
    pub(crate) async fn start_receive_only(&mut self) {
        let Some(media_id) = self.media_connection else {
            return;
        };
        if let Err(err) = self.ctx.media.stop_rtp_send(media_id).await {
            debug!(connection = %self.id, "rtp send stop: {err}");
        }
    }

    // ---- state plumbing ---------------------------------------------------

    /// Apply a lifecycle transition if the table allows it.
    pub(crate) fn set_state(&mut self, next: ConnectionState, cause: CauseCode) -> bool {
        if !self.state.may_enter(next) {
            warn!(connection = %self.id, from = %self.state, to = %next,
                "transition refused");
            return false;
        }
        if self.state != next {
            debug!(connection = %self.id, from = %self.state, to = %next, "state change");
        }
        self.state = next;
        self.cause = cause;
        true
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) fn invalid_state(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    pub(crate) fn schedule_internal(&self, delay: Duration, msg: EngineMsg) -> TimerHandle {
        schedule(delay, self.ctx.internal.clone(), msg)
    }

    /// Next CSeq for requests outside the category gates.
    pub(crate) fn allocate_seq(&mut self) -> u32 {
        self.cseq.allocate()
    }

    pub(crate) fn context(&self) -> &CallContext {
        &self.ctx
    }
}
