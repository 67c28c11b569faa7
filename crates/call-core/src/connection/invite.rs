//! Inbound request handling.
//!
//! The engine routes every request that belongs to this leg here, tagged
//! with how it matched the transaction table. Duplicates never arrive;
//! those are replayed from the stored response without waking the leg.

use tracing::{debug, warn};

use ferrovox_sip_types::{Body, Method, Request, StatusCode};

use crate::connection::{Connection, ConnectionState};
use crate::dialog::{HoldState, ReinviteGate};
use crate::engine::EngineMsg;
use crate::events::{CallEventKind, CauseCode};
use crate::transaction::Relationship;

impl Connection {
    /// Entry point for an inbound request.
    pub(crate) async fn handle_request(&mut self, request: Request, relationship: Relationship) {
        match relationship {
            Relationship::Cancel => self.handle_cancel(request).await,
            Relationship::Ack | Relationship::TwoXxAck => self.handle_ack(request).await,
            Relationship::Duplicate => {
                debug!(connection = %self.id(), method = %request.method, "duplicate ignored");
            }
            _ => self.handle_new_request(request).await,
        }
    }

    async fn handle_new_request(&mut self, request: Request) {
        let initial_invite =
            request.is_initial_invite() && self.state() == ConnectionState::Idle;
        if !initial_invite {
            if self.dialog.is_out_of_order(request.cseq.seq) {
                debug!(connection = %self.id(), cseq = request.cseq.seq,
                    "out-of-order request refused");
                let _ = self
                    .respond(StatusCode::ServerInternalError, &request, Body::None, false)
                    .await;
                return;
            }
            self.dialog.absorb_request(&request);
        }

        match request.method {
            Method::Invite if initial_invite => self.handle_initial_invite(request).await,
            Method::Invite => self.handle_reinvite(request).await,
            Method::Bye => self.handle_bye(request).await,
            Method::Refer => self.handle_refer(request).await,
            Method::Notify => self.handle_notify(request).await,
            Method::Options => self.handle_options(request).await,
            Method::Info => self.handle_info(request).await,
            Method::Cancel => self.handle_stray_cancel(request).await,
            Method::Ack => {
                debug!(connection = %self.id(), "unmatched ack discarded");
            }
        }
    }

    /// Dialog-forming INVITE. Media is allocated and the offer negotiated
    /// up front so an unusable call is refused before anyone is alerted.
    async fn handle_initial_invite(&mut self, request: Request) {
        let caps = match self.ensure_media().await {
            Ok((_, caps)) => caps,
            Err(err) => {
                warn!(connection = %self.id(), "no media resources for inbound call: {err}");
                let _ = self
                    .respond(StatusCode::BusyHere, &request, Body::None, false)
                    .await;
                self.fail(CauseCode::ResourceLimit).await;
                return;
            }
        };

        if let Some(offer) = request.body.session() {
            if self.context().config.require_encryption && offer.srtp.is_none() {
                let _ = self
                    .respond(StatusCode::NotAcceptableHere, &request, Body::None, false)
                    .await;
                self.fail(CauseCode::RemoteEncryptionUnsupported).await;
                return;
            }
            let selection = self.context().media.negotiate(&caps, offer);
            if selection.is_empty() {
                let _ = self
                    .respond(StatusCode::NotAcceptableHere, &request, Body::None, false)
                    .await;
                self.fail(CauseCode::NoCodecs).await;
                return;
            }
            self.selected = selection;
        }

        // 100 quenches retransmissions while the application decides.
        let _ = self
            .respond(StatusCode::Trying, &request, Body::None, false)
            .await;
        self.pending_invite = Some(request);
        self.set_state(ConnectionState::Offering, CauseCode::Normal);
        self.emitter().emit_with_remote(
            CallEventKind::Offering,
            CauseCode::Normal,
            self.dialog.remote.clone(),
        );

        if let Some(delay) = self.context().config.timers.offering_delay {
            self.offering_timer =
                Some(self.schedule_internal(delay, EngineMsg::OfferingExpired(self.id())));
        }
    }

    /// Mid-dialog INVITE: hold, resume, or a plain session refresh. The
    /// gate admits exactly one offer/answer round at a time; a collision
    /// gets 491 and must leave the pending slot untouched.
    async fn handle_reinvite(&mut self, request: Request) {
        if self.state() != ConnectionState::Established || !self.reinvite_gate.is_open() {
            let _ = self
                .respond(StatusCode::RequestPending, &request, Body::None, false)
                .await;
            return;
        }
        let Some(caps) = self.local_caps.clone() else {
            let _ = self
                .respond(StatusCode::ServerInternalError, &request, Body::None, false)
                .await;
            return;
        };

        let (answer, remote_hold) = match request.body.session() {
            Some(offer) => {
                let selection = self.context().media.negotiate(&caps, offer);
                if selection.is_empty() {
                    // The existing session continues unchanged.
                    let _ = self
                        .respond(StatusCode::NotAcceptableHere, &request, Body::None, false)
                        .await;
                    return;
                }
                self.selected = selection.clone();
                (
                    self.answer_description(&caps, &selection),
                    offer.is_hold(),
                )
            }
            None => (caps.to_offer(1), false),
        };

        self.reinvite_gate = ReinviteGate::Reinvited;
        self.pending_invite = Some(request.clone());
        let _ = self
            .respond(StatusCode::Ok, &request, Body::Session(answer), true)
            .await;

        if remote_hold {
            if self.hold_state == HoldState::Talking {
                self.hold_state = HoldState::Held;
                self.emitter()
                    .emit(CallEventKind::RemoteHeld, CauseCode::Normal);
            }
            self.start_receive_only().await;
        } else {
            if self.hold_state == HoldState::Held {
                self.hold_state = HoldState::Talking;
                self.emitter()
                    .emit(CallEventKind::Bridged, CauseCode::Normal);
            }
            if let Some(offer) = request.body.session() {
                self.start_full_media(offer).await;
            }
        }
    }

    /// ACK closes the pending offer/answer round. An answer riding in the
    /// ACK body completes a delayed-offer negotiation.
    pub(crate) async fn handle_ack(&mut self, request: Request) {
        if self.is_terminal() {
            return;
        }
        if let Some(answer) = request.body.session() {
            if answer.is_hold() {
                if self.hold_state == HoldState::Talking {
                    self.hold_state = HoldState::Held;
                    self.emitter()
                        .emit(CallEventKind::RemoteHeld, CauseCode::Normal);
                }
                self.start_receive_only().await;
            } else {
                self.start_full_media(answer).await;
            }
        }
        if self.reinvite_gate == ReinviteGate::Reinvited {
            self.reinvite_gate = ReinviteGate::AcceptInvite;
        }
        self.pending_invite = None;
    }

    /// CANCEL matched against our pending inbound INVITE.
    pub(crate) async fn handle_cancel(&mut self, request: Request) {
        let _ = self
            .respond(StatusCode::Ok, &request, Body::None, false)
            .await;
        if self.is_terminal() {
            return;
        }
        let cancellable = matches!(
            self.state(),
            ConnectionState::Offering | ConnectionState::Alerting | ConnectionState::Queued
        ) && !self.dialog.initiated_locally;
        if !cancellable {
            // Answered already; the CANCEL lost the race and only gets its 200.
            debug!(connection = %self.id(), "cancel after final ignored");
            return;
        }
        if let Some(invite) = self.pending_invite.clone() {
            let _ = self
                .respond(StatusCode::RequestTerminated, &invite, Body::None, false)
                .await;
        }
        self.disconnect(CauseCode::Cancelled).await;
    }

    /// CANCEL that matched the dialog but no live transaction.
    async fn handle_stray_cancel(&mut self, request: Request) {
        let _ = self
            .respond(
                StatusCode::TransactionDoesNotExist,
                &request,
                Body::None,
                false,
            )
            .await;
        if self.is_terminal() {
            return;
        }
        if self.state() == ConnectionState::Idle {
            self.fail(CauseCode::NoKnownInvite).await;
        } else if self.pending_invite.is_none() {
            self.fail(CauseCode::Cancelled).await;
        } else {
            debug!(connection = %self.id(), "cancel with mismatched cseq ignored");
        }
    }

    async fn handle_bye(&mut self, request: Request) {
        match self.state() {
            ConnectionState::Idle => {
                let _ = self
                    .respond(
                        StatusCode::TransactionDoesNotExist,
                        &request,
                        Body::None,
                        false,
                    )
                    .await;
                self.fail(CauseCode::ByeDuringIdle).await;
            }
            state if state.is_terminal() => {
                // Idempotent: the dialog already ended, answer as an error
                // transaction without another lifecycle event.
                let _ = self
                    .respond(
                        StatusCode::TransactionDoesNotExist,
                        &request,
                        Body::None,
                        false,
                    )
                    .await;
            }
            _ => {
                let _ = self
                    .respond(StatusCode::Ok, &request, Body::None, false)
                    .await;
                self.disconnect(CauseCode::Normal).await;
            }
        }
    }

    /// In-dialog OPTIONS: answer with capabilities.
    async fn handle_options(&mut self, request: Request) {
        let mut response = self
            .build_response(StatusCode::Ok, &request, true)
            .with_allow(Method::SUPPORTED.to_vec());
        if let Some(caps) = self.local_caps.clone() {
            response.body = Body::Session(caps.to_offer(1));
        }
        let _ = self.record_and_send_response(response).await;
    }

    async fn handle_info(&mut self, request: Request) {
        let _ = self
            .respond(StatusCode::Ok, &request, Body::None, false)
            .await;
    }
}
