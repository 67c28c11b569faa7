//! Teardown: local hangup, CANCEL handling, and the terminal transitions
//! every other path funnels through.
//!
//! `disconnect` and `fail` are the only places a leg enters a terminal
//! state. Both are idempotent, stop media, and leave the leg lingering
//! long enough to absorb a late final response before the engine drops it.

use tracing::{debug, warn};

use ferrovox_sip_types::{Body, Message, Method, Request, StatusCode};

use crate::connection::{Connection, ConnectionState};
use crate::cseq::CSeqCategory;
use crate::dialog::{HoldState, ReinviteGate};
use crate::engine::EngineMsg;
use crate::errors::Result;
use crate::events::{CallEventKind, CauseCode};

impl Connection {
    /// Hang up from the local side, whatever the leg is doing.
    ///
    /// Established dialogs get BYE; an unanswered outbound INVITE gets
    /// CANCEL; an unanswered inbound INVITE is refused. A BYE that cannot
    /// be sent still disconnects, since no response will ever arrive.
    pub async fn hangup(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        match self.state() {
            ConnectionState::Idle => {
                self.disconnect(CauseCode::Normal).await;
            }
            ConnectionState::Established => {
                let seq = self.allocate_seq();
                let bye = self.build_in_dialog_request(Method::Bye, seq);
                if let Err(err) = self.register_and_send(bye).await {
                    debug!(connection = %self.id(), "bye not sent, disconnecting anyway: {err}");
                }
                self.disconnect(CauseCode::Normal).await;
            }
            _ if self.dialog.initiated_locally => {
                self.cancel_pending_invite(CauseCode::Cancelled).await;
            }
            _ => {
                if let Some(invite) = self.pending_invite.clone() {
                    let _ = self
                        .respond(StatusCode::Forbidden, &invite, Body::None, false)
                        .await;
                }
                self.disconnect(CauseCode::Normal).await;
            }
        }
        Ok(())
    }

    /// CANCEL the unanswered INVITE and wait for its 487. The state does
    /// not change yet; the safety timer force-drops the leg if the final
    /// response never comes back.
    pub(crate) async fn cancel_pending_invite(&mut self, cause: CauseCode) {
        if self.cancelling {
            return;
        }
        let Some(invite) = self.pending_invite.clone() else {
            self.disconnect(cause).await;
            return;
        };
        let cancel = match Request::cancel_for(&invite) {
            Ok(cancel) => cancel,
            Err(err) => {
                warn!(connection = %self.id(), "cancel derivation failed: {err}");
                self.disconnect(cause).await;
                return;
            }
        };
        self.cancelling = true;
        self.cancel_cause = cause;

        // Ride the INVITE transaction so the CANCEL's own 200 matches.
        let message: Message = cancel.into();
        let (txn, _) = self.context().table.find(&message, true).await;
        drop(txn);
        if let Err(err) = self.context().transport.send(message).await {
            warn!(connection = %self.id(), "cancel not sent: {err}");
            self.disconnect(cause).await;
            return;
        }
        let safety = self.context().config.timers.cancel_safety;
        self.cancel_safety_timer =
            Some(self.schedule_internal(safety, EngineMsg::CancelSafetyExpired(self.id())));
    }

    /// Orderly terminal transition.
    pub(crate) async fn disconnect(&mut self, cause: CauseCode) {
        if self.is_terminal() {
            return;
        }
        self.stop_media().await;
        self.clear_timers();
        if self.set_state(ConnectionState::Disconnected, cause) {
            self.emitter().emit(CallEventKind::Disconnected, cause);
        }
        self.schedule_drop();
    }

    /// Failure terminal transition.
    pub(crate) async fn fail(&mut self, cause: CauseCode) {
        if self.is_terminal() {
            return;
        }
        self.stop_media().await;
        self.clear_timers();
        if self.set_state(ConnectionState::Failed, cause) {
            self.emitter().emit(CallEventKind::Disconnected, cause);
        }
        self.schedule_drop();
    }

    /// Stop both RTP directions and release the media connection.
    pub(crate) async fn stop_media(&mut self) {
        let Some(id) = self.media_connection.take() else {
            return;
        };
        let media = self.context().media.clone();
        if let Err(err) = media.stop_rtp_send(id).await {
            debug!(connection = %self.id(), "rtp send stop: {err}");
        }
        if let Err(err) = media.stop_rtp_receive(id).await {
            debug!(connection = %self.id(), "rtp receive stop: {err}");
        }
        if let Err(err) = media.delete_connection(id).await {
            debug!(connection = %self.id(), "media release: {err}");
        }
    }

    fn clear_timers(&mut self) {
        self.offering_timer = None;
        self.ring_timer = None;
        self.cancel_safety_timer = None;
        self.reinvite_retry_timer = None;
    }

    /// Linger long enough for a late 200 to arrive, then have the engine
    /// remove the leg.
    fn schedule_drop(&mut self) {
        if self.drop_timer.is_some() {
            return;
        }
        let linger = self.context().config.timers.state_timeout();
        self.drop_timer =
            Some(self.schedule_internal(linger, EngineMsg::DropConnection(self.id())));
    }

    /// Inbound leg left unanswered in Offering for too long.
    pub(crate) async fn on_offering_expired(&mut self) {
        if self.state() != ConnectionState::Offering || self.dialog.initiated_locally {
            return;
        }
        debug!(connection = %self.id(), "offering timed out");
        if let Some(invite) = self.pending_invite.clone() {
            let _ = self
                .respond(
                    StatusCode::TemporarilyUnavailable,
                    &invite,
                    Body::None,
                    false,
                )
                .await;
        }
        self.fail(CauseCode::NoResponse).await;
    }

    /// Outbound leg rang for too long without an answer.
    pub(crate) async fn on_ring_no_answer(&mut self) {
        let ringing = matches!(
            self.state(),
            ConnectionState::Offering | ConnectionState::Alerting | ConnectionState::Queued
        );
        if !ringing || !self.dialog.initiated_locally {
            return;
        }
        debug!(connection = %self.id(), "no answer, cancelling");
        self.cancel_pending_invite(CauseCode::NoResponse).await;
    }

    /// The 487 we expected after CANCEL never arrived.
    pub(crate) async fn on_cancel_safety_expired(&mut self) {
        if !self.cancelling || self.is_terminal() {
            return;
        }
        warn!(connection = %self.id(), "cancel never answered, forcing teardown");
        let cause = self.cancel_cause;
        self.disconnect(cause).await;
    }

    /// The transport reported that one of our requests never made it out.
    pub(crate) async fn handle_transport_failure(&mut self, message: Message) {
        match message.method() {
            Method::Invite if message.is_request() => {
                if self.reinvite_gate == ReinviteGate::Reinviting {
                    // Undeliverable re-INVITE: keep the session on the old
                    // description, roll any hold attempt back.
                    self.cseq.end_transaction(CSeqCategory::Invite);
                    self.reinvite_gate = ReinviteGate::AcceptInvite;
                    match self.hold_state {
                        HoldState::Holding => self.hold_state = HoldState::Talking,
                        HoldState::Unholding => self.hold_state = HoldState::Held,
                        _ => {}
                    }
                    warn!(connection = %self.id(), "re-invite undeliverable, session unchanged");
                } else if !self.is_terminal() {
                    self.cseq.end_transaction(CSeqCategory::Invite);
                    self.report_transfer_progress(StatusCode::ServiceUnavailable);
                    self.fail(CauseCode::DestNotObtainable).await;
                }
            }
            Method::Bye | Method::Info => {
                // Implicit disconnect: no response will ever arrive, and an
                // undeliverable in-dialog request means the peer is gone.
                if !self.is_terminal() {
                    self.disconnect(CauseCode::Normal).await;
                }
            }
            method => {
                debug!(connection = %self.id(), %method, "transport failure ignored");
            }
        }
    }

    /// Last words before the engine removes the leg.
    pub(crate) async fn finalize(&mut self) {
        self.stop_media().await;
        self.clear_timers();
        self.drop_timer = None;
        let cause = self.cause();
        self.emitter().emit(CallEventKind::Destroyed, cause);
    }
}
