//! Response handling for locally originated transactions.
//!
//! The INVITE response ladder carries almost all of the state machine:
//! provisional ringing and early media, the 491 glare retry, redirect
//! chasing, the late-200 race after CANCEL, and the answer evaluation
//! that decides between talking and held. Non-INVITE responses mostly
//! just close their CSeq category.

use std::time::Duration;

use tracing::{debug, warn};

use ferrovox_sip_types::{CSeq, Method, NameAddr, Request, Response, StatusCode};

use crate::connection::{Connection, ConnectionState};
use crate::cseq::CSeqCategory;
use crate::dialog::{HoldState, ReinviteGate};
use crate::engine::EngineMsg;
use crate::events::{CallEventKind, CauseCode};
use crate::transaction::Relationship;
use crate::transfer::{HoldCompleteAction, TransferRole};

/// Jittered 491 retry delay: the dialog initiator backs off longer so the
/// two sides cannot collide forever.
const GLARE_RETRY_INITIATOR_MS: std::ops::Range<u64> = 2100..4000;
const GLARE_RETRY_RECEIVER_MS: std::ops::Range<u64> = 0..2000;

impl Connection {
    /// Entry point for an inbound response matched to one of our
    /// transactions.
    pub(crate) async fn handle_response(&mut self, response: Response, relationship: Relationship) {
        match relationship {
            Relationship::Duplicate => {
                debug!(connection = %self.id(), status = response.status.as_u16(),
                    "duplicate response ignored");
            }
            Relationship::CancelResponse => {
                debug!(connection = %self.id(), "cancel answered");
            }
            _ => match response.cseq.method {
                Method::Invite => self.handle_invite_response(response, relationship).await,
                Method::Bye => {
                    debug!(connection = %self.id(), status = response.status.as_u16(),
                        "bye answered");
                }
                Method::Refer => self.handle_non_invite_final(response, CSeqCategory::Refer),
                Method::Notify => self.handle_non_invite_final(response, CSeqCategory::Notify),
                Method::Options => self.handle_non_invite_final(response, CSeqCategory::Options),
                Method::Info => self.handle_non_invite_final(response, CSeqCategory::Info),
                Method::Ack | Method::Cancel => {
                    debug!(connection = %self.id(), "unexpected response method discarded");
                }
            },
        }
    }

    /// Close out a non-INVITE category, dropping responses whose sequence
    /// number no longer matches the in-flight transaction.
    fn handle_non_invite_final(&mut self, response: Response, category: CSeqCategory) {
        if !self.cseq.matches(category, response.cseq.seq) {
            debug!(connection = %self.id(), category = ?category, cseq = response.cseq.seq,
                "stale response discarded");
            return;
        }
        if !response.status.is_final() {
            return;
        }
        match category {
            CSeqCategory::Refer => self.handle_refer_response(response.status),
            _ => {
                if !response.status.is_success() {
                    debug!(connection = %self.id(), category = ?category,
                        status = response.status.as_u16(), "request refused, session unchanged");
                }
                self.cseq.end_transaction(category);
            }
        }
    }

    async fn handle_invite_response(&mut self, response: Response, relationship: Relationship) {
        if response.status.is_provisional() {
            self.handle_invite_provisional(response).await;
            return;
        }
        match relationship {
            Relationship::Final => {
                if self.reinvite_gate == ReinviteGate::Reinviting {
                    self.handle_reinvite_final(response).await;
                } else {
                    self.handle_initial_invite_final(response).await;
                }
            }
            Relationship::NewFinal => {
                // A second, different final. The only one that matters is a
                // 200 overtaking an earlier failure: accept and release it.
                if response.status.is_success() {
                    self.handle_late_success(response).await;
                } else {
                    debug!(connection = %self.id(), status = response.status.as_u16(),
                        "superseded final discarded");
                }
            }
            _ => {
                debug!(connection = %self.id(), "invite response without transaction context");
            }
        }
    }

    async fn handle_invite_provisional(&mut self, response: Response) {
        if self.reinvite_gate == ReinviteGate::Reinviting {
            debug!(connection = %self.id(), "provisional during re-invite ignored");
            return;
        }
        if self.cancelling || self.is_terminal() {
            return;
        }
        self.dialog.absorb_response(&response);

        match response.status {
            StatusCode::Trying => {}
            StatusCode::Queued => {
                self.set_state(ConnectionState::Queued, CauseCode::Normal);
            }
            _ => {
                if matches!(
                    self.state(),
                    ConnectionState::Offering | ConnectionState::Queued
                ) {
                    self.set_state(ConnectionState::Alerting, CauseCode::Normal);
                    self.emitter()
                        .emit(CallEventKind::RemoteAlerting, CauseCode::Normal);
                    self.arm_ring_timer();
                }
                self.report_transfer_progress(StatusCode::Ringing);
                if let Some(answer) = response.body.session() {
                    if !self.context().config.suppress_early_media && !answer.is_hold() {
                        self.start_full_media(answer).await;
                    }
                }
            }
        }
    }

    fn arm_ring_timer(&mut self) {
        if self.ring_timer.is_some() {
            return;
        }
        if let Some(delay) = self.context().config.timers.ring_no_answer {
            self.ring_timer =
                Some(self.schedule_internal(delay, EngineMsg::RingNoAnswer(self.id())));
        }
    }

    /// First final answer for the dialog-forming INVITE.
    async fn handle_initial_invite_final(&mut self, response: Response) {
        let status = response.status;
        self.ring_timer = None;
        self.cseq.end_transaction(CSeqCategory::Invite);

        if status.is_success() {
            if self.cancelling || self.is_terminal() {
                self.handle_late_success(response).await;
                return;
            }
            self.dialog.absorb_response(&response);
            self.send_ack(&response, true).await;
            self.pending_invite = None;
            self.set_state(ConnectionState::Established, CauseCode::Normal);
            self.emitter()
                .emit(CallEventKind::Connected, CauseCode::Normal);
            self.report_transfer_progress(StatusCode::Ok);

            match response.body.session() {
                Some(answer) if answer.is_hold() => {
                    self.hold_state = HoldState::Held;
                    self.emitter()
                        .emit(CallEventKind::RemoteHeld, CauseCode::Normal);
                    self.start_receive_only().await;
                }
                Some(answer) => {
                    self.start_full_media(answer).await;
                }
                None => {
                    debug!(connection = %self.id(), "200 without an answer, media unchanged");
                }
            }
        } else if status.is_redirect() {
            self.handle_redirect(response).await;
        } else {
            self.send_ack(&response, false).await;
            self.cancel_safety_timer = None;
            self.report_transfer_progress(status);
            if self.cancelling {
                let cause = self.cancel_cause;
                self.disconnect(cause).await;
            } else {
                self.fail(CauseCode::from_failure_status(status)).await;
            }
        }
    }

    /// A 200 that lost the race against our CANCEL (or a different earlier
    /// final): the remote picked up a call we no longer want. Accept the
    /// dialog with ACK, then end it immediately with BYE. Never enters
    /// `Established`.
    async fn handle_late_success(&mut self, response: Response) {
        self.dialog.absorb_response(&response);
        self.send_ack(&response, true).await;
        self.cancel_safety_timer = None;

        let seq = self.allocate_seq();
        let bye = self.build_in_dialog_request(Method::Bye, seq);
        if let Err(err) = self.register_and_send(bye).await {
            debug!(connection = %self.id(), "bye after late 200 not sent: {err}");
        }
        if !self.is_terminal() {
            let cause = self.cancel_cause;
            self.disconnect(cause).await;
        }
    }

    /// Follow exactly one redirect hop per 3xx, up to the configured cap,
    /// with a fresh transaction and cleared proxy routing.
    async fn handle_redirect(&mut self, response: Response) {
        self.send_ack(&response, false).await;
        let Some(invite) = self.pending_invite.clone() else {
            self.fail(CauseCode::BadRedirect).await;
            return;
        };
        let Some(target) = response.redirect_target().cloned() else {
            warn!(connection = %self.id(), "redirect without contact");
            self.fail(CauseCode::BadRedirect).await;
            return;
        };
        if self.redirect_count >= self.context().config.max_redirects {
            warn!(connection = %self.id(), count = self.redirect_count, "redirect cap reached");
            self.fail(CauseCode::Redirected).await;
            return;
        }
        if invite.max_forwards <= 1 {
            self.fail(CauseCode::BadRedirect).await;
            return;
        }
        let Some(seq) = self.cseq.start_transaction(CSeqCategory::Invite) else {
            self.fail(CauseCode::BadRedirect).await;
            return;
        };

        let mut next = invite;
        next.uri = target.clone();
        next.cseq = CSeq::new(seq, Method::Invite);
        next.max_forwards -= 1;
        next.via = vec![self.new_via()];
        next.routes.clear();
        self.redirect_count += 1;
        self.dialog.remote.addr = NameAddr::new(target);
        self.pending_invite = Some(next.clone());

        debug!(connection = %self.id(), hop = self.redirect_count, target = %next.uri,
            "following redirect");
        if let Err(err) = self.register_and_send(next).await {
            warn!(connection = %self.id(), "redirected invite not sent: {err}");
            self.cseq.end_transaction(CSeqCategory::Invite);
            self.fail(CauseCode::DestNotObtainable).await;
        }
    }

    /// Final answer to our re-INVITE. Success applies the new session;
    /// failure keeps the old one alive and rolls hold back. 491 backs off
    /// and retries with a fresh sequence number.
    async fn handle_reinvite_final(&mut self, response: Response) {
        let status = response.status;

        if status == StatusCode::RequestPending {
            self.cseq.end_transaction(CSeqCategory::Invite);
            let range = if self.dialog.initiated_locally {
                GLARE_RETRY_INITIATOR_MS
            } else {
                GLARE_RETRY_RECEIVER_MS
            };
            let delay = Duration::from_millis(self.context().random.jitter_ms(range));
            debug!(connection = %self.id(), delay_ms = delay.as_millis() as u64,
                "re-invite glare, retrying");
            self.reinvite_retry_timer =
                Some(self.schedule_internal(delay, EngineMsg::ReinviteRetry(self.id())));
            return;
        }

        self.cseq.end_transaction(CSeqCategory::Invite);
        self.reinvite_retry_timer = None;
        self.reinvite_gate = ReinviteGate::AcceptInvite;

        if status.is_success() {
            self.dialog.absorb_response(&response);
            self.send_ack(&response, true).await;
            self.pending_invite = None;
            match self.hold_state {
                HoldState::Holding => {
                    self.hold_state = HoldState::Held;
                    self.start_receive_only().await;
                    self.emitter().emit(CallEventKind::Held, CauseCode::Normal);
                    self.run_hold_complete_action().await;
                }
                HoldState::Unholding => {
                    self.hold_state = HoldState::Talking;
                    if let Some(answer) = response.body.session() {
                        self.start_full_media(answer).await;
                    }
                    self.emitter()
                        .emit(CallEventKind::Bridged, CauseCode::Normal);
                }
                _ => {
                    if let Some(answer) = response.body.session() {
                        if !answer.is_hold() {
                            self.start_full_media(answer).await;
                        }
                    }
                }
            }
        } else {
            // The peer refused the new offer; the session continues on the
            // old description.
            self.send_ack(&response, false).await;
            self.pending_invite = None;
            match self.hold_state {
                HoldState::Holding => self.hold_state = HoldState::Talking,
                HoldState::Unholding => self.hold_state = HoldState::Held,
                _ => {}
            }
            if !matches!(self.hold_action, HoldCompleteAction::None) {
                self.hold_action = HoldCompleteAction::None;
                self.transfer = None;
                self.emitter()
                    .emit(CallEventKind::Transfer, CauseCode::TransferFailure);
            }
            warn!(connection = %self.id(), status = status.as_u16(),
                "re-invite refused, session unchanged");
        }
    }

    /// Resend the pending re-INVITE after 491 backoff, with a fresh branch
    /// and sequence number. Superseding traffic cancels the timer, so a
    /// stale wakeup only has to check the gate.
    pub(crate) async fn retry_reinvite(&mut self) {
        if self.reinvite_gate != ReinviteGate::Reinviting || self.is_terminal() {
            return;
        }
        let Some(previous) = self.pending_invite.clone() else {
            self.reinvite_gate = ReinviteGate::AcceptInvite;
            return;
        };
        let Some(seq) = self.cseq.start_transaction(CSeqCategory::Invite) else {
            return;
        };
        let mut next = previous;
        next.cseq = CSeq::new(seq, Method::Invite);
        next.via = vec![self.new_via()];
        self.pending_invite = Some(next.clone());

        if let Err(err) = self.register_and_send(next).await {
            warn!(connection = %self.id(), "re-invite retry not sent: {err}");
            self.cseq.end_transaction(CSeqCategory::Invite);
            self.reinvite_gate = ReinviteGate::AcceptInvite;
            match self.hold_state {
                HoldState::Holding => self.hold_state = HoldState::Talking,
                HoldState::Unholding => self.hold_state = HoldState::Held,
                _ => {}
            }
        }
    }

    /// ACK a final response. A 2xx ACK forms its own transaction with a
    /// fresh branch addressed at the learned remote target; a failure ACK
    /// mirrors the INVITE's branch and request-URI.
    pub(crate) async fn send_ack(&mut self, response: &Response, success: bool) {
        let Some(invite) = self.pending_invite.clone() else {
            debug!(connection = %self.id(), "no invite to ack");
            return;
        };
        let (uri, branch) = if success {
            (
                self.dialog.request_target(),
                self.context().random.branch(),
            )
        } else {
            let branch = invite.branch().unwrap_or_default().to_string();
            (invite.uri.clone(), branch)
        };
        let mut ack = match Request::ack_for(&invite, response, uri, branch) {
            Ok(ack) => ack,
            Err(err) => {
                warn!(connection = %self.id(), "ack derivation failed: {err}");
                return;
            }
        };
        if success {
            ack.routes = self.dialog.route_set.clone();
        }
        let message: ferrovox_sip_types::Message = ack.into();
        // Run it through the table so the transaction can replay it when
        // the final response is retransmitted.
        let (txn, _) = self.context().table.find(&message, true).await;
        drop(txn);
        if let Err(err) = self.context().transport.send(message).await {
            warn!(connection = %self.id(), "ack not sent: {err}");
        }
    }

    /// Consult-leg progress back to the leg that accepted the REFER.
    pub(crate) fn report_transfer_progress(&mut self, status: StatusCode) {
        if let Some(TransferRole::Target { origin }) = self.transfer {
            let _ = self
                .context()
                .internal
                .send(EngineMsg::TransferProgress { origin, status });
        }
    }
}
