//! Call transfer over REFER and its NOTIFY progress reports.
//!
//! Three legs participate in a blind transfer. The transferor holds the
//! call, sends REFER and then listens for sipfrag NOTIFYs. The transferee
//! leg that received the REFER answers 202, dials the target on a fresh
//! connection and reports that connection's progress back inside NOTIFY
//! bodies. The target leg is an ordinary outbound call that knows which
//! leg to report to.
//!
//! An attended transfer differs only in the Refer-To carrying a Replaces
//! triple, which the consult INVITE then presents to the target.

use tracing::{debug, warn};

use ferrovox_sip_types::{
    Body, EventKind, Method, NameAddr, ReferTo, Request, SipFrag, StatusCode, SubscriptionState,
    Uri,
};

use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::cseq::CSeqCategory;
use crate::dialog::HoldState;
use crate::engine::EngineMsg;
use crate::errors::{CallError, Result};
use crate::events::{CallEventKind, CauseCode};

/// What a leg is doing in a transfer, if anything.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferRole {
    /// We sent the REFER and are waiting for NOTIFY progress.
    Transferor,
    /// We accepted a REFER and owe the far end NOTIFYs until the consult
    /// leg reaches a final outcome.
    ReferOwner(ReferProgress),
    /// We are the consult leg dialing the transfer target; progress goes
    /// back to `origin`.
    Target { origin: ConnectionId },
}

/// NOTIFY bookkeeping for a leg that accepted a REFER.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferProgress {
    pub target: ReferTo,
    pub subscription_active: bool,
}

/// Deferred work to run once a locally initiated hold completes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HoldCompleteAction {
    #[default]
    None,
    /// Send this REFER as soon as the hold round trip finishes.
    SendRefer(ReferTo),
}

impl Connection {
    /// Transfer the remote party to `target`.
    ///
    /// The call is put on hold first when it is not already; the REFER
    /// goes out once the hold round trip completes.
    pub async fn transfer(&mut self, target: Uri) -> Result<()> {
        if self.transfer.is_some() {
            return Err(CallError::TransferInProgress);
        }
        if self.state() != ConnectionState::Established {
            return Err(self.invalid_state("transfer"));
        }
        let refer_to = ReferTo::new(NameAddr::new(target));
        self.emitter()
            .emit(CallEventKind::Transfer, CauseCode::TransferInitiated);

        match self.hold_state {
            HoldState::Talking => {
                self.hold().await?;
                self.hold_action = HoldCompleteAction::SendRefer(refer_to);
                Ok(())
            }
            HoldState::Held => self.send_refer(refer_to).await,
            _ => Err(self.invalid_state("transfer")),
        }
    }

    /// Send the REFER for an agreed transfer and become the transferor.
    pub(crate) async fn send_refer(&mut self, refer_to: ReferTo) -> Result<()> {
        let Some(seq) = self.cseq.start_transaction(CSeqCategory::Refer) else {
            return Err(self.invalid_state("transfer"));
        };
        let refer = self
            .build_in_dialog_request(Method::Refer, seq)
            .with_refer_to(refer_to)
            .with_referred_by(self.local_addr());

        if let Err(err) = self.register_and_send(refer).await {
            self.cseq.end_transaction(CSeqCategory::Refer);
            self.emitter()
                .emit(CallEventKind::Transfer, CauseCode::TransferFailure);
            return Err(err);
        }
        self.transfer = Some(TransferRole::Transferor);
        Ok(())
    }

    /// A REFER arrived on this established leg: accept it with 202 and ask
    /// the engine to dial the named target on a consult connection.
    pub(crate) async fn handle_refer(&mut self, request: Request) {
        if request.refer_to.len() != 1 || request.referred_by.len() > 1 {
            warn!(connection = %self.id(), "malformed refer: {} targets", request.refer_to.len());
            let _ = self
                .respond(StatusCode::BadRequest, &request, Body::None, false)
                .await;
            return;
        }
        if self.transfer.is_some() || self.state() != ConnectionState::Established {
            let _ = self
                .respond(StatusCode::Decline, &request, Body::None, false)
                .await;
            return;
        }
        let target = request.refer_to[0].clone();
        let referred_by = request.referred_by.first().cloned();

        if self
            .respond(StatusCode::Accepted, &request, Body::None, false)
            .await
            .is_err()
        {
            return;
        }
        self.transfer = Some(TransferRole::ReferOwner(ReferProgress {
            target: target.clone(),
            subscription_active: true,
        }));
        self.emitter()
            .emit(CallEventKind::Transfer, CauseCode::TransferInitiated);
        let _ = self.context().internal.send(EngineMsg::TransferDial {
            origin: self.id(),
            target,
            referred_by,
        });
    }

    /// Report consult-leg progress to the transferor in a sipfrag NOTIFY.
    /// A final status terminates the implicit subscription.
    pub(crate) async fn notify_transfer_progress(&mut self, status: StatusCode) {
        let active = matches!(
            &self.transfer,
            Some(TransferRole::ReferOwner(p)) if p.subscription_active
        );
        if !active {
            debug!(connection = %self.id(), "dropping transfer progress, no subscription");
            return;
        }
        let terminal = status.is_final();
        let frag = SipFrag::from_status(status);

        // A lingering provisional NOTIFY gives way to the final one.
        let seq = match self.cseq.start_transaction(CSeqCategory::Notify) {
            Some(seq) => seq,
            None => {
                self.cseq.end_transaction(CSeqCategory::Notify);
                match self.cseq.start_transaction(CSeqCategory::Notify) {
                    Some(seq) => seq,
                    None => return,
                }
            }
        };
        let state = if terminal {
            SubscriptionState::Terminated
        } else {
            SubscriptionState::Active
        };
        let notify = self
            .build_in_dialog_request(Method::Notify, seq)
            .with_event(EventKind::Refer)
            .with_subscription_state(state)
            .with_body(Body::Sipfrag(frag));

        if let Err(err) = self.register_and_send(notify).await {
            warn!(connection = %self.id(), "transfer notify not sent: {err}");
            self.cseq.end_transaction(CSeqCategory::Notify);
        }
        if terminal {
            self.transfer = None;
        }
    }

    /// NOTIFY received on the transferor leg: surface the sipfrag progress
    /// and, on success, tear the original dialog down.
    pub(crate) async fn handle_notify(&mut self, request: Request) {
        let subscribed = request.event == Some(EventKind::Refer)
            && matches!(self.transfer, Some(TransferRole::Transferor));
        if !subscribed {
            let _ = self
                .respond(
                    StatusCode::TransactionDoesNotExist,
                    &request,
                    Body::None,
                    false,
                )
                .await;
            return;
        }
        let frag = request.body.sipfrag().cloned();
        let terminated = request.subscription_state == Some(SubscriptionState::Terminated);
        let _ = self.respond(StatusCode::Ok, &request, Body::None, false).await;

        let Some(frag) = frag else {
            return;
        };
        if frag.status.is_provisional() {
            self.emitter()
                .emit(CallEventKind::Transfer, CauseCode::TransferRinging);
        } else if frag.status.is_success() {
            self.emitter()
                .emit(CallEventKind::Transfer, CauseCode::TransferSuccess);
            self.transfer = None;
            let _ = self
                .context()
                .internal
                .send(EngineMsg::HangupConnection(self.id()));
            return;
        } else {
            self.emitter()
                .emit(CallEventKind::Transfer, CauseCode::TransferFailure);
            self.transfer = None;
        }
        if terminated {
            self.transfer = None;
        }
    }

    /// Final answer for our REFER.
    pub(crate) fn handle_refer_response(&mut self, status: StatusCode) {
        self.cseq.end_transaction(CSeqCategory::Refer);
        if status.is_success() {
            self.emitter()
                .emit(CallEventKind::Transfer, CauseCode::TransferAccepted);
        } else {
            self.emitter()
                .emit(CallEventKind::Transfer, CauseCode::TransferFailure);
            self.transfer = None;
        }
    }

    /// Run whatever was deferred until the hold round trip finished.
    pub(crate) async fn run_hold_complete_action(&mut self) {
        match std::mem::take(&mut self.hold_action) {
            HoldCompleteAction::None => {}
            HoldCompleteAction::SendRefer(refer_to) => {
                if let Err(err) = self.send_refer(refer_to).await {
                    warn!(connection = %self.id(), "deferred refer failed: {err}");
                }
            }
        }
    }
}
