//! Inbound traffic routing.
//!
//! Every message from the transport passes through here exactly once. The
//! transaction table sees it first: duplicates are answered from stored
//! state without waking the owning leg, everything else is routed by
//! transaction owner, then by dialog identity, then treated as new work.
//!
//! Lock order is strict. A held transaction is dropped before any
//! connection lock is taken, and only one connection is locked at a time.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use ferrovox_sip_types::{Message, Method, Replaces, Request, Response, StatusCode};

use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::engine::CallEngine;
use crate::events::{CallEventKind, CauseCode};
use crate::transaction::{Direction, LockedTransaction, Relationship, TransactionKind};
use crate::transport::{MessageStatus, SipEvent};

impl CallEngine {
    /// Route one transport event.
    pub(crate) async fn dispatch_sip_event(&self, event: SipEvent) {
        match event.status {
            MessageStatus::Normal => self.dispatch_message(event.message).await,
            MessageStatus::TransportError => self.handle_transport_error(event.message).await,
            MessageStatus::AuthenticationRetry => self.handle_auth_retry(event.message).await,
            MessageStatus::SessionReinviteTimer => self.handle_session_timer(event.message).await,
        }
    }

    async fn dispatch_message(&self, message: Message) {
        let (txn, relationship) = self.ctx.table.find(&message, false).await;
        match message {
            Message::Request(request) => self.dispatch_request(request, txn, relationship).await,
            Message::Response(response) => {
                self.dispatch_response(response, txn, relationship).await
            }
        }
    }

    async fn dispatch_request(
        &self,
        request: Request,
        txn: Option<LockedTransaction>,
        relationship: Relationship,
    ) {
        match relationship {
            Relationship::Duplicate => {
                let Some(txn) = txn else { return };
                let replay = txn.last_final.clone();
                drop(txn);
                match replay {
                    Some(response) => {
                        debug!(call_id = %request.call_id, method = %request.method,
                            "replaying final for a retransmitted request");
                        if let Err(err) = self.ctx.transport.send(response.into()).await {
                            debug!(error = %err, "replay failed");
                        }
                    }
                    None => {
                        debug!(call_id = %request.call_id, method = %request.method,
                            "retransmission before the final, ignored");
                    }
                }
            }
            Relationship::Request => {
                drop(txn);
                self.route_new_request(request).await;
            }
            _ => {
                let owner = txn.as_ref().and_then(|txn| txn.meta().owner);
                drop(txn);
                let Some(owner) = owner else {
                    debug!(call_id = %request.call_id, method = %request.method,
                        relationship = %relationship, "transaction has no owner");
                    return;
                };
                let Some(leg) = self.lookup(owner) else {
                    debug!(connection = %owner, "request for a forgotten connection");
                    return;
                };
                leg.lock().await.handle_request(request, relationship).await;
            }
        }
    }

    /// A request that opened no known transaction: an existing dialog, a
    /// dialog-forming INVITE, or stateless traffic.
    async fn route_new_request(&self, request: Request) {
        if let Some((id, leg)) = self.find_by_dialog(&request).await {
            // Register before handling so retransmissions arriving while
            // the leg works are caught as duplicates. ACK is hop-less and
            // never opens a transaction of its own.
            if request.method != Method::Ack {
                if let Some(txn) = self.ctx.table.add(
                    TransactionKind::Ua,
                    Direction::Incoming,
                    request.clone(),
                    Some(id),
                ) {
                    drop(txn);
                }
            }
            leg.lock()
                .await
                .handle_request(request, Relationship::Request)
                .await;
            return;
        }

        match request.method {
            Method::Invite if request.is_initial_invite() => self.accept_new_call(request).await,
            Method::Options => {
                let response = Response::to_request(StatusCode::Ok, &request)
                    .with_allow(Method::SUPPORTED.to_vec());
                if let Err(err) = self.ctx.transport.send(response.into()).await {
                    debug!(error = %err, "options response failed");
                }
            }
            Method::Ack => {
                debug!(call_id = %request.call_id, "stray ack discarded");
            }
            _ => {
                debug!(call_id = %request.call_id, method = %request.method,
                    "request outside any dialog refused");
                let response = Response::to_request(StatusCode::TransactionDoesNotExist, &request);
                if let Err(err) = self.ctx.transport.send(response.into()).await {
                    debug!(error = %err, "stateless refusal failed");
                }
            }
        }
    }

    /// Build a leg for a dialog-forming INVITE and hand the request over.
    async fn accept_new_call(&self, invite: Request) {
        let replaces_of = match &invite.replaces {
            Some(replaces) => match self.resolve_replaces(replaces).await {
                Some(found) => Some(found),
                None => {
                    debug!(call_id = %invite.call_id, "replaces names no live dialog");
                    let response =
                        Response::to_request(StatusCode::TransactionDoesNotExist, &invite);
                    if let Err(err) = self.ctx.transport.send(response.into()).await {
                        debug!(error = %err, "replaces refusal failed");
                    }
                    return;
                }
            },
            None => None,
        };

        let (id, call_index) = self.next_connection_id();
        let mut connection = Connection::new_inbound(id, call_index, self.ctx.clone(), &invite);
        connection.replaces_of = replaces_of;
        let leg = self.register(connection);
        if let Some(txn) =
            self.ctx
                .table
                .add(TransactionKind::Ua, Direction::Incoming, invite.clone(), Some(id))
        {
            drop(txn);
        }
        let mut guard = leg.lock().await;
        guard.emitter().emit_with_remote(
            CallEventKind::NewCall,
            CauseCode::Normal,
            guard.remote().clone(),
        );
        guard.handle_request(invite, Relationship::Request).await;
    }

    /// Find the established leg a Replaces header points at. Tag order in
    /// the header depends on which side the transferor was, so both
    /// orientations are accepted.
    async fn resolve_replaces(&self, replaces: &Replaces) -> Option<ConnectionId> {
        let candidates: Vec<ConnectionId> = self
            .dialogs
            .get(&replaces.call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for id in candidates {
            let Some(leg) = self.lookup(id) else { continue };
            let guard = leg.lock().await;
            if guard.state() != ConnectionState::Established {
                continue;
            }
            let local = guard.dialog().local_tag();
            let remote = guard.dialog().remote_tag();
            let straight = local == Some(replaces.to_tag.as_str())
                && remote == Some(replaces.from_tag.as_str());
            let flipped = local == Some(replaces.from_tag.as_str())
                && remote == Some(replaces.to_tag.as_str());
            if straight || flipped {
                return Some(id);
            }
        }
        None
    }

    async fn dispatch_response(
        &self,
        response: Response,
        txn: Option<LockedTransaction>,
        relationship: Relationship,
    ) {
        match relationship {
            Relationship::Unknown => {
                debug!(call_id = %response.call_id, status = %response.status,
                    "response matches nothing, dropped");
            }
            Relationship::Duplicate => {
                let Some(txn) = txn else { return };
                let ack = txn.ack.clone();
                drop(txn);
                if let Some(ack) = ack {
                    debug!(call_id = %ack.call_id, "replaying ack for a retransmitted final");
                    if let Err(err) = self.ctx.transport.send(ack.into()).await {
                        debug!(error = %err, "ack replay failed");
                    }
                }
            }
            _ => {
                let owner = txn.as_ref().and_then(|txn| txn.meta().owner);
                drop(txn);
                let Some(owner) = owner else {
                    debug!(call_id = %response.call_id, status = %response.status,
                        "response transaction has no owner");
                    return;
                };
                let Some(leg) = self.lookup(owner) else {
                    debug!(connection = %owner, "response for a forgotten connection");
                    return;
                };
                leg.lock().await.handle_response(response, relationship).await;
            }
        }
    }

    /// The transport reported it could not deliver one of our messages.
    /// Route the report to the sending leg; classification side effects on
    /// the transaction are the same ones sending caused already.
    async fn handle_transport_error(&self, message: Message) {
        let (txn, _) = self.ctx.table.find(&message, true).await;
        let owner = txn.as_ref().and_then(|txn| txn.meta().owner);
        drop(txn);
        let leg = match owner {
            Some(id) => self.lookup(id),
            None => self.find_by_ownership(&message).await.map(|(_, leg)| leg),
        };
        match leg {
            Some(leg) => leg.lock().await.handle_transport_failure(message).await,
            None => {
                debug!(call_id = %message.call_id(), "delivery failure for an unknown dialog");
            }
        }
    }

    /// The transport answered a challenge for us and resent with
    /// credentials. Adopt the new CSeq so dialog numbering stays ahead.
    async fn handle_auth_retry(&self, message: Message) {
        if !message.is_request() {
            debug!("auth retry report without a request, ignored");
            return;
        }
        let Some((_, leg)) = self.find_by_ownership(&message).await else {
            debug!(call_id = %message.call_id(), "auth retry for an unknown dialog");
            return;
        };
        let Message::Request(request) = message else {
            return;
        };
        leg.lock().await.absorb_auth_retry(request);
    }

    async fn handle_session_timer(&self, message: Message) {
        let Some((_, leg)) = self.find_by_ownership(&message).await else {
            debug!(call_id = %message.call_id(), "session timer for an unknown dialog");
            return;
        };
        leg.lock().await.refresh_session().await;
    }

    /// Candidate legs for an inbound request, matched on dialog identity.
    async fn find_by_dialog(
        &self,
        request: &Request,
    ) -> Option<(ConnectionId, Arc<Mutex<Connection>>)> {
        let candidates: Vec<ConnectionId> = self
            .dialogs
            .get(&request.call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for id in candidates {
            let Some(leg) = self.lookup(id) else { continue };
            if leg.lock().await.dialog_matches(request) {
                return Some((id, leg));
            }
        }
        None
    }

    /// The leg that sent `message`, matched on our own dialog tag.
    async fn find_by_ownership(
        &self,
        message: &Message,
    ) -> Option<(ConnectionId, Arc<Mutex<Connection>>)> {
        let candidates: Vec<ConnectionId> = self
            .dialogs
            .get(message.call_id())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for id in candidates {
            let Some(leg) = self.lookup(id) else { continue };
            if leg.lock().await.owns_message(message) {
                return Some((id, leg));
            }
        }
        None
    }
}
