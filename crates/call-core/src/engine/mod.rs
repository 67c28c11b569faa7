//! The call engine: one task that owns every leg and drives all of them.
//!
//! Everything funnels through [`CallEngine::run`]. Transport events, timer
//! fires and cross-leg requests arrive on two queues and are handled one at
//! a time, so a connection is only ever touched with its lock held and the
//! engine never holds two connection locks at once. Public operations
//! (dial, hangup, hold...) lock the one leg they concern and call into it
//! directly.

mod dispatch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ferrovox_sip_types::{Message, NameAddr, ReferTo, Response, StatusCode, Uri};

use crate::config::CallEngineConfig;
use crate::connection::{CallContext, Connection, ConnectionId, ConnectionState};
use crate::errors::{CallError, Result};
use crate::events::{CallEvent, CallEventKind, CauseCode};
use crate::media::MediaSession;
use crate::timer::schedule;
use crate::transaction::{Direction, ResendOutcome, TransactionId, TransactionTable};
use crate::transfer::TransferRole;
use crate::transport::{SipEvent, SipTransport};
use crate::util::random::RandomSource;

/// Work items the engine posts to itself.
///
/// Timers and connections push these onto the internal queue instead of
/// calling back into the engine. The queue is unbounded because the loop
/// also produces to it while a connection lock is held.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    /// A retransmission timer fired for this transaction.
    Retransmit(TransactionId),
    /// An inbound leg sat unanswered past the offering delay.
    OfferingExpired(ConnectionId),
    /// An outbound leg rang past the no-answer timeout.
    RingNoAnswer(ConnectionId),
    /// No final for a cancelled INVITE arrived; tear the leg down anyway.
    CancelSafetyExpired(ConnectionId),
    /// Glare backoff elapsed; try the deferred re-INVITE again.
    ReinviteRetry(ConnectionId),
    /// A disconnected leg lingered long enough; free it.
    DropConnection(ConnectionId),
    /// Hang a leg up on behalf of another leg.
    HangupConnection(ConnectionId),
    /// A REFER was accepted; dial the transfer target on a new leg.
    TransferDial {
        origin: ConnectionId,
        target: ReferTo,
        referred_by: Option<NameAddr>,
    },
    /// Consult-leg progress to forward as a NOTIFY on the REFER dialog.
    TransferProgress {
        origin: ConnectionId,
        status: StatusCode,
    },
}

/// Call-control engine. Create one with [`CallEngine::new`], spawn
/// [`CallEngine::run`] on it, then operate on legs by [`ConnectionId`].
#[derive(Debug)]
pub struct CallEngine {
    ctx: CallContext,
    connections: DashMap<ConnectionId, Arc<Mutex<Connection>>>,
    /// Legs grouped by Call-ID. Normally one leg per entry; forked or
    /// replaced dialogs briefly share.
    dialogs: DashMap<String, Vec<ConnectionId>>,
    next_connection: AtomicU64,
    shutdown: Notify,
    stopped: AtomicBool,
    /// Receiving half of the internal queue, taken once by `run`.
    internal_rx: StdMutex<Option<mpsc::UnboundedReceiver<EngineMsg>>>,
}

impl CallEngine {
    /// Build an engine and the channel its lifecycle events arrive on.
    pub fn new(
        config: CallEngineConfig,
        transport: Arc<dyn SipTransport>,
        media: Arc<dyn MediaSession>,
        random: Arc<dyn RandomSource>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<CallEvent>)> {
        if let Err(message) = config.validate() {
            return Err(CallError::Configuration { message });
        }
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let table = Arc::new(TransactionTable::new(config.timers.t1));
        let ctx = CallContext {
            config: Arc::new(config),
            transport,
            media,
            table,
            random,
            events: events_tx,
            internal: internal_tx,
        };
        let engine = Arc::new(CallEngine {
            ctx,
            connections: DashMap::new(),
            dialogs: DashMap::new(),
            next_connection: AtomicU64::new(1),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
            internal_rx: StdMutex::new(Some(internal_rx)),
        });
        Ok((engine, events_rx))
    }

    /// Drive the engine until [`CallEngine::shutdown`] is called or the
    /// transport channel closes. On exit every live leg is hung up and
    /// finalized.
    pub async fn run(self: Arc<Self>, mut transport_rx: mpsc::Receiver<SipEvent>) {
        let taken = self
            .internal_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut internal_rx) = taken else {
            warn!("engine event loop started twice");
            return;
        };

        let mut gc = tokio::time::interval(self.ctx.config.timers.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("call engine running");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                event = transport_rx.recv() => match event {
                    Some(event) => self.dispatch_sip_event(event).await,
                    None => break,
                },
                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,
                _ = gc.tick() => self.collect_garbage(),
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        self.teardown_all().await;
        info!("call engine stopped");
    }

    /// Stop the event loop. Safe to call from any task, more than once,
    /// and before `run` has started.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    async fn teardown_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let Some((_, leg)) = self.connections.remove(&id) else {
                continue;
            };
            let mut guard = leg.lock().await;
            if !guard.is_terminal() {
                if let Err(err) = guard.hangup().await {
                    debug!(connection = %id, error = %err, "hangup during shutdown failed");
                }
            }
            guard.finalize().await;
        }
        self.dialogs.clear();
    }

    async fn handle_internal(&self, msg: EngineMsg) {
        match msg {
            EngineMsg::Retransmit(id) => self.retransmit(id).await,
            EngineMsg::OfferingExpired(id) => {
                if let Some(leg) = self.lookup(id) {
                    leg.lock().await.on_offering_expired().await;
                }
            }
            EngineMsg::RingNoAnswer(id) => {
                if let Some(leg) = self.lookup(id) {
                    leg.lock().await.on_ring_no_answer().await;
                }
            }
            EngineMsg::CancelSafetyExpired(id) => {
                if let Some(leg) = self.lookup(id) {
                    leg.lock().await.on_cancel_safety_expired().await;
                }
            }
            EngineMsg::ReinviteRetry(id) => {
                if let Some(leg) = self.lookup(id) {
                    leg.lock().await.retry_reinvite().await;
                }
            }
            EngineMsg::DropConnection(id) => self.drop_connection(id).await,
            EngineMsg::HangupConnection(id) => {
                if let Some(leg) = self.lookup(id) {
                    if let Err(err) = leg.lock().await.hangup().await {
                        debug!(connection = %id, error = %err, "deferred hangup failed");
                    }
                }
            }
            EngineMsg::TransferDial {
                origin,
                target,
                referred_by,
            } => {
                self.dial_transfer_target(origin, target, referred_by).await;
            }
            EngineMsg::TransferProgress { origin, status } => {
                if let Some(leg) = self.lookup(origin) {
                    leg.lock().await.notify_transfer_progress(status).await;
                }
            }
        }
    }

    /// Resend or give up on a transaction whose timer fired.
    ///
    /// An exhausted outgoing request is answered with a synthesized 408 so
    /// the owning leg sees an ordinary final response; an exhausted
    /// incoming INVITE final is simply abandoned, the dialog stands.
    async fn retransmit(&self, id: TransactionId) {
        let Some(mut txn) = self.ctx.table.lock(id).await else {
            return;
        };
        let direction = txn.meta().direction;
        let t2 = self.ctx.config.timers.t2();
        match txn.on_resend_timer(t2, direction) {
            ResendOutcome::Settled => {
                txn.retransmit_timer = None;
            }
            ResendOutcome::Resend(wait) => {
                let message: Option<Message> = match direction {
                    Direction::Outgoing => Some(txn.request.clone().into()),
                    Direction::Incoming => txn.last_final.clone().map(Message::from),
                };
                let Some(message) = message else {
                    txn.retransmit_timer = None;
                    return;
                };
                txn.retransmit_timer = Some(schedule(
                    wait,
                    self.ctx.internal.clone(),
                    EngineMsg::Retransmit(id),
                ));
                drop(txn);
                if let Err(err) = self.ctx.transport.send(message).await {
                    debug!(id = %id, error = %err, "retransmission failed");
                }
            }
            ResendOutcome::Exhausted => {
                txn.retransmit_timer = None;
                match direction {
                    Direction::Incoming => {
                        warn!(id = %id, "final response never acknowledged, giving up");
                    }
                    Direction::Outgoing => {
                        let timeout =
                            Response::to_request(StatusCode::RequestTimeout, &txn.request);
                        drop(txn);
                        debug!(id = %id, "request exhausted its retransmissions");
                        self.dispatch_sip_event(SipEvent::inbound(timeout)).await;
                    }
                }
            }
        }
    }

    async fn drop_connection(&self, id: ConnectionId) {
        let Some((_, leg)) = self.connections.remove(&id) else {
            return;
        };
        let mut guard = leg.lock().await;
        let call_id = guard.call_id().to_string();
        guard.finalize().await;
        drop(guard);
        self.forget_dialog(&call_id, id);
        debug!(connection = %id, "connection dropped");
    }

    fn collect_garbage(&self) {
        let timers = &self.ctx.config.timers;
        let removed = self
            .ctx
            .table
            .remove_old(timers.state_timeout(), timers.invite_timeout);
        if removed > 0 {
            debug!(
                removed,
                remaining = self.ctx.table.len(),
                "expired transactions collected"
            );
        }
    }

    // ---- leg registry ---------------------------------------------------

    fn next_connection_id(&self) -> (ConnectionId, u64) {
        let raw = self.next_connection.fetch_add(1, Ordering::Relaxed);
        (ConnectionId::from_raw(raw), raw)
    }

    fn register(&self, connection: Connection) -> Arc<Mutex<Connection>> {
        let id = connection.id();
        let call_id = connection.call_id().to_string();
        let leg = Arc::new(Mutex::new(connection));
        self.connections.insert(id, Arc::clone(&leg));
        self.dialogs.entry(call_id).or_default().push(id);
        leg
    }

    fn forget_dialog(&self, call_id: &str, id: ConnectionId) {
        if let Some(mut legs) = self.dialogs.get_mut(call_id) {
            legs.retain(|other| *other != id);
        }
        self.dialogs.remove_if(call_id, |_, legs| legs.is_empty());
    }

    pub(crate) fn lookup(&self, id: ConnectionId) -> Option<Arc<Mutex<Connection>>> {
        self.connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn connection(&self, id: ConnectionId) -> Result<Arc<Mutex<Connection>>> {
        self.lookup(id).ok_or(CallError::ConnectionNotFound { id })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CallError::EngineStopped);
        }
        Ok(())
    }

    // ---- public call control --------------------------------------------

    /// Originate a call toward `remote`. The returned id is live
    /// immediately; progress arrives as lifecycle events.
    pub async fn dial(&self, remote: Uri) -> Result<ConnectionId> {
        self.ensure_running()?;
        let (id, call_index) = self.next_connection_id();
        let connection = Connection::new_outbound(id, call_index, self.ctx.clone(), remote);
        let leg = self.register(connection);
        let mut guard = leg.lock().await;
        guard.emitter().emit_with_remote(
            CallEventKind::NewCall,
            CauseCode::Normal,
            guard.remote().clone(),
        );
        // On failure the leg has already failed itself and will be dropped
        // through the normal linger path.
        guard.dial().await?;
        Ok(id)
    }

    /// Hang up a leg in whatever state it is in.
    pub async fn hangup(&self, id: ConnectionId) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.hangup().await
    }

    /// Signal ringing on an inbound leg, with early media when asked.
    pub async fn accept(&self, id: ConnectionId, early_media: bool) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.accept(early_media).await
    }

    /// Answer an inbound leg with a 200.
    pub async fn answer(&self, id: ConnectionId) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.answer().await
    }

    /// Refuse an inbound leg. `status` defaults to 486 Busy Here.
    pub async fn reject(&self, id: ConnectionId, status: Option<StatusCode>) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.reject(status).await
    }

    /// Deflect an unanswered inbound leg to another party.
    pub async fn redirect(&self, id: ConnectionId, target: Uri) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.redirect(target).await
    }

    /// Put an established leg on hold.
    pub async fn hold(&self, id: ConnectionId) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.hold().await
    }

    /// Resume a leg this side put on hold.
    pub async fn off_hold(&self, id: ConnectionId) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.off_hold().await
    }

    /// Blind-transfer an established leg to `target`.
    pub async fn transfer(&self, id: ConnectionId, target: Uri) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?.lock().await.transfer(target).await
    }

    /// Send application data in an INFO on an established leg.
    pub async fn send_info(
        &self,
        id: ConnectionId,
        content_type: impl Into<String>,
        data: bytes::Bytes,
    ) -> Result<()> {
        self.ensure_running()?;
        self.connection(id)?
            .lock()
            .await
            .send_info(content_type, data)
            .await
    }

    // ---- introspection --------------------------------------------------

    pub async fn connection_state(&self, id: ConnectionId) -> Result<ConnectionState> {
        let leg = self.connection(id)?;
        let state = leg.lock().await.state();
        Ok(state)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.ctx.table.len()
    }

    // ---- transfer consult leg -------------------------------------------

    /// Dial the target a REFER named, marked so its progress is reported
    /// back to `origin` as NOTIFYs.
    async fn dial_transfer_target(
        &self,
        origin: ConnectionId,
        target: ReferTo,
        referred_by: Option<NameAddr>,
    ) {
        let (id, call_index) = self.next_connection_id();
        let mut connection =
            Connection::new_outbound(id, call_index, self.ctx.clone(), target.target.uri.clone());
        connection.transfer = Some(TransferRole::Target { origin });
        connection.referred_by = referred_by;
        connection.outgoing_replaces = target.replaces;
        let leg = self.register(connection);
        let mut guard = leg.lock().await;
        guard.emitter().emit_with_remote(
            CallEventKind::NewCall,
            CauseCode::TransferInitiated,
            guard.remote().clone(),
        );
        // Failures are reported to the transferor by the leg itself.
        if let Err(err) = guard.dial().await {
            warn!(connection = %id, origin = %origin, error = %err, "transfer dial failed");
        }
    }
}
