//! The process-wide transaction registry.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use ferrovox_sip_types::{Message, Method, Request};

use crate::connection::ConnectionId;
use crate::transaction::{
    Direction, Relationship, TransactionData, TransactionId, TransactionKind, TransactionMeta,
};

/// One registered transaction: fixed identity plus locked state.
#[derive(Debug)]
pub struct TransactionSlot {
    pub meta: TransactionMeta,
    pub data: Arc<Mutex<TransactionData>>,
}

/// A found transaction, held busy. Dropping this releases it.
#[derive(Debug)]
pub struct LockedTransaction {
    slot: Arc<TransactionSlot>,
    guard: OwnedMutexGuard<TransactionData>,
}

impl LockedTransaction {
    pub fn id(&self) -> TransactionId {
        self.slot.meta.id
    }

    pub fn meta(&self) -> &TransactionMeta {
        &self.slot.meta
    }

    pub fn slot(&self) -> &Arc<TransactionSlot> {
        &self.slot
    }
}

impl Deref for LockedTransaction {
    type Target = TransactionData;

    fn deref(&self) -> &TransactionData {
        &self.guard
    }
}

impl DerefMut for LockedTransaction {
    fn deref_mut(&mut self) -> &mut TransactionData {
        &mut self.guard
    }
}

/// In-flight transactions, bucketed by Call-ID.
///
/// The bucket map mutex covers structural changes only and is never held
/// across an await. Matching clones the candidate list out, then takes
/// each candidate's own lock to inspect learned state.
#[derive(Debug)]
pub struct TransactionTable {
    buckets: StdMutex<HashMap<String, Vec<Arc<TransactionSlot>>>>,
    index: DashMap<TransactionId, Arc<TransactionSlot>>,
    next_id: AtomicU64,
    t1: Duration,
}

impl TransactionTable {
    pub fn new(t1: Duration) -> Self {
        TransactionTable {
            buckets: StdMutex::new(HashMap::new()),
            index: DashMap::new(),
            next_id: AtomicU64::new(1),
            t1,
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<TransactionSlot>>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a transaction for `request` and hand it back already busy.
    ///
    /// Returns `None` if an identical key is already present; callers are
    /// expected to have checked with [`find`](Self::find) first, so this
    /// logs rather than panics.
    pub fn add(
        &self,
        kind: TransactionKind,
        direction: Direction,
        request: Request,
        owner: Option<ConnectionId>,
    ) -> Option<LockedTransaction> {
        let id = TransactionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let meta = TransactionMeta::for_request(id, kind, direction, &request, owner);
        let data = Arc::new(Mutex::new(TransactionData::new(request, self.t1)));
        let Ok(guard) = Arc::clone(&data).try_lock_owned() else {
            return None;
        };
        let slot = Arc::new(TransactionSlot {
            meta: meta.clone(),
            data,
        });

        {
            let mut buckets = self.buckets();
            let bucket = buckets.entry(meta.call_id.clone()).or_default();
            if bucket.iter().any(|existing| existing.meta.same_key(&meta)) {
                warn!(call_id = %meta.call_id, seq = meta.seq, method = %meta.method,
                    "transaction already registered, refusing duplicate");
                return None;
            }
            bucket.push(Arc::clone(&slot));
        }
        self.index.insert(id, Arc::clone(&slot));
        debug!(id = %id, call_id = %slot.meta.call_id, method = %slot.meta.method,
            direction = ?slot.meta.direction, "transaction added");
        Some(LockedTransaction { slot, guard })
    }

    /// Match `message` to a transaction and classify the relationship.
    ///
    /// `outgoing` says the message is ours and about to be sent; matching
    /// direction flips accordingly (an outgoing response belongs to an
    /// incoming request transaction and vice versa). The returned
    /// transaction is busy until dropped.
    pub async fn find(
        &self,
        message: &Message,
        outgoing: bool,
    ) -> (Option<LockedTransaction>, Relationship) {
        let wanted_direction = match (message.is_request(), outgoing) {
            (true, true) | (false, false) => Direction::Outgoing,
            (true, false) | (false, true) => Direction::Incoming,
        };

        let candidates: Vec<Arc<TransactionSlot>> = {
            let buckets = self.buckets();
            buckets
                .get(message.call_id())
                .map(|bucket| bucket.to_vec())
                .unwrap_or_default()
        };

        for slot in candidates {
            if slot.meta.direction != wanted_direction {
                continue;
            }
            let prefilter = match message {
                Message::Request(req) => slot.meta.prefilter_request(req),
                Message::Response(resp) => slot.meta.prefilter_response(resp),
            };
            if !prefilter {
                continue;
            }

            let mut guard = Arc::clone(&slot.data).lock_owned().await;
            let relationship = match message {
                Message::Request(req) => {
                    guard.classify_request(req, slot.meta.method, slot.meta.direction)
                }
                Message::Response(resp) => guard.classify_response(resp, slot.meta.method),
            };
            if let Some(relationship) = relationship {
                return (Some(LockedTransaction { slot, guard }), relationship);
            }
        }

        if message.is_request() {
            (None, Relationship::Request)
        } else {
            (None, Relationship::Unknown)
        }
    }

    /// Look a transaction up by id and take its lock.
    pub async fn lock(&self, id: TransactionId) -> Option<LockedTransaction> {
        let slot = self.index.get(&id).map(|entry| Arc::clone(entry.value()))?;
        let guard = Arc::clone(&slot.data).lock_owned().await;
        Some(LockedTransaction { slot, guard })
    }

    /// Drop an outgoing transaction another request has superseded, such as
    /// an original the transport resent under fresh credentials. Dropping
    /// the slot cancels its retransmit timer.
    pub fn retire(&self, call_id: &str, owner: ConnectionId, method: Method, seq: u32) {
        let mut buckets = self.buckets();
        let Some(bucket) = buckets.get_mut(call_id) else {
            return;
        };
        bucket.retain(|slot| {
            let superseded = slot.meta.direction == Direction::Outgoing
                && slot.meta.owner == Some(owner)
                && slot.meta.method == method
                && slot.meta.seq == seq;
            if superseded {
                self.index.remove(&slot.meta.id);
                debug!(id = %slot.meta.id, call_id = %slot.meta.call_id, seq,
                    "superseded transaction retired");
            }
            !superseded
        });
        if bucket.is_empty() {
            buckets.remove(call_id);
        }
    }

    /// Drop transactions idle longer than their cutoff. A busy transaction
    /// is never removed; it is retried on the next sweep.
    pub fn remove_old(&self, cutoff: Duration, invite_cutoff: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut buckets = self.buckets();
        buckets.retain(|_, bucket| {
            bucket.retain(|slot| {
                let Ok(data) = slot.data.try_lock() else {
                    return true;
                };
                let limit = if slot.meta.method == Method::Invite {
                    invite_cutoff
                } else {
                    cutoff
                };
                let expired = now.duration_since(data.last_activity) >= limit;
                if expired {
                    self.index.remove(&slot.meta.id);
                    removed += 1;
                    debug!(id = %slot.meta.id, call_id = %slot.meta.call_id,
                        method = %slot.meta.method, "transaction expired");
                }
                !expired
            });
            !bucket.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrovox_sip_types::{Party, Response, StatusCode, Uri};

    fn t1() -> Duration {
        Duration::from_millis(500)
    }

    fn invite(call_id: &str, seq: u32) -> Request {
        Request::new(
            Method::Invite,
            Uri::sip("b.test").with_user("bob"),
            call_id.to_string(),
            Party::new(Uri::sip("a.test").with_user("alice")).with_tag("ft"),
            Party::new(Uri::sip("b.test").with_user("bob")),
            seq,
        )
    }

    #[tokio::test]
    async fn response_matches_outgoing_transaction() {
        let table = TransactionTable::new(t1());
        let txn = table
            .add(TransactionKind::Ua, Direction::Outgoing, invite("c1", 1), None)
            .unwrap();
        drop(txn);

        let ringing: Message = Response::to_request(StatusCode::Ringing, &invite("c1", 1))
            .with_to_tag("tt")
            .into();
        let (found, rel) = table.find(&ringing, false).await;
        assert_eq!(rel, Relationship::Provisional);
        assert!(found.is_some());
        drop(found);

        let ok: Message = Response::to_request(StatusCode::Ok, &invite("c1", 1))
            .with_to_tag("tt")
            .into();
        let (found, rel) = table.find(&ok, false).await;
        assert_eq!(rel, Relationship::Final);
        drop(found);

        let (_, rel) = table.find(&ok, false).await;
        assert_eq!(rel, Relationship::Duplicate);
    }

    #[tokio::test]
    async fn unrelated_response_is_unknown() {
        let table = TransactionTable::new(t1());
        drop(table.add(TransactionKind::Ua, Direction::Outgoing, invite("c1", 1), None));
        let stray: Message = Response::to_request(StatusCode::Ok, &invite("c1", 5)).into();
        let (found, rel) = table.find(&stray, false).await;
        assert!(found.is_none());
        assert_eq!(rel, Relationship::Unknown);
    }

    #[tokio::test]
    async fn unmatched_request_invites_creation() {
        let table = TransactionTable::new(t1());
        let inbound: Message = invite("fresh", 1).into();
        let (found, rel) = table.find(&inbound, false).await;
        assert!(found.is_none());
        assert_eq!(rel, Relationship::Request);
    }

    #[tokio::test]
    async fn duplicate_key_is_refused() {
        let table = TransactionTable::new(t1());
        drop(table.add(TransactionKind::Ua, Direction::Outgoing, invite("c1", 1), None));
        assert!(table
            .add(TransactionKind::Ua, Direction::Outgoing, invite("c1", 1), None)
            .is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn inbound_cancel_finds_incoming_invite() {
        let table = TransactionTable::new(t1());
        drop(table.add(TransactionKind::Ua, Direction::Incoming, invite("c2", 9), None));

        let mut cancel = invite("c2", 9);
        cancel.method = Method::Cancel;
        cancel.cseq.method = Method::Cancel;
        let (found, rel) = table.find(&cancel.clone().into(), false).await;
        assert_eq!(rel, Relationship::Cancel);
        drop(found);

        let (_, rel) = table.find(&cancel.into(), false).await;
        assert_eq!(rel, Relationship::Duplicate);
    }

    #[tokio::test]
    async fn retire_removes_only_the_superseded_key() {
        let table = TransactionTable::new(t1());
        let owner = ConnectionId::from_raw(3);
        drop(table.add(
            TransactionKind::Ua,
            Direction::Outgoing,
            invite("c3", 1),
            Some(owner),
        ));
        drop(table.add(
            TransactionKind::Ua,
            Direction::Outgoing,
            invite("c3", 10),
            Some(owner),
        ));

        table.retire("c3", owner, Method::Invite, 1);
        assert_eq!(table.len(), 1);

        let ok: Message = Response::to_request(StatusCode::Ok, &invite("c3", 1)).into();
        let (found, rel) = table.find(&ok, false).await;
        assert!(found.is_none());
        assert_eq!(rel, Relationship::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_spares_young_and_busy_transactions() {
        let table = TransactionTable::new(t1());
        let busy = table
            .add(TransactionKind::Ua, Direction::Outgoing, invite("old", 1), None)
            .unwrap();
        drop(table.add(TransactionKind::Ua, Direction::Outgoing, invite("young", 1), None));

        tokio::time::advance(Duration::from_secs(60)).await;
        // "young" refreshed by a match, "old" held busy: neither may go.
        let ok: Message = Response::to_request(StatusCode::Ok, &invite("young", 1)).into();
        let (found, _) = table.find(&ok, false).await;
        drop(found);

        assert_eq!(table.remove_old(Duration::from_secs(40), Duration::from_secs(40)), 0);
        drop(busy);
        assert_eq!(table.remove_old(Duration::from_secs(40), Duration::from_secs(40)), 1);
        assert_eq!(table.len(), 1);
    }
}
