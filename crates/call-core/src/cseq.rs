//! Per-dialog CSeq allocation.
//!
//! One shared counter feeds every request category, so each new transaction
//! gets a strictly higher number. A category with a transaction still in
//! flight refuses to start another; the caller queues or rejects instead of
//! interleaving two INVITEs or two REFERs on the same dialog.

use ferrovox_sip_types::Method;

/// Request categories that are sequenced independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CSeqCategory {
    Invite,
    Refer,
    Notify,
    Options,
    Info,
}

const CATEGORY_COUNT: usize = 5;

impl CSeqCategory {
    fn index(self) -> usize {
        match self {
            CSeqCategory::Invite => 0,
            CSeqCategory::Refer => 1,
            CSeqCategory::Notify => 2,
            CSeqCategory::Options => 3,
            CSeqCategory::Info => 4,
        }
    }

    /// Category for a request method. ACK and CANCEL ride on the INVITE
    /// they target and BYE ends the dialog outright, so none of those maps
    /// to a category of its own.
    pub fn from_method(method: Method) -> Option<Self> {
        match method {
            Method::Invite => Some(CSeqCategory::Invite),
            Method::Refer => Some(CSeqCategory::Refer),
            Method::Notify => Some(CSeqCategory::Notify),
            Method::Options => Some(CSeqCategory::Options),
            Method::Info => Some(CSeqCategory::Info),
            Method::Ack | Method::Cancel | Method::Bye => None,
        }
    }
}

/// Sequence numbers for one dialog's outbound requests.
#[derive(Debug, Clone)]
pub struct CSeqManager {
    next: u32,
    in_flight: [Option<u32>; CATEGORY_COUNT],
}

impl CSeqManager {
    pub fn new() -> Self {
        Self::with_start(1)
    }

    pub fn with_start(next: u32) -> Self {
        CSeqManager {
            next,
            in_flight: [None; CATEGORY_COUNT],
        }
    }

    /// Allocate the next number for `category`, or `None` if a transaction
    /// of that category is already in flight.
    pub fn start_transaction(&mut self, category: CSeqCategory) -> Option<u32> {
        let slot = &mut self.in_flight[category.index()];
        if slot.is_some() {
            return None;
        }
        let seq = self.next;
        self.next += 1;
        *slot = Some(seq);
        Some(seq)
    }

    /// Mark the in-flight transaction of `category` complete.
    pub fn end_transaction(&mut self, category: CSeqCategory) {
        self.in_flight[category.index()] = None;
    }

    pub fn in_flight(&self, category: CSeqCategory) -> Option<u32> {
        self.in_flight[category.index()]
    }

    pub fn is_in_flight(&self, category: CSeqCategory) -> bool {
        self.in_flight[category.index()].is_some()
    }

    /// True when `seq` is the number of the transaction currently in
    /// flight for `category`. A mismatch marks a stale response.
    pub fn matches(&self, category: CSeqCategory, seq: u32) -> bool {
        self.in_flight[category.index()] == Some(seq)
    }

    /// Allocate a number outside the category gates, for requests that
    /// never overlap themselves (BYE).
    pub fn allocate(&mut self) -> u32 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// Adopt a number chosen outside this manager, such as a request the
    /// transport resent with credentials under a fresh CSeq. The category
    /// becomes in flight under `seq` and later allocations stay above it.
    pub fn observe_external(&mut self, category: CSeqCategory, seq: u32) {
        self.next = self.next.max(seq.saturating_add(1));
        self.in_flight[category.index()] = Some(seq);
    }

    /// Highest number handed out so far, or zero before the first.
    pub fn last_allocated(&self) -> u32 {
        self.next.saturating_sub(1)
    }
}

impl Default for CSeqManager {
    fn default() -> Self {
        Self::new()
    }
}
