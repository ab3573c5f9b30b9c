//! Frames: the per-var ordering record.
//!
//! One frame exists per committed write on a var. The newest frame is
//! the var's current version; reads attach to the frame whose writes
//! clock they match, queued writes line up behind the newest frame, and
//! parents are retired once drained of committed-but-unreported readers.
//!
//! # Invariants
//!
//! - At most one uncommitted write descends from a frame at a time;
//!   later queued writers vote deadlock.
//! - A frame is *idle* iff it has no pending reads or writes.
//! - A frame is *empty* iff idle and every committed reader has been
//!   reported globally complete.

use std::collections::{HashMap, HashSet};

use tessera_types::{TxnId, VectorClock};

/// Monotone per-var frame sequence number. Identifies a frame within
/// its var across the chain's lifetime.
pub type FrameId = u64;

/// Whether a queued writer also reads (read-write or roll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub txn_id: TxnId,
    pub is_read_write: bool,
}

/// A single link of a var's frame chain.
#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,

    /// The txn whose commit created this frame; `None` only for the
    /// genesis frame of a var that has never been written.
    pub txn_id: Option<TxnId>,

    /// The read-set clock of that txn at commit.
    pub txn_clock: VectorClock,

    /// The writes clock: this var's element is the version readers must
    /// claim.
    pub writes_clock: VectorClock,

    /// Reads attached and awaiting outcome, keyed by claimed version.
    pending_reads: HashMap<TxnId, u64>,

    /// Writers queued on this frame in arrival order. Only the first
    /// can commit.
    pending_writes: Vec<PendingWrite>,

    /// Reads that committed but have not yet been reported globally
    /// complete.
    committed_reads: HashSet<TxnId>,
}

impl Frame {
    pub fn new(
        id: FrameId,
        txn_id: Option<TxnId>,
        txn_clock: VectorClock,
        writes_clock: VectorClock,
    ) -> Self {
        Self {
            id,
            txn_id,
            txn_clock,
            writes_clock,
            pending_reads: HashMap::new(),
            pending_writes: Vec::new(),
            committed_reads: HashSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // Attachment
    // ------------------------------------------------------------------

    pub fn add_read(&mut self, txn_id: TxnId, version: u64) {
        self.pending_reads.insert(txn_id, version);
    }

    pub fn add_write(&mut self, txn_id: TxnId, is_read_write: bool) {
        debug_assert!(
            !self.pending_writes.iter().any(|w| w.txn_id == txn_id),
            "duplicate pending write"
        );
        self.pending_writes.push(PendingWrite {
            txn_id,
            is_read_write,
        });
    }

    /// Whether `txn_id` is the frame's first queued writer.
    pub fn is_first_pending_write(&self, txn_id: &TxnId) -> bool {
        self.pending_writes.first().map(|w| &w.txn_id) == Some(txn_id)
    }

    pub fn has_pending_write(&self, txn_id: &TxnId) -> bool {
        self.pending_writes.iter().any(|w| &w.txn_id == txn_id)
    }

    pub fn has_any_pending_write(&self) -> bool {
        !self.pending_writes.is_empty()
    }

    pub fn has_pending_read(&self, txn_id: &TxnId) -> bool {
        self.pending_reads.contains_key(txn_id)
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    /// A pending read committed: it now awaits its TGC.
    pub fn read_committed(&mut self, txn_id: &TxnId) {
        let was = self.pending_reads.remove(txn_id);
        debug_assert!(was.is_some(), "read committed without attachment");
        self.committed_reads.insert(*txn_id);
    }

    pub fn read_aborted(&mut self, txn_id: &TxnId) {
        self.pending_reads.remove(txn_id);
    }

    /// A queued writer resolved (committed or aborted) and leaves the
    /// queue. Committed writers live on as the child frame.
    pub fn write_resolved(&mut self, txn_id: &TxnId) {
        self.pending_writes.retain(|w| &w.txn_id != txn_id);
    }

    /// A reader learnt post-outcome without ever attaching: record it
    /// straight into the committed set so TGC bookkeeping still works.
    pub fn read_learnt(&mut self, txn_id: TxnId) {
        self.committed_reads.insert(txn_id);
    }

    /// TGC for a committed reader.
    pub fn read_globally_complete(&mut self, txn_id: &TxnId) {
        self.committed_reads.remove(txn_id);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// No pending work awaiting an outcome.
    pub fn is_idle(&self) -> bool {
        self.pending_reads.is_empty() && self.pending_writes.is_empty()
    }

    /// Idle and fully drained of committed-but-unreported readers.
    pub fn is_empty(&self) -> bool {
        self.is_idle() && self.committed_reads.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::VectorClockBuilder;

    fn txn(n: u64) -> TxnId {
        TxnId::from_parts(n, Default::default(), Default::default(), Default::default())
    }

    fn frame() -> Frame {
        Frame::new(
            0,
            None,
            VectorClock::new(),
            VectorClockBuilder::new().build(),
        )
    }

    #[test]
    fn genesis_frame_is_empty() {
        let f = frame();
        assert!(f.is_idle());
        assert!(f.is_empty());
    }

    #[test]
    fn reads_move_through_lifecycle() {
        let mut f = frame();
        f.add_read(txn(1), 0);
        assert!(!f.is_idle());

        f.read_committed(&txn(1));
        assert!(f.is_idle());
        assert!(!f.is_empty());

        f.read_globally_complete(&txn(1));
        assert!(f.is_empty());
    }

    #[test]
    fn aborted_read_leaves_no_trace() {
        let mut f = frame();
        f.add_read(txn(1), 0);
        f.read_aborted(&txn(1));
        assert!(f.is_empty());
    }

    #[test]
    fn only_first_writer_is_first() {
        let mut f = frame();
        f.add_write(txn(1), false);
        f.add_write(txn(2), true);
        assert!(f.is_first_pending_write(&txn(1)));
        assert!(!f.is_first_pending_write(&txn(2)));

        f.write_resolved(&txn(1));
        assert!(f.is_first_pending_write(&txn(2)));
        f.write_resolved(&txn(2));
        assert!(f.is_idle());
    }

    #[test]
    fn learnt_reads_await_tgc() {
        let mut f = frame();
        f.read_learnt(txn(3));
        assert!(f.is_idle());
        assert!(!f.is_empty());
        f.read_globally_complete(&txn(3));
        assert!(f.is_empty());
    }
}
