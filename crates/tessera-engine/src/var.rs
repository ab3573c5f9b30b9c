//! The var state machine.
//!
//! A [`Var`] serializes all transaction traffic for one object. It owns
//! the frame chain, votes on incoming actions, reacts to outcomes by
//! growing the chain, and schedules durable writes with coalescing.
//!
//! The machine is pure apart from arrival-time tracking: every event
//! returns a [`VarOutput`] describing the ballot to emit, the disk
//! write to schedule, and whether the var has gone idle. The
//! [`VarManager`](crate::var_manager::VarManager) owns the impure edges
//! (store I/O, eviction, roll submission).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use tessera_types::{Ballot, Positions, Txn, TxnId, VarRecord, VarUUId, VectorClock};

use crate::frame::{Frame, FrameId};
use crate::poisson::Poisson;

/// A roll is only considered once the chance of another arrival within
/// this window drops below [`ROLL_P_REQUIREMENT`].
pub const ROLL_TIME_EXPECTATION: Duration = Duration::from_millis(3);

/// See [`ROLL_TIME_EXPECTATION`].
pub const ROLL_P_REQUIREMENT: f64 = 0.9;

// ============================================================================
// Events and outputs
// ============================================================================

/// The slice of a transaction's action relevant to one var's vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarTxnAction {
    Read { version: u64 },
    Write,
    ReadWrite { version: u64 },
    Roll { version: u64 },
}

impl VarTxnAction {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            VarTxnAction::Read { .. } | VarTxnAction::ReadWrite { .. } | VarTxnAction::Roll { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, VarTxnAction::Read { .. })
    }

    pub fn read_version(&self) -> Option<u64> {
        match self {
            VarTxnAction::Read { version }
            | VarTxnAction::ReadWrite { version }
            | VarTxnAction::Roll { version } => Some(*version),
            VarTxnAction::Write => None,
        }
    }
}

/// Events a var processes. All arrive on the var's executor shard.
#[derive(Debug)]
pub enum VarEvent {
    /// An action before its outcome: classify, attach, vote.
    ReceiveTxn {
        txn_id: TxnId,
        action: VarTxnAction,
    },

    /// A decided outcome for a txn that (maybe) touched this var.
    ReceiveOutcome {
        txn_id: TxnId,
        committed: bool,
        clock: VectorClock,
        is_read: bool,
        is_write: bool,
        /// The txn itself; required for committed writes (it is
        /// persisted alongside the var record).
        txn: Option<Arc<Txn>>,
        /// Positions carried by a create action, installed at first
        /// commit.
        positions: Option<Positions>,
    },

    /// TGC: every replica has the outcome; readers can be forgotten.
    GloballyComplete { txn_id: TxnId, is_write: bool },

    /// The store confirmed the frame's durable write.
    WriteCompleted { frame_id: FrameId },
}

/// A durable write the manager must submit: persist the txn blob and
/// the var record, delete the previously referenced txn.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub frame_id: FrameId,
    pub record: VarRecord,
    pub txn: Arc<Txn>,
    pub delete_txn: Option<TxnId>,
}

/// What processing one event produced.
#[derive(Debug, Default)]
pub struct VarOutput {
    pub ballot: Option<Ballot>,
    pub write: Option<WriteRequest>,
    /// True when the action was a pure learn (no prior attachment) and
    /// is immediately locally complete.
    pub learnt: bool,
    /// True when the var has no pending work, no write in flight, and
    /// may be handed back to the manager for eviction.
    pub idle: bool,
}

// ============================================================================
// Write scheduling
// ============================================================================

#[derive(Debug)]
enum WriteState {
    Idle,
    /// A store txn is in flight for this frame.
    Writing(FrameId),
    /// In flight, plus the newest frame queued behind it. Overwritten
    /// by later frames: only the latest queued write survives.
    WritingQueued(FrameId, Box<QueuedWrite>),
}

#[derive(Debug)]
struct QueuedWrite {
    frame_id: FrameId,
    record: VarRecord,
    txn: Arc<Txn>,
}

// ============================================================================
// Var
// ============================================================================

/// One object's serialization point.
#[derive(Debug)]
pub struct Var {
    pub uuid: VarUUId,
    pub positions: Option<Positions>,

    /// Frame chain, oldest front, current back. Never empty.
    frames: VecDeque<Frame>,
    next_frame_id: FrameId,

    /// The frame the store currently holds, and the txn its record
    /// references.
    on_disk: Option<FrameId>,
    on_disk_txn: Option<TxnId>,

    write_state: WriteState,
    poisson: Poisson,
}

impl Var {
    /// A brand-new var awaiting its create action. The genesis frame
    /// has no writer and version 0.
    pub fn new(uuid: VarUUId) -> Self {
        let genesis = Frame::new(0, None, VectorClock::new(), VectorClock::new());
        Self {
            uuid,
            positions: None,
            frames: VecDeque::from([genesis]),
            next_frame_id: 1,
            on_disk: None,
            on_disk_txn: None,
            write_state: WriteState::Idle,
            poisson: Poisson::new(),
        }
    }

    /// Rehydrates a var from its durable record: one frame, already on
    /// disk.
    pub fn from_record(record: VarRecord) -> Self {
        debug!(var = %record.var, txn = %record.write_txn_id, "restored");
        let frame = Frame::new(
            0,
            Some(record.write_txn_id),
            record.write_txn_clock,
            record.writes_clock,
        );
        Self {
            uuid: record.var,
            positions: Some(record.positions),
            frames: VecDeque::from([frame]),
            next_frame_id: 1,
            on_disk: Some(0),
            on_disk_txn: Some(record.write_txn_id),
            write_state: WriteState::Idle,
            poisson: Poisson::new(),
        }
    }

    fn cur(&self) -> &Frame {
        self.frames.back().expect("frame chain never empty")
    }

    fn cur_mut(&mut self) -> &mut Frame {
        self.frames.back_mut().expect("frame chain never empty")
    }

    /// The version readers must claim to commit against this var.
    pub fn current_version(&self) -> u64 {
        self.cur().writes_clock.at(&self.uuid)
    }

    pub fn current_frame_txn(&self) -> Option<TxnId> {
        self.cur().txn_id
    }

    pub fn frame_chain_len(&self) -> usize {
        self.frames.len()
    }

    /// The record that would persist the current frame.
    pub fn record(&self) -> Option<VarRecord> {
        let cur = self.cur();
        Some(VarRecord {
            var: self.uuid,
            positions: self.positions.clone()?,
            write_txn_id: cur.txn_id?,
            write_txn_clock: cur.txn_clock.clone(),
            writes_clock: cur.writes_clock.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    pub fn process(&mut self, event: VarEvent, now: Instant) -> VarOutput {
        match event {
            VarEvent::ReceiveTxn { txn_id, action } => {
                self.poisson.add_then(now);
                self.receive_txn(txn_id, action)
            }
            VarEvent::ReceiveOutcome {
                txn_id,
                committed,
                clock,
                is_read,
                is_write,
                txn,
                positions,
            } => {
                self.poisson.add_then(now);
                self.receive_outcome(txn_id, committed, clock, is_read, is_write, txn, positions)
            }
            VarEvent::GloballyComplete { txn_id, is_write } => {
                self.globally_complete(txn_id, is_write)
            }
            VarEvent::WriteCompleted { frame_id } => self.write_completed(frame_id),
        }
    }

    /// Classifies and attaches an action, producing the var's ballot.
    fn receive_txn(&mut self, txn_id: TxnId, action: VarTxnAction) -> VarOutput {
        trace!(var = %self.uuid, txn = %txn_id, ?action, "receive txn");
        let uuid = self.uuid;
        let current_version = self.current_version();
        let merged_clock = self.merged_clock();

        let ballot = match action {
            VarTxnAction::Read { version } => {
                if version == current_version {
                    self.cur_mut().add_read(txn_id, version);
                    Ballot::commit(uuid, merged_clock)
                } else {
                    self.bad_read_ballot(merged_clock)
                }
            }
            VarTxnAction::Write => self.attach_write(txn_id, false, merged_clock),
            VarTxnAction::ReadWrite { version } | VarTxnAction::Roll { version } => {
                if version == current_version {
                    self.attach_write(txn_id, true, merged_clock)
                } else {
                    self.bad_read_ballot(merged_clock)
                }
            }
        };

        self.output(Some(ballot), None, false)
    }

    fn attach_write(&mut self, txn_id: TxnId, is_read_write: bool, clock: VectorClock) -> Ballot {
        let uuid = self.uuid;
        let next_version = self.current_version() + 1;
        let unblocked = !self.cur().has_any_pending_write();
        self.cur_mut().add_write(txn_id, is_read_write);
        if unblocked {
            Ballot::commit(uuid, clock.to_builder().set(uuid, next_version).build())
        } else {
            // A currently pending, earlier-ordered write already holds
            // the frame.
            Ballot {
                var: uuid,
                clock,
                vote: tessera_types::Vote::AbortDeadlock,
            }
        }
    }

    fn bad_read_ballot(&self, clock: VectorClock) -> Ballot {
        Ballot::bad_read(
            self.uuid,
            clock,
            self.cur().txn_id.unwrap_or(TxnId::ZERO),
            Vec::new(),
        )
    }

    /// The frame's read and writes clocks merged: the accepting clock a
    /// ballot carries.
    fn merged_clock(&self) -> VectorClock {
        let cur = self.cur();
        cur.txn_clock
            .to_builder()
            .merge_in_max(&cur.writes_clock)
            .build()
    }

    fn receive_outcome(
        &mut self,
        txn_id: TxnId,
        committed: bool,
        clock: VectorClock,
        is_read: bool,
        is_write: bool,
        txn: Option<Arc<Txn>>,
        positions: Option<Positions>,
    ) -> VarOutput {
        trace!(var = %self.uuid, txn = %txn_id, committed, "receive outcome");

        let attached_write = self
            .frames
            .iter()
            .any(|f| f.has_pending_write(&txn_id));
        let attached_read = self.frames.iter().any(|f| f.has_pending_read(&txn_id));

        if !attached_write && !attached_read {
            // Pure learner for this var: no vote was ever cast here.
            return self.learn_outcome(txn_id, committed, clock, is_read, is_write, txn, positions);
        }

        if !committed {
            if attached_read {
                self.frame_of_read(&txn_id).read_aborted(&txn_id);
            }
            if attached_write {
                self.frame_of_write(&txn_id).write_resolved(&txn_id);
            }
            return self.output(None, None, false);
        }

        let mut write = None;
        if attached_read && !is_write {
            self.frame_of_read(&txn_id).read_committed(&txn_id);
        }
        if attached_write {
            // Read-writes live only in the write queue; their read half
            // is satisfied by the version check at attach time.
            self.frame_of_write(&txn_id).write_resolved(&txn_id);
            write = self.commit_write(txn_id, clock, txn, positions);
        }
        self.output(None, write, false)
    }

    fn frame_of_read(&mut self, txn_id: &TxnId) -> &mut Frame {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| f.has_pending_read(txn_id))
            .unwrap_or_else(|| panic!("read outcome for {txn_id} with no attachment"))
    }

    fn frame_of_write(&mut self, txn_id: &TxnId) -> &mut Frame {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| f.has_pending_write(txn_id))
            .unwrap_or_else(|| panic!("write outcome for {txn_id} with no attachment"))
    }

    /// Installs a committed write as the new current frame and schedules
    /// its durable write.
    fn commit_write(
        &mut self,
        txn_id: TxnId,
        clock: VectorClock,
        txn: Option<Arc<Txn>>,
        positions: Option<Positions>,
    ) -> Option<WriteRequest> {
        let txn = txn.expect("committed write outcome must carry the txn");
        if let Some(p) = positions {
            // Positions are sticky: only the create commit sets them.
            if self.positions.is_none() {
                self.positions = Some(p);
            }
        }

        let uuid = self.uuid;
        let new_version = clock.at(&uuid);
        let writes_clock = self
            .cur()
            .writes_clock
            .to_builder()
            .set(uuid, new_version)
            .build();

        let id = self.next_frame_id;
        self.next_frame_id += 1;
        debug!(var = %uuid, txn = %txn_id, frame = id, version = new_version, "new frame");
        self.frames
            .push_back(Frame::new(id, Some(txn_id), clock, writes_clock));

        let record = self.record().expect("frame just written has a record");
        self.schedule_write(id, record, txn)
    }

    /// Coalescing write scheduler: at most one store txn in flight; the
    /// newest frame replaces any queued predecessor.
    fn schedule_write(
        &mut self,
        frame_id: FrameId,
        record: VarRecord,
        txn: Arc<Txn>,
    ) -> Option<WriteRequest> {
        match &self.write_state {
            WriteState::Idle => {
                self.write_state = WriteState::Writing(frame_id);
                Some(WriteRequest {
                    frame_id,
                    record,
                    txn,
                    delete_txn: self.on_disk_txn,
                })
            }
            WriteState::Writing(in_flight) | WriteState::WritingQueued(in_flight, _) => {
                let in_flight = *in_flight;
                self.write_state = WriteState::WritingQueued(
                    in_flight,
                    Box::new(QueuedWrite {
                        frame_id,
                        record,
                        txn,
                    }),
                );
                None
            }
        }
    }

    fn learn_outcome(
        &mut self,
        txn_id: TxnId,
        committed: bool,
        clock: VectorClock,
        is_read: bool,
        is_write: bool,
        txn: Option<Arc<Txn>>,
        positions: Option<Positions>,
    ) -> VarOutput {
        if !committed {
            return self.output(None, None, true);
        }
        let mut write = None;
        if is_write && clock.at(&self.uuid) > self.current_version() {
            write = self.commit_write(txn_id, clock, txn, positions);
        } else if is_read {
            self.cur_mut().read_learnt(txn_id);
        }
        VarOutput {
            ballot: None,
            write,
            learnt: true,
            idle: self.is_idle(),
        }
    }

    fn globally_complete(&mut self, txn_id: TxnId, is_write: bool) -> VarOutput {
        if !is_write {
            for frame in self.frames.iter_mut() {
                frame.read_globally_complete(&txn_id);
            }
        }
        self.prune_frames();
        self.output(None, None, false)
    }

    fn write_completed(&mut self, frame_id: FrameId) -> VarOutput {
        debug!(var = %self.uuid, frame = frame_id, "written to disk");
        self.on_disk = Some(frame_id);
        self.on_disk_txn = self
            .frames
            .iter()
            .find(|f| f.id == frame_id)
            .and_then(|f| f.txn_id);
        self.prune_frames();

        let next = match std::mem::replace(&mut self.write_state, WriteState::Idle) {
            WriteState::Writing(_) => None,
            WriteState::WritingQueued(_, queued) => {
                let QueuedWrite {
                    frame_id,
                    record,
                    txn,
                } = *queued;
                self.schedule_write(frame_id, record, txn)
            }
            WriteState::Idle => panic!("{}: write completed but no write in flight", self.uuid),
        };
        self.output(None, next, false)
    }

    /// Drops fully drained ancestors of the on-disk frame.
    fn prune_frames(&mut self) {
        let Some(on_disk) = self.on_disk else { return };
        while self.frames.len() > 1 {
            let front = self.frames.front().expect("non-empty");
            if front.id < on_disk && front.is_empty() {
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// No write in flight and no frame has pending work.
    pub fn is_idle(&self) -> bool {
        matches!(self.write_state, WriteState::Idle)
            && self.frames.iter().all(|f| f.is_idle())
    }

    /// Idle, durably current, and drained: safe to report for the
    /// reconfiguration disk barrier.
    pub fn is_on_disk(&self) -> bool {
        self.is_idle()
            && self.on_disk == Some(self.cur().id)
            && self.frames.iter().all(|f| f.is_empty())
    }

    /// Whether a roll would help: the var is idle but its clock drags
    /// entries for other vars that a fresh write would shed.
    pub fn wants_roll(&self, now: Instant) -> bool {
        self.is_idle()
            && self.cur().txn_id.is_some()
            && self.cur().txn_clock.len() > 1
            && self.poisson.p_arrival_within(now, ROLL_TIME_EXPECTATION) < ROLL_P_REQUIREMENT
    }

    fn output(&self, ballot: Option<Ballot>, write: Option<WriteRequest>, learnt: bool) -> VarOutput {
        VarOutput {
            ballot,
            write,
            learnt,
            idle: self.is_idle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{Allocation, BootCount, RMId, VectorClockBuilder, Vote};

    fn uuid(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn txn_id(n: u64) -> TxnId {
        TxnId::from_parts(n, Default::default(), BootCount::new(1), RMId::new(1))
    }

    fn dummy_txn(id: TxnId) -> Arc<Txn> {
        Arc::new(Txn {
            id,
            actions: vec![],
            allocations: vec![Allocation::active(RMId::new(1), BootCount::new(1), vec![])],
            f_inc: 1,
            two_f_inc: 1,
            topology_version: 0,
            is_topology: false,
            retry: false,
        })
    }

    fn now() -> Instant {
        Instant::now()
    }

    /// Drives a write through vote, outcome, and disk completion.
    fn commit_write_at(var: &mut Var, id: TxnId, version: u64) -> VarOutput {
        let out = var.process(
            VarEvent::ReceiveTxn {
                txn_id: id,
                action: VarTxnAction::Write,
            },
            now(),
        );
        assert!(out.ballot.expect("ballot").vote.is_commit());
        let clock = VectorClockBuilder::new().set(var.uuid, version).build();
        var.process(
            VarEvent::ReceiveOutcome {
                txn_id: id,
                committed: true,
                clock,
                is_read: false,
                is_write: true,
                txn: Some(dummy_txn(id)),
                positions: Some(Positions::new(vec![0])),
            },
            now(),
        )
    }

    #[test]
    fn create_then_read_then_write() {
        let mut var = Var::new(uuid(1));
        assert_eq!(var.current_version(), 0);

        // Create commits at version 1, scheduling a disk write.
        let out = commit_write_at(&mut var, txn_id(1), 1);
        let write = out.write.expect("disk write scheduled");
        assert_eq!(write.record.write_txn_id, txn_id(1));
        assert_eq!(var.current_version(), 1);

        // Read at the current version commits.
        let out = var.process(
            VarEvent::ReceiveTxn {
                txn_id: txn_id(2),
                action: VarTxnAction::Read { version: 1 },
            },
            now(),
        );
        let ballot = out.ballot.expect("ballot");
        assert!(ballot.vote.is_commit());
        assert_eq!(ballot.clock.at(&var.uuid), 1);

        // Stale read aborts with the winning txn named.
        let out = var.process(
            VarEvent::ReceiveTxn {
                txn_id: txn_id(3),
                action: VarTxnAction::Read { version: 0 },
            },
            now(),
        );
        match out.ballot.expect("ballot").vote {
            Vote::AbortBadRead { txn_id: winner, .. } => assert_eq!(winner, txn_id(1)),
            other => panic!("expected bad read, got {other:?}"),
        }
    }

    #[test]
    fn second_queued_writer_votes_deadlock() {
        let mut var = Var::new(uuid(1));
        let a = var.process(
            VarEvent::ReceiveTxn {
                txn_id: txn_id(1),
                action: VarTxnAction::Write,
            },
            now(),
        );
        assert!(a.ballot.expect("ballot").vote.is_commit());

        let b = var.process(
            VarEvent::ReceiveTxn {
                txn_id: txn_id(2),
                action: VarTxnAction::Write,
            },
            now(),
        );
        assert_eq!(b.ballot.expect("ballot").vote, Vote::AbortDeadlock);
    }

    #[test]
    fn write_coalescing_keeps_only_latest() {
        let mut var = Var::new(uuid(1));

        // First commit goes straight to disk.
        let w1 = commit_write_at(&mut var, txn_id(1), 1).write;
        assert!(w1.is_some());

        // Two more commits while the first write is in flight: only the
        // latest is queued.
        assert!(commit_write_at(&mut var, txn_id(2), 2).write.is_none());
        assert!(commit_write_at(&mut var, txn_id(3), 3).write.is_none());

        // Completion of the first releases exactly the newest frame.
        let out = var.process(
            VarEvent::WriteCompleted {
                frame_id: w1.expect("w1").frame_id,
            },
            now(),
        );
        let next = out.write.expect("queued write released");
        assert_eq!(next.record.write_txn_id, txn_id(3));
        assert_eq!(next.delete_txn, Some(txn_id(1)));

        let out = var.process(
            VarEvent::WriteCompleted {
                frame_id: next.frame_id,
            },
            now(),
        );
        assert!(out.write.is_none());
        assert!(var.is_idle());
    }

    #[test]
    fn frame_chain_prunes_after_disk() {
        let mut var = Var::new(uuid(1));
        let w1 = commit_write_at(&mut var, txn_id(1), 1).write.expect("w1");
        var.process(
            VarEvent::WriteCompleted {
                frame_id: w1.frame_id,
            },
            now(),
        );
        let w2 = commit_write_at(&mut var, txn_id(2), 2).write.expect("w2");
        assert!(var.frame_chain_len() >= 2);
        var.process(
            VarEvent::WriteCompleted {
                frame_id: w2.frame_id,
            },
            now(),
        );
        assert_eq!(var.frame_chain_len(), 1);
        assert!(var.is_on_disk());
    }

    #[test]
    fn reader_holds_var_until_globally_complete() {
        let mut var = Var::new(uuid(1));
        let w = commit_write_at(&mut var, txn_id(1), 1).write.expect("w");
        var.process(VarEvent::WriteCompleted { frame_id: w.frame_id }, now());

        var.process(
            VarEvent::ReceiveTxn {
                txn_id: txn_id(2),
                action: VarTxnAction::Read { version: 1 },
            },
            now(),
        );
        let out = var.process(
            VarEvent::ReceiveOutcome {
                txn_id: txn_id(2),
                committed: true,
                clock: VectorClockBuilder::new().set(var.uuid, 1).build(),
                is_read: true,
                is_write: false,
                txn: None,
                positions: None,
            },
            now(),
        );
        // Idle (no pending) but not empty until the TGC lands.
        assert!(out.idle);
        assert!(!var.is_on_disk());

        var.process(
            VarEvent::GloballyComplete {
                txn_id: txn_id(2),
                is_write: false,
            },
            now(),
        );
        assert!(var.is_on_disk());
    }

    #[test]
    fn learner_grows_chain_from_outcomes_alone() {
        let mut var = Var::new(uuid(1));
        let out = var.process(
            VarEvent::ReceiveOutcome {
                txn_id: txn_id(9),
                committed: true,
                clock: VectorClockBuilder::new().set(uuid(1), 1).build(),
                is_read: false,
                is_write: true,
                txn: Some(dummy_txn(txn_id(9))),
                positions: Some(Positions::new(vec![0])),
            },
            now(),
        );
        assert!(out.learnt);
        assert!(out.write.is_some());
        assert_eq!(var.current_version(), 1);

        // A stale learnt commit does not regress the chain.
        let out = var.process(
            VarEvent::ReceiveOutcome {
                txn_id: txn_id(8),
                committed: true,
                clock: VectorClockBuilder::new().set(uuid(1), 1).build(),
                is_read: false,
                is_write: true,
                txn: Some(dummy_txn(txn_id(8))),
                positions: None,
            },
            now(),
        );
        assert!(out.learnt);
        assert!(out.write.is_none());
        assert_eq!(var.current_version(), 1);
    }

    #[test]
    fn hydration_restores_current_frame_identity() {
        let mut var = Var::new(uuid(1));
        let w = commit_write_at(&mut var, txn_id(1), 1).write.expect("w");
        var.process(VarEvent::WriteCompleted { frame_id: w.frame_id }, now());
        let record = var.record().expect("record");

        let restored = Var::from_record(record.clone());
        assert_eq!(restored.current_frame_txn(), Some(txn_id(1)));
        assert_eq!(restored.current_version(), 1);
        assert!(restored.is_on_disk());
        assert_eq!(restored.record(), Some(record));
    }

    #[test]
    fn roll_waits_for_quiet_and_clock_drag() {
        let mut var = Var::new(uuid(1));
        let start = Instant::now();

        // Commit a write whose clock drags another var's entry.
        var.process(
            VarEvent::ReceiveTxn {
                txn_id: txn_id(1),
                action: VarTxnAction::Write,
            },
            start,
        );
        let clock = VectorClockBuilder::new()
            .set(uuid(1), 1)
            .set(uuid(2), 5)
            .build();
        let w = var
            .process(
                VarEvent::ReceiveOutcome {
                    txn_id: txn_id(1),
                    committed: true,
                    clock,
                    is_read: false,
                    is_write: true,
                    txn: Some(dummy_txn(txn_id(1))),
                    positions: Some(Positions::new(vec![0])),
                },
                start,
            )
            .write
            .expect("w");
        var.process(VarEvent::WriteCompleted { frame_id: w.frame_id }, start);

        // Right after traffic: too busy to roll.
        assert!(!var.wants_roll(start + Duration::from_micros(10)));
        // Long after traffic has stopped: quiet enough.
        assert!(var.wants_roll(start + Duration::from_secs(60)));
    }
}
