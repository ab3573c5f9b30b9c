//! Acceptors.
//!
//! Per transaction, per node, the acceptor answers 1A/2A, accumulates
//! ballots into an outcome, persists it, disseminates the 2B, and
//! retires once every recipient has acknowledged:
//!
//! ```text
//! ReceiveBallots → WriteToDisk → AwaitLocallyComplete → DeleteFromDisk
//! ```
//!
//! Late ballots remain acceptable during `AwaitLocallyComplete` (a
//! retry transaction can legitimately flip the outcome); the acceptor
//! then re-enters `WriteToDisk` rather than ignore them.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use tessera_engine::{ExecutorHandle, ShardedDispatcher};
use tessera_store::{Db, Table};
use tessera_types::{
    Ballot, BootCount, Outcome, RMId, Topology, Txn, TxnId, VarUUId,
};
use tessera_wire::{Message, OneATxnVotes, OneBTxnVotes, Promise, RoundNumber, TwoATxnVotes, TwoBTxnVotes};

use crate::accumulator::{AcceptedBallot, BallotAccumulator};
use crate::senders::RepeatingSender;
use crate::{
    MessageRouter, PeerMap, ServerConnectionPublisher, ServerConnectionSubscriber, ServerPeer,
};

/// Bound on the remembered set of terminated txns, used to suppress
/// duplicate 2As/2Bs racing with deletion.
const TERMINATED_HISTORY: usize = 1 << 10;

// ============================================================================
// Persisted state
// ============================================================================

/// What `BallotOutcomes[txn_id]` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptorState {
    pub txn: Txn,
    pub outcome: Outcome,
    pub send_to_all: bool,
    pub instances: BTreeMap<(VarUUId, RMId), AcceptedBallot>,
}

// ============================================================================
// Acceptor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ReceiveBallots,
    WriteToDisk,
    AwaitLocallyComplete,
    DeleteFromDisk,
}

/// The per-transaction acceptor record.
pub struct Acceptor {
    pub txn_id: TxnId,
    txn: Arc<Txn>,
    accumulator: BallotAccumulator,
    phase: Phase,

    outcome: Option<Outcome>,
    outcome_on_disk: Option<Outcome>,

    /// Sticky: set by any commit outcome; commits must reach passive
    /// learners too.
    send_to_all: bool,
    send_to_all_on_disk: bool,

    pending_tlc: BTreeSet<RMId>,
    tlcs_received: BTreeSet<RMId>,
    tgc_recipients: Vec<RMId>,
    tsc_received: bool,

    submitter: RMId,
    submitter_boot: BootCount,
    /// Set once the submitter has been observed dead and the takeover
    /// resend started.
    pub(crate) submitter_takeover: bool,

    created_from_disk: bool,
}

/// Instructions handed back to the manager after an event.
#[derive(Default)]
pub struct AcceptorEffects {
    /// Persist the current outcome (enter or re-enter `WriteToDisk`).
    pub persist: Option<AcceptorState>,
    /// Start the 2B repeating sender with these parts.
    pub start_two_b: Option<TwoBSenderSpec>,
    /// Tear down the current 2B sender.
    pub stop_two_b: bool,
    /// Delete the durable record (enter `DeleteFromDisk`).
    pub delete: bool,
}

/// What the 2B repeating sender broadcasts.
pub struct TwoBSenderSpec {
    pub recipients: Vec<RMId>,
    pub message: Message,
    pub submitter: RMId,
    pub submitter_message: Message,
}

impl Acceptor {
    pub fn new(txn: Arc<Txn>, local_rm: RMId) -> Self {
        let submitter = txn.submitter();
        let submitter_boot = if submitter == local_rm {
            BootCount::ZERO // local submissions are watched by the client registry
        } else {
            txn.id.boot_count()
        };
        Self {
            txn_id: txn.id,
            accumulator: BallotAccumulator::new(&txn),
            txn,
            phase: Phase::ReceiveBallots,
            outcome: None,
            outcome_on_disk: None,
            send_to_all: false,
            send_to_all_on_disk: false,
            pending_tlc: BTreeSet::new(),
            tlcs_received: BTreeSet::new(),
            tgc_recipients: Vec::new(),
            tsc_received: false,
            submitter,
            submitter_boot,
            submitter_takeover: false,
            created_from_disk: false,
        }
    }

    /// Rebuilds an acceptor from its durable record: it restarts in
    /// `AwaitLocallyComplete` with a live 2B sender.
    pub fn from_state(state: AcceptorState, local_rm: RMId) -> (Self, AcceptorEffects) {
        let txn = Arc::new(state.txn);
        let mut acceptor = Self::new(txn.clone(), local_rm);
        acceptor.accumulator = BallotAccumulator::from_parts(&txn, state.instances);
        acceptor.outcome = Some(state.outcome.clone());
        acceptor.outcome_on_disk = Some(state.outcome);
        acceptor.send_to_all = state.send_to_all;
        acceptor.send_to_all_on_disk = state.send_to_all;
        acceptor.created_from_disk = true;
        let effects = acceptor.enter_await_locally_complete(None);
        (acceptor, effects)
    }

    pub fn txn(&self) -> &Arc<Txn> {
        &self.txn
    }

    pub fn submitter(&self) -> (RMId, BootCount) {
        (self.submitter, self.submitter_boot)
    }

    pub fn outcome_undetermined(&self) -> bool {
        self.outcome_on_disk.is_none()
    }

    // ------------------------------------------------------------------
    // Ballots
    // ------------------------------------------------------------------

    /// 2A acceptance for one instance. Late ballots are accepted right
    /// up to deletion; a changed outcome re-enters `WriteToDisk`.
    pub fn ballots_accepted(
        &mut self,
        instance: RMId,
        round: RoundNumber,
        ballots: Vec<Ballot>,
    ) -> AcceptorEffects {
        if self.phase == Phase::DeleteFromDisk {
            warn!(txn = %self.txn_id, %instance, "ballot after all TLCs received");
        }
        let mut outcome = None;
        for ballot in ballots {
            outcome = self.accumulator.ballot_received(instance, round, ballot);
        }
        let Some(outcome) = outcome else {
            return AcceptorEffects::default();
        };
        if Some(&outcome) == self.outcome.as_ref() {
            return AcceptorEffects::default();
        }

        debug!(txn = %self.txn_id, outcome = outcome.name(), "outcome determined");
        self.send_to_all = self.send_to_all || outcome.is_commit();
        self.outcome = Some(outcome.clone());
        self.phase = Phase::WriteToDisk;
        AcceptorEffects {
            persist: Some(AcceptorState {
                txn: (*self.txn).clone(),
                outcome,
                send_to_all: self.send_to_all,
                instances: self.accumulator.accepted().clone(),
            }),
            stop_two_b: true,
            ..Default::default()
        }
    }

    /// The store confirmed a state write. Only the latest outcome wins:
    /// if votes moved on mid-write, persist again.
    pub fn write_done(
        &mut self,
        written: Outcome,
        send_to_all: bool,
        topology: Option<&Topology>,
    ) -> AcceptorEffects {
        if self.phase != Phase::WriteToDisk {
            return AcceptorEffects::default();
        }
        if Some(&written) != self.outcome.as_ref() {
            // Superseded while in flight; the newer write is already
            // queued behind this one.
            return AcceptorEffects::default();
        }
        self.outcome_on_disk = Some(written);
        self.send_to_all_on_disk = send_to_all;
        self.enter_await_locally_complete(topology)
    }

    fn enter_await_locally_complete(&mut self, topology: Option<&Topology>) -> AcceptorEffects {
        self.phase = Phase::AwaitLocallyComplete;

        let rms_removed = topology.map(|t| &t.config.rms_removed);
        self.pending_tlc.clear();
        self.tgc_recipients.clear();
        for alloc in &self.txn.allocations {
            if let Some(removed) = rms_removed {
                if removed.contains(&alloc.rm_id) {
                    continue;
                }
            }
            if self.send_to_all_on_disk || alloc.is_active() {
                if !self.tlcs_received.contains(&alloc.rm_id) {
                    self.pending_tlc.insert(alloc.rm_id);
                }
                self.tgc_recipients.push(alloc.rm_id);
            }
        }
        if let Some(removed) = rms_removed {
            if removed.contains(&self.submitter) {
                self.tsc_received = true;
            }
        }

        if self.pending_tlc.is_empty() && self.tsc_received {
            return self.enter_delete();
        }

        let outcome = self
            .outcome_on_disk
            .clone()
            .expect("ALC entered with outcome on disk");
        trace!(txn = %self.txn_id, pending = ?self.pending_tlc, "broadcasting 2B");
        AcceptorEffects {
            start_two_b: Some(TwoBSenderSpec {
                recipients: self.tgc_recipients.clone(),
                // Proposers never need rerun updates; only the
                // submitter's copy carries them.
                message: Message::TwoBTxnVotes(TwoBTxnVotes::Outcome {
                    txn: (*self.txn).clone(),
                    outcome: outcome.without_updates(),
                }),
                submitter: self.submitter,
                submitter_message: Message::SubmissionOutcome {
                    txn: (*self.txn).clone(),
                    outcome,
                },
            }),
            stop_two_b: true,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Acknowledgements
    // ------------------------------------------------------------------

    pub fn tlc_received(&mut self, sender: RMId) -> AcceptorEffects {
        self.tlcs_received.insert(sender);
        if self.phase == Phase::AwaitLocallyComplete {
            self.pending_tlc.remove(&sender);
            return self.maybe_delete();
        }
        AcceptorEffects::default()
    }

    /// The submitter can confirm early (it needs only F+1 outcomes).
    pub fn tsc_received(&mut self, _sender: RMId) -> AcceptorEffects {
        if !self.tsc_received {
            self.tsc_received = true;
            return self.maybe_delete();
        }
        AcceptorEffects::default()
    }

    /// Removed RMs will never acknowledge; treat removal as their TLC
    /// (and TSC, for a removed submitter).
    pub fn topology_changed(&mut self, topology: &Topology) -> AcceptorEffects {
        let removed = topology.config.rms_removed.clone();
        self.tgc_recipients.retain(|rm| !removed.contains(rm));
        let mut effects = AcceptorEffects::default();
        for rm in &removed {
            let e = self.tlc_received(*rm);
            effects.delete = effects.delete || e.delete;
        }
        if removed.contains(&self.submitter) {
            let e = self.tsc_received(self.submitter);
            effects.delete = effects.delete || e.delete;
        }
        effects
    }

    fn maybe_delete(&mut self) -> AcceptorEffects {
        if self.phase == Phase::AwaitLocallyComplete
            && self.tsc_received
            && self.pending_tlc.is_empty()
        {
            return self.enter_delete();
        }
        AcceptorEffects::default()
    }

    fn enter_delete(&mut self) -> AcceptorEffects {
        self.phase = Phase::DeleteFromDisk;
        AcceptorEffects {
            delete: true,
            stop_two_b: true,
            ..Default::default()
        }
    }

    /// Deletion confirmed: hand back the TGC recipients and retire.
    pub fn deletion_done(&mut self) -> Vec<RMId> {
        debug_assert_eq!(self.phase, Phase::DeleteFromDisk);
        std::mem::take(&mut self.tgc_recipients)
    }

    pub fn status(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  {}: phase {:?} outcome {:?} pendingTLC {:?} tsc {} fromDisk {}",
            self.txn_id,
            self.phase,
            self.outcome.as_ref().map(|o| o.name()),
            self.pending_tlc,
            self.tsc_received,
            self.created_from_disk
        );
    }
}

// ============================================================================
// Promise bookkeeping (phase 1)
// ============================================================================

/// Per-txn promise floors. Kept outside the acceptor because a 1A can
/// arrive before any 2A has delivered the transaction itself.
#[derive(Debug, Default)]
struct InstancePromises {
    /// Instance-wide floor from bare 1As.
    floors: HashMap<RMId, RoundNumber>,
    /// Per-(instance, var) promise and acceptance.
    slots: HashMap<(RMId, VarUUId), PromiseSlot>,
}

#[derive(Debug, Default, Clone)]
struct PromiseSlot {
    promised: RoundNumber,
    accepted: Option<AcceptedBallot>,
}

impl InstancePromises {
    /// Handles a 1A, producing the per-var promises for the 1B.
    fn one_a(&mut self, instance: RMId, round: RoundNumber) -> Vec<(VarUUId, Promise)> {
        let floor = self.floors.entry(instance).or_default();
        if round > *floor {
            *floor = round;
        }
        let floor = *floor;

        let mut promises = Vec::new();
        for ((slot_instance, var), slot) in self.slots.iter_mut() {
            if *slot_instance != instance {
                continue;
            }
            let promise = if round < slot.promised {
                Promise::RoundNumberTooLow {
                    promised: slot.promised,
                }
            } else {
                slot.promised = round.max(floor);
                match &slot.accepted {
                    Some(a) => Promise::Accepted {
                        round_number: a.round_number,
                        ballot: a.ballot.clone(),
                    },
                    None => Promise::FreeChoice,
                }
            };
            promises.push((*var, promise));
        }
        promises
    }

    /// Handles the promise check of a 2A ballot. Returns `Err(promised)`
    /// when the round is below an existing promise.
    fn two_a(
        &mut self,
        instance: RMId,
        round: RoundNumber,
        var: VarUUId,
        ballot: &Ballot,
    ) -> Result<(), RoundNumber> {
        let floor = self.floors.get(&instance).copied().unwrap_or_default();
        let slot = self.slots.entry((instance, var)).or_default();
        let promised = slot.promised.max(floor);
        if round < promised {
            return Err(promised);
        }
        slot.promised = round;
        slot.accepted = Some(AcceptedBallot {
            round_number: round,
            ballot: ballot.clone(),
        });
        Ok(())
    }
}

// ============================================================================
// AcceptorManager (one per shard)
// ============================================================================

/// Owns the acceptors and promise state routed to one shard.
pub struct AcceptorManager {
    rm_id: RMId,
    db: Db,
    publisher: Arc<dyn ServerConnectionPublisher>,
    router: Arc<dyn MessageRouter>,
    acceptors: HashMap<TxnId, Acceptor>,
    promises: HashMap<TxnId, InstancePromises>,
    topology: Option<Topology>,

    /// Live 2B senders, removable by pointer identity.
    two_b_senders: HashMap<TxnId, Arc<dyn ServerConnectionSubscriber>>,
    /// Takeover senders for txns whose submitter died.
    txn_senders: HashMap<TxnId, Arc<dyn ServerConnectionSubscriber>>,

    /// Recently terminated txns; duplicate traffic for them is answered
    /// with an immediate TGC instead of fresh state.
    terminated: VecDeque<TxnId>,
    terminated_set: BTreeSet<TxnId>,

    self_handle: Option<ExecutorHandle<AcceptorManager>>,
}

impl AcceptorManager {
    pub fn new(
        rm_id: RMId,
        db: Db,
        publisher: Arc<dyn ServerConnectionPublisher>,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        Self {
            rm_id,
            db,
            publisher,
            router,
            acceptors: HashMap::new(),
            promises: HashMap::new(),
            topology: None,
            two_b_senders: HashMap::new(),
            txn_senders: HashMap::new(),
            terminated: VecDeque::new(),
            terminated_set: BTreeSet::new(),
            self_handle: None,
        }
    }

    pub fn set_self_handle(&mut self, handle: ExecutorHandle<AcceptorManager>) {
        self.self_handle = Some(handle);
    }

    pub fn acceptor_count(&self) -> usize {
        self.acceptors.len()
    }

    // ------------------------------------------------------------------
    // Wire entry points
    // ------------------------------------------------------------------

    pub fn one_a_received(&mut self, sender: RMId, votes: OneATxnVotes) {
        if self.terminated_set.contains(&votes.txn_id) {
            self.reply(sender, Message::TxnGloballyComplete(votes.txn_id));
            return;
        }
        let promises = self
            .promises
            .entry(votes.txn_id)
            .or_default()
            .one_a(votes.instance_rm_id, votes.round_number);
        trace!(txn = %votes.txn_id, %sender, "1A answered");
        self.reply(
            sender,
            Message::OneBTxnVotes(OneBTxnVotes {
                txn_id: votes.txn_id,
                instance_rm_id: votes.instance_rm_id,
                round_number: votes.round_number,
                promises,
            }),
        );
    }

    pub fn two_a_received(&mut self, sender: RMId, votes: TwoATxnVotes) {
        let txn_id = votes.txn.id;
        if self.terminated_set.contains(&txn_id) {
            self.reply(sender, Message::TxnGloballyComplete(txn_id));
            return;
        }

        let promises = self.promises.entry(txn_id).or_default();
        let mut accepted = Vec::new();
        let mut failures = Vec::new();
        for ballot in votes.ballots {
            match promises.two_a(votes.instance_rm_id, votes.round_number, ballot.var, &ballot)
            {
                Ok(()) => accepted.push(ballot),
                Err(promised) => failures.push((ballot.var, promised)),
            }
        }

        if !failures.is_empty() {
            self.reply(
                sender,
                Message::TwoBTxnVotes(TwoBTxnVotes::Failures {
                    txn_id,
                    instance_rm_id: votes.instance_rm_id,
                    failures,
                }),
            );
        }
        if accepted.is_empty() {
            return;
        }

        let rm_id = self.rm_id;
        let acceptor = self.acceptors.entry(txn_id).or_insert_with(|| {
            debug!(txn = %txn_id, "new acceptor");
            Acceptor::new(Arc::new(votes.txn), rm_id)
        });
        let effects =
            acceptor.ballots_accepted(votes.instance_rm_id, votes.round_number, accepted);
        self.run_effects(txn_id, effects);
    }

    pub fn tlc_received(&mut self, sender: RMId, txn_id: TxnId) {
        if let Some(acceptor) = self.acceptors.get_mut(&txn_id) {
            let effects = acceptor.tlc_received(sender);
            self.run_effects(txn_id, effects);
        } else {
            // No state: the record is already deleted. Re-answer with a
            // TGC so the sender can retire too.
            self.reply(sender, Message::TxnGloballyComplete(txn_id));
        }
    }

    pub fn tsc_received(&mut self, sender: RMId, txn_id: TxnId) {
        if let Some(acceptor) = self.acceptors.get_mut(&txn_id) {
            let effects = acceptor.tsc_received(sender);
            self.run_effects(txn_id, effects);
        }
    }

    pub fn topology_changed(&mut self, topology: Topology) {
        self.topology = Some(topology.clone());
        let txn_ids: Vec<TxnId> = self.acceptors.keys().copied().collect();
        for txn_id in txn_ids {
            if let Some(acceptor) = self.acceptors.get_mut(&txn_id) {
                let effects = acceptor.topology_changed(&topology);
                self.run_effects(txn_id, effects);
            }
        }
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn run_effects(&mut self, txn_id: TxnId, effects: AcceptorEffects) {
        if effects.stop_two_b {
            if let Some(sender) = self.two_b_senders.remove(&txn_id) {
                self.publisher.remove_subscriber(&sender);
            }
        }
        if let Some(state) = effects.persist {
            self.persist(txn_id, state);
        }
        if let Some(spec) = effects.start_two_b {
            // Reaching the 2B stage ends any submitter-takeover resend.
            if let Some(sender) = self.txn_senders.remove(&txn_id) {
                self.publisher.remove_subscriber(&sender);
            }
            let sender: Arc<dyn ServerConnectionSubscriber> = Arc::new(
                RepeatingSender::new(spec.message, spec.recipients)
                    .with_special(spec.submitter, spec.submitter_message),
            );
            self.two_b_senders.insert(txn_id, sender.clone());
            self.publisher.add_subscriber(sender);
        }
        if effects.delete {
            self.delete(txn_id);
        }
    }

    fn persist(&self, txn_id: TxnId, state: AcceptorState) {
        let handle = self.self_handle.clone().expect("manager wired");
        let outcome = state.outcome.clone();
        let send_to_all = state.send_to_all;
        let bytes = bincode::serialize(&state).expect("acceptor state serializes");
        let key = txn_id.as_bytes().to_vec();
        trace!(txn = %txn_id, "writing 2B to disk");
        let future = self
            .db
            .read_write(move |txn| txn.put(Table::BallotOutcomes, &key, &bytes));
        std::thread::Builder::new()
            .name("acceptor-write-wait".to_string())
            .spawn(move || {
                if future.wait().is_err() {
                    return;
                }
                handle.enqueue(move |am| {
                    let topology = am.topology.clone();
                    if let Some(acceptor) = am.acceptors.get_mut(&txn_id) {
                        let effects = acceptor.write_done(outcome, send_to_all, topology.as_ref());
                        am.run_effects(txn_id, effects);
                    }
                });
            })
            .expect("spawn acceptor write waiter");
    }

    fn delete(&self, txn_id: TxnId) {
        let handle = self.self_handle.clone().expect("manager wired");
        let key = txn_id.as_bytes().to_vec();
        trace!(txn = %txn_id, "deleting 2B from disk");
        let future = self
            .db
            .read_write(move |txn| txn.delete(Table::BallotOutcomes, &key));
        std::thread::Builder::new()
            .name("acceptor-delete-wait".to_string())
            .spawn(move || {
                if future.wait().is_err() {
                    return;
                }
                handle.enqueue(move |am| am.deletion_done(txn_id));
            })
            .expect("spawn acceptor delete waiter");
    }

    fn deletion_done(&mut self, txn_id: TxnId) {
        let Some(mut acceptor) = self.acceptors.remove(&txn_id) else {
            return;
        };
        self.promises.remove(&txn_id);
        if let Some(sender) = self.two_b_senders.remove(&txn_id) {
            self.publisher.remove_subscriber(&sender);
        }
        if let Some(sender) = self.txn_senders.remove(&txn_id) {
            self.publisher.remove_subscriber(&sender);
        }

        self.terminated.push_back(txn_id);
        self.terminated_set.insert(txn_id);
        while self.terminated.len() > TERMINATED_HISTORY {
            if let Some(old) = self.terminated.pop_front() {
                self.terminated_set.remove(&old);
            }
        }

        // Best-effort: a lost TGC is repaired by the recipient's TLC
        // resend, which finds no record and is answered with a TGC.
        let recipients = acceptor.deletion_done();
        debug!(txn = %txn_id, ?recipients, "sending TGC");
        let sender: Arc<dyn ServerConnectionSubscriber> = Arc::new(crate::senders::OneShotSender::new(
            Message::TxnGloballyComplete(txn_id),
            recipients,
        ));
        self.publisher.add_subscriber(sender);
    }

    // ------------------------------------------------------------------
    // Submitter watch
    // ------------------------------------------------------------------

    /// Checks whether the submitter is still the incarnation that sent
    /// the txn; if not, this acceptor may hold the only record, so it
    /// takes over resending the submission to the active RMs.
    pub fn submitter_changed(&mut self, peers: &PeerMap) {
        let takeovers: Vec<TxnId> = self
            .acceptors
            .iter()
            .filter(|(_, a)| a.outcome_undetermined() && !a.submitter_takeover)
            .filter(|(_, a)| {
                let (submitter, boot) = a.submitter();
                if boot.is_zero() {
                    return false;
                }
                match peers.get(&submitter) {
                    None => true,
                    Some(peer) => peer.boot_count != boot,
                }
            })
            .map(|(id, _)| *id)
            .collect();

        for txn_id in takeovers {
            let acceptor = self.acceptors.get_mut(&txn_id).expect("present");
            acceptor.submitter_takeover = true;
            let actives = acceptor.txn().active_rms();
            info!(txn = %txn_id, ?actives, "submitter gone; resending txn");
            let sender: Arc<dyn ServerConnectionSubscriber> = Arc::new(RepeatingSender::new(
                Message::TxnSubmission((**acceptor.txn()).clone()),
                actives,
            ));
            self.txn_senders.insert(txn_id, sender.clone());
            self.publisher.add_subscriber(sender);
        }
    }

    /// Installs a restored acceptor (startup recovery path).
    fn load_from_state(&mut self, state: AcceptorState) {
        let txn_id = state.txn.id;
        if self.acceptors.contains_key(&txn_id) {
            panic!("acceptor for {txn_id} already exists at load");
        }
        let (acceptor, effects) = Acceptor::from_state(state, self.rm_id);
        self.acceptors.insert(txn_id, acceptor);
        self.run_effects(txn_id, effects);
    }

    fn reply(&self, to: RMId, msg: Message) {
        self.router.send(to, msg);
    }

    pub fn status(&self, out: &mut String) {
        let _ = writeln!(out, "- Acceptors: {}", self.acceptors.len());
        for acceptor in self.acceptors.values() {
            acceptor.status(out);
        }
    }
}

// ============================================================================
// AcceptorDispatcher
// ============================================================================

/// Routes acceptor traffic by the txn id's sharding byte and recovers
/// persisted acceptors at startup.
pub struct AcceptorDispatcher {
    dispatcher: ShardedDispatcher<AcceptorManager>,
    subscriber: Arc<dyn ServerConnectionSubscriber>,
}

impl AcceptorDispatcher {
    pub fn spawn(
        shard_count: usize,
        rm_id: RMId,
        db: Db,
        publisher: Arc<dyn ServerConnectionPublisher>,
        router: Arc<dyn MessageRouter>,
    ) -> Self {
        let dispatcher = ShardedDispatcher::spawn("acceptors", shard_count, |_| {
            AcceptorManager::new(rm_id, db.clone(), publisher.clone(), router.clone())
        });
        for handle in dispatcher.handles() {
            let wired = handle.clone();
            handle.enqueue(move |am| am.set_self_handle(wired));
        }

        let this = Self {
            subscriber: Arc::new(ShardPeerWatch {
                handles: dispatcher.handles(),
            }),
            dispatcher,
        };
        this.load_from_disk(&db);
        publisher.add_subscriber(this.subscriber.clone());
        this
    }

    /// Recovers every persisted 2B outcome into a live acceptor.
    fn load_from_disk(&self, db: &Db) {
        let states = db
            .read(|txn| {
                txn.cursor(Table::BallotOutcomes)
                    .map(|(_, v)| v)
                    .collect::<Vec<_>>()
            })
            .wait()
            .unwrap_or_else(|e| panic!("store scan failed loading acceptors: {e}"));

        let count = states.len();
        for bytes in states {
            let state: AcceptorState = bincode::deserialize(&bytes)
                .unwrap_or_else(|e| panic!("persisted acceptor state failed to decode: {e}"));
            self.dispatcher
                .with_shard(state.txn.id.sharding_byte(), move |am| {
                    am.load_from_state(state)
                });
        }
        if count > 0 {
            info!(count, "loaded acceptors from disk");
        }
    }

    pub fn one_a_received(&self, sender: RMId, votes: OneATxnVotes) {
        self.dispatcher
            .with_shard(votes.txn_id.sharding_byte(), move |am| {
                am.one_a_received(sender, votes)
            });
    }

    pub fn two_a_received(&self, sender: RMId, votes: TwoATxnVotes) {
        self.dispatcher
            .with_shard(votes.txn.id.sharding_byte(), move |am| {
                am.two_a_received(sender, votes)
            });
    }

    pub fn tlc_received(&self, sender: RMId, txn_id: TxnId) {
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |am| {
                am.tlc_received(sender, txn_id)
            });
    }

    pub fn tsc_received(&self, sender: RMId, txn_id: TxnId) {
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |am| {
                am.tsc_received(sender, txn_id)
            });
    }

    pub fn topology_changed(&self, topology: Topology) {
        self.dispatcher.for_each_shard(move |am| {
            am.topology_changed(topology.clone());
        });
    }

    pub fn shutdown(self) {
        self.dispatcher.shutdown();
    }
}

/// Forwards peer-set changes onto every acceptor shard so they can
/// watch their submitters.
struct ShardPeerWatch {
    handles: Vec<ExecutorHandle<AcceptorManager>>,
}

impl ServerConnectionSubscriber for ShardPeerWatch {
    fn connected_rms(&self, peers: &PeerMap) {
        for handle in &self.handles {
            let peers = peers.clone();
            handle.enqueue(move |am| am.submitter_changed(&peers));
        }
    }

    fn connection_lost(&self, _rm_id: RMId, peers: &PeerMap) {
        self.connected_rms(peers);
    }

    fn connection_established(
        &self,
        _peer: &ServerPeer,
        peers: &PeerMap,
        done: Box<dyn FnOnce() + Send>,
    ) {
        self.connected_rms(peers);
        done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tessera_types::{
        Action, ActionValue, Allocation, VectorClockBuilder,
    };

    fn uuid(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn txn_id(n: u64) -> TxnId {
        TxnId::from_parts(n, Default::default(), BootCount::new(2), RMId::new(10))
    }

    fn single_rm_txn(id: TxnId) -> Arc<Txn> {
        Arc::new(Txn {
            id,
            actions: vec![Action::new(uuid(1), ActionValue::Write {
                value: Default::default(),
                references: vec![],
            })],
            allocations: vec![Allocation::active(
                RMId::new(1),
                BootCount::new(1),
                vec![0],
            )],
            f_inc: 1,
            two_f_inc: 1,
            topology_version: 0,
            is_topology: false,
            retry: false,
        })
    }

    fn commit_ballot() -> Ballot {
        Ballot::commit(uuid(1), VectorClockBuilder::new().set(uuid(1), 1).build())
    }

    fn round() -> RoundNumber {
        RoundNumber::new(0, 0, RMId::new(1))
    }

    #[test]
    fn outcome_determined_then_persist_then_alc() {
        let txn = single_rm_txn(txn_id(1));
        let mut acceptor = Acceptor::new(txn.clone(), RMId::new(1));

        let effects = acceptor.ballots_accepted(RMId::new(1), round(), vec![commit_ballot()]);
        let state = effects.persist.expect("outcome determined");
        assert!(state.outcome.is_commit());
        assert!(state.send_to_all, "commit outcomes go to every replica");

        let effects = acceptor.write_done(state.outcome.clone(), state.send_to_all, None);
        let spec = effects.start_two_b.expect("2B sender starts");
        assert_eq!(spec.recipients, vec![RMId::new(1)]);
        assert_eq!(spec.submitter, RMId::new(10));
        assert!(matches!(spec.submitter_message, Message::SubmissionOutcome { .. }));
    }

    #[test]
    fn retires_only_after_all_tlcs_and_tsc() {
        let txn = single_rm_txn(txn_id(1));
        let mut acceptor = Acceptor::new(txn, RMId::new(1));
        let state = acceptor
            .ballots_accepted(RMId::new(1), round(), vec![commit_ballot()])
            .persist
            .expect("determined");
        acceptor.write_done(state.outcome, state.send_to_all, None);

        // TSC alone does not retire.
        assert!(!acceptor.tsc_received(RMId::new(10)).delete);
        // Final TLC does.
        let effects = acceptor.tlc_received(RMId::new(1));
        assert!(effects.delete);
        assert_eq!(acceptor.deletion_done(), vec![RMId::new(1)]);
    }

    #[test]
    fn late_ballot_during_alc_rewrites_outcome() {
        let id = txn_id(1);
        // Two voters so the outcome can flip between determinations.
        let txn = Arc::new(Txn {
            id,
            actions: vec![Action::new(uuid(1), ActionValue::Write {
                value: Default::default(),
                references: vec![],
            })],
            allocations: vec![
                Allocation::active(RMId::new(1), BootCount::new(1), vec![0]),
                Allocation::active(RMId::new(2), BootCount::new(1), vec![0]),
            ],
            f_inc: 2,
            two_f_inc: 3,
            topology_version: 0,
            is_topology: false,
            retry: true,
        });
        let mut acceptor = Acceptor::new(txn, RMId::new(1));

        acceptor.ballots_accepted(RMId::new(1), round(), vec![Ballot::deadlock(uuid(1))]);
        let state = acceptor
            .ballots_accepted(
                RMId::new(2),
                RoundNumber::new(0, 0, RMId::new(2)),
                vec![commit_ballot()],
            )
            .persist
            .expect("abort determined");
        assert!(!state.outcome.is_commit());
        acceptor.write_done(state.outcome, state.send_to_all, None);

        // Retry flips RM 1 to commit while awaiting TLCs: the acceptor
        // must not ignore it.
        let effects = acceptor.ballots_accepted(
            RMId::new(1),
            round().next(),
            vec![commit_ballot()],
        );
        let state = effects.persist.expect("outcome changed; rewrite");
        assert!(state.outcome.is_commit());
        assert!(effects.stop_two_b);
    }

    #[test]
    fn one_a_promises_and_round_ordering() {
        let mut promises = InstancePromises::default();

        // Bare 1A before any 2A: no per-var slots yet.
        assert!(promises.one_a(RMId::new(1), round()).is_empty());

        // A 2A at the same round is accepted.
        promises
            .two_a(RMId::new(1), round(), uuid(1), &commit_ballot())
            .expect("accepted");

        // A lower 1A is told what was promised.
        let low = promises.one_a(RMId::new(1), RoundNumber::default());
        assert!(matches!(
            low[0].1,
            Promise::RoundNumberTooLow { .. }
        ));

        // A higher 1A sees the prior acceptance.
        let high = promises.one_a(RMId::new(1), round().next());
        assert!(matches!(high[0].1, Promise::Accepted { .. }));

        // A 2A below the new promise fails.
        let err = promises
            .two_a(RMId::new(1), round(), uuid(1), &commit_ballot())
            .expect_err("below promise");
        assert_eq!(err, round().next());
    }

    #[test]
    fn removed_rms_count_as_acknowledged() {
        let id = txn_id(1);
        let txn = Arc::new(Txn {
            id,
            actions: vec![Action::new(uuid(1), ActionValue::Write {
                value: Default::default(),
                references: vec![],
            })],
            allocations: vec![
                Allocation::active(RMId::new(1), BootCount::new(1), vec![0]),
                Allocation::active(RMId::new(2), BootCount::new(1), vec![0]),
            ],
            f_inc: 2,
            two_f_inc: 3,
            topology_version: 0,
            is_topology: false,
            retry: false,
        });
        let mut acceptor = Acceptor::new(txn, RMId::new(1));
        acceptor.ballots_accepted(RMId::new(1), round(), vec![Ballot::deadlock(uuid(1))]);
        let state = acceptor
            .ballots_accepted(
                RMId::new(2),
                RoundNumber::new(0, 0, RMId::new(2)),
                vec![Ballot::deadlock(uuid(1))],
            )
            .persist
            .expect("determined");
        acceptor.write_done(state.outcome, state.send_to_all, None);
        acceptor.tlc_received(RMId::new(1));
        acceptor.tlc_received(RMId::new(2));

        // Submitter RM 10 is removed: its TSC will never come, so the
        // topology change must stand in for it.
        let mut config = tessera_types::Configuration::blank("t".into(), 4);
        config.rms_removed.insert(RMId::new(10));
        let topology = Topology::new(config, tessera_types::VERSION_ONE, vec![]);
        let effects = acceptor.topology_changed(&topology);
        assert!(effects.delete);
    }

    #[test]
    fn submitter_takeover_on_boot_count_change() {
        struct Recorder(Mutex<Vec<&'static str>>);
        impl ServerConnectionPublisher for Recorder {
            fn add_subscriber(&self, _sub: Arc<dyn ServerConnectionSubscriber>) {
                self.0.lock().unwrap().push("add");
            }
            fn remove_subscriber(&self, _sub: &Arc<dyn ServerConnectionSubscriber>) {
                self.0.lock().unwrap().push("remove");
            }
        }
        struct NullRouter;
        impl MessageRouter for NullRouter {
            fn send(&self, _to: RMId, _msg: Message) {}
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let (db, _store) = Db::open(dir.path()).expect("open");
        let publisher = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut am = AcceptorManager::new(
            RMId::new(1),
            db,
            publisher.clone(),
            Arc::new(NullRouter),
        );

        // Two voters, only one ballot arrives: the outcome stays
        // undetermined, which is the takeover-relevant window.
        let id = txn_id(1);
        let txn = Txn {
            id,
            actions: vec![Action::new(uuid(1), ActionValue::Write {
                value: Default::default(),
                references: vec![],
            })],
            allocations: vec![
                Allocation::active(RMId::new(1), BootCount::new(1), vec![0]),
                Allocation::active(RMId::new(2), BootCount::new(1), vec![0]),
            ],
            f_inc: 2,
            two_f_inc: 3,
            topology_version: 0,
            is_topology: false,
            retry: false,
        };
        am.two_a_received(
            RMId::new(10),
            TwoATxnVotes {
                txn,
                instance_rm_id: RMId::new(1),
                round_number: round(),
                ballots: vec![Ballot::deadlock(uuid(1))],
            },
        );
        assert_eq!(am.acceptor_count(), 1);

        // The submitter (RM 10, boot 2) is absent from the peer map:
        // the manager takes over resending the submission.
        am.submitter_changed(&PeerMap::new());
        assert!(publisher.0.lock().unwrap().contains(&"add"));
        assert!(am.acceptors.values().all(|a| a.submitter_takeover));
    }
}
