//! Proposers.
//!
//! Per transaction, per node, the proposer shepherds the txn from
//! receipt to retirement:
//!
//! - **ActiveVoter**: engages the local vars, feeds their ballots into
//!   this node's Paxos instance, and drives phase 1 then phase 2.
//! - **ActiveLearner**: allocated active but unable to vote (wrong
//!   incarnation, or state lost in a crash); synthesises abort ballots
//!   so consensus completes, and collects outcomes.
//! - **PassiveLearner**: collects commit outcomes for vars this node
//!   hosts passively.
//!
//! Whatever the mode, once every acceptor reports the same outcome and
//! the local vars have absorbed it, the proposer persists its state,
//! sends TLC to the acceptors, and retires on their TGCs.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use tessera_engine::{ExecutorHandle, ShardedDispatcher, VarDispatcher, VarTxnAction, VoteSink};
use tessera_store::{Db, Table};
use tessera_types::{
    ActionValue, Ballot, BootCount, Outcome, Positions, RMId, Topology, Txn, TxnId, VarUUId,
};
use tessera_wire::{Message, OneBTxnVotes, TwoBTxnVotes};

use crate::proposal::{make_abort_ballots, InstanceId, Proposal, Sends};
use crate::senders::OneShotSender;
use crate::{MessageRouter, ServerConnectionPublisher, ServerConnectionSubscriber};

// ============================================================================
// Persisted state
// ============================================================================

/// What `Proposers[txn_id]` holds: enough to re-send TLCs after a
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerState {
    pub txn: Txn,
    pub outcome: Outcome,
    pub acceptors: Vec<RMId>,
}

// ============================================================================
// Proposer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposerMode {
    ActiveVoter,
    ActiveLearner,
    PassiveLearner,
}

/// Instructions handed back to the manager after an event.
#[derive(Default)]
pub struct ProposerEffects {
    /// Deliver the decided outcome to the local vars.
    pub deliver: Option<Outcome>,
    /// Persist state and send TLC to every acceptor.
    pub send_tlc: bool,
    /// Re-acknowledge a resending acceptor with an immediate TLC.
    pub reply_tlc: Option<RMId>,
    /// All TGCs received: delete state and drop the proposer.
    pub finished: bool,
}

pub struct Proposer {
    pub txn_id: TxnId,
    txn: Arc<Txn>,
    pub mode: ProposerMode,
    acceptors: Vec<RMId>,

    /// Update-stripped outcomes per acceptor.
    outcomes: HashMap<RMId, Outcome>,
    decided: Option<Outcome>,

    /// Local vars still to absorb the outcome.
    vars_pending: BTreeSet<VarUUId>,
    delivered: bool,

    locally_complete: bool,
    tgc_pending: BTreeSet<RMId>,
}

impl Proposer {
    pub fn new(txn: Arc<Txn>, mode: ProposerMode, local_rm: RMId) -> Self {
        let acceptors = txn.acceptors();
        let local_vars: BTreeSet<VarUUId> = txn
            .allocation_for(local_rm)
            .map(|alloc| {
                alloc
                    .action_indices
                    .iter()
                    .map(|&idx| txn.actions[idx as usize].var)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            txn_id: txn.id,
            txn,
            mode,
            tgc_pending: acceptors.iter().copied().collect(),
            acceptors,
            outcomes: HashMap::new(),
            decided: None,
            vars_pending: local_vars,
            delivered: false,
            locally_complete: false,
        }
    }

    /// Rebuilds a proposer from its durable record: locally complete,
    /// TLCs must be re-sent, TGCs are still owed.
    pub fn from_state(state: ProposerState, local_rm: RMId) -> Self {
        let mut proposer = Self::new(Arc::new(state.txn), ProposerMode::ActiveLearner, local_rm);
        proposer.decided = Some(state.outcome);
        proposer.delivered = true;
        proposer.vars_pending.clear();
        proposer.locally_complete = true;
        proposer
    }

    pub fn txn(&self) -> &Arc<Txn> {
        &self.txn
    }

    pub fn is_topology_txn(&self) -> bool {
        self.txn.is_topology
    }

    /// TLC persisted and sent (or restored from disk).
    pub fn tlc_done(&self) -> bool {
        self.locally_complete
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.decided.as_ref()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// A 2B outcome from one acceptor.
    pub fn outcome_received(&mut self, sender: RMId, outcome: Outcome) -> ProposerEffects {
        if self.locally_complete {
            // The acceptor's repeating sender did not see our TLC yet.
            return ProposerEffects {
                reply_tlc: Some(sender),
                ..Default::default()
            };
        }

        self.outcomes.insert(sender, outcome.without_updates());

        let mut effects = ProposerEffects::default();
        if self.decided.is_none() {
            let threshold = usize::from(self.txn.f_inc);
            let agreeing = self
                .outcomes
                .values()
                .filter(|o| **o == self.outcomes[&sender])
                .count();
            if agreeing >= threshold {
                let outcome = self.outcomes[&sender].clone();
                debug!(txn = %self.txn_id, outcome = outcome.name(), "outcome decided");
                self.decided = Some(outcome.clone());
                self.delivered = true;
                effects.deliver = Some(outcome);
            }
        }
        effects.send_tlc = self.check_locally_complete();
        effects
    }

    /// A local var finished absorbing the outcome.
    pub fn var_processed(&mut self, var: VarUUId) -> ProposerEffects {
        self.vars_pending.remove(&var);
        ProposerEffects {
            send_tlc: self.check_locally_complete(),
            ..Default::default()
        }
    }

    /// TLC persisted and dispatched.
    pub fn tlc_sent(&mut self) {
        self.locally_complete = true;
    }

    pub fn tgc_received(&mut self, sender: RMId) -> ProposerEffects {
        self.tgc_pending.remove(&sender);
        ProposerEffects {
            finished: self.locally_complete && self.tgc_pending.is_empty(),
            ..Default::default()
        }
    }

    /// Removed RMs will never send their 2B or TGC.
    pub fn topology_changed(&mut self, topology: &Topology) -> ProposerEffects {
        let removed = &topology.config.rms_removed;
        self.acceptors.retain(|rm| !removed.contains(rm));
        self.tgc_pending.retain(|rm| !removed.contains(rm));
        self.outcomes.retain(|rm, _| !removed.contains(rm));
        ProposerEffects {
            send_tlc: self.check_locally_complete(),
            finished: self.locally_complete && self.tgc_pending.is_empty(),
            ..Default::default()
        }
    }

    /// TLC is due once *every* remaining acceptor reports the same
    /// outcome and the local vars are done; anything earlier could
    /// strand an acceptor waiting on a TLC that never comes.
    fn check_locally_complete(&self) -> bool {
        if self.locally_complete || !self.delivered || !self.vars_pending.is_empty() {
            return false;
        }
        let Some(decided) = &self.decided else {
            return false;
        };
        self.acceptors
            .iter()
            .all(|rm| self.outcomes.get(rm) == Some(decided))
    }

    pub fn acceptors(&self) -> &[RMId] {
        &self.acceptors
    }

    pub fn state(&self) -> ProposerState {
        ProposerState {
            txn: (*self.txn).clone(),
            outcome: self
                .decided
                .clone()
                .expect("state only persisted after decision"),
            acceptors: self.acceptors.clone(),
        }
    }

    pub fn status(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  {}: mode {:?} decided {:?} varsPending {} tlc {} tgcPending {:?}",
            self.txn_id,
            self.mode,
            self.decided.as_ref().map(|o| o.name()),
            self.vars_pending.len(),
            self.locally_complete,
            self.tgc_pending
        );
    }
}

// ============================================================================
// ProposerManager (one per shard)
// ============================================================================

pub struct ProposerManager {
    rm_id: RMId,
    boot_count: BootCount,
    /// Local random nonce folded into round ordering so concurrent
    /// proposers for the same instance interleave fairly.
    tie_break: u32,
    db: Db,
    router: Arc<dyn MessageRouter>,
    publisher: Arc<dyn ServerConnectionPublisher>,
    vars: Arc<VarDispatcher>,

    proposers: HashMap<TxnId, Proposer>,
    proposals: HashMap<InstanceId, Proposal>,
    topology: Option<Topology>,

    /// Fires once every proposer has its TLC on disk (quiet stages 0
    /// and 2).
    on_disk: Option<Box<dyn FnOnce(bool) + Send>>,

    tlc_senders: Vec<Arc<OneShotSender>>,
    self_handle: Option<ExecutorHandle<ProposerManager>>,
}

impl ProposerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rm_id: RMId,
        boot_count: BootCount,
        tie_break: u32,
        db: Db,
        router: Arc<dyn MessageRouter>,
        publisher: Arc<dyn ServerConnectionPublisher>,
        vars: Arc<VarDispatcher>,
    ) -> Self {
        Self {
            rm_id,
            boot_count,
            tie_break,
            db,
            router,
            publisher,
            vars,
            proposers: HashMap::new(),
            proposals: HashMap::new(),
            topology: None,
            on_disk: None,
            tlc_senders: Vec::new(),
            self_handle: None,
        }
    }

    pub fn set_self_handle(&mut self, handle: ExecutorHandle<ProposerManager>) {
        self.self_handle = Some(handle);
    }

    pub fn proposer_count(&self) -> usize {
        self.proposers.len()
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// A transaction submission arrived. Due to failures a 2B can beat
    /// the submission here, in which case the proposer already exists
    /// and the submission is ignored.
    pub fn txn_received(&mut self, sender: RMId, txn: Txn) {
        let txn_id = txn.id;
        if self.proposers.contains_key(&txn_id) {
            return;
        }
        let txn = Arc::new(txn);

        let mut accept = true;
        if let Some(topology) = &self.topology {
            accept = topology.version() == txn.topology_version;
            if accept && topology.next().is_some() {
                // Mid-reconfiguration only topology txns are admitted.
                accept = txn.is_topology;
            }
            if accept {
                accept = !topology.config.rms_removed.contains(&sender);
            }
            if accept {
                accept = txn
                    .allocation_for(self.rm_id)
                    .map(|alloc| alloc.active == self.boot_count)
                    .unwrap_or(false);
                if !accept {
                    debug!(txn = %txn_id, "txn was prepared for a prior incarnation; not voting");
                }
            }
        }

        if accept {
            debug!(txn = %txn_id, %sender, "txn received");
            self.create_proposer(txn.clone(), ProposerMode::ActiveVoter);
            self.engage_vars(&txn);
            self.new_proposal(txn, Vec::new());
        } else {
            // Synthesise abort ballots and run phase 1 anyway so
            // consensus completes without our vote.
            let ballots = make_abort_ballots(&txn, self.rm_id);
            self.create_proposer(txn.clone(), ProposerMode::ActiveLearner);
            self.new_proposal(txn, ballots);
        }
    }

    /// Sends each local action to its var for classification and vote.
    fn engage_vars(&self, txn: &Arc<Txn>) {
        let Some(alloc) = txn.allocation_for(self.rm_id) else {
            return;
        };
        for action in txn.actions_for(alloc) {
            let var_action = match &action.value {
                ActionValue::Read { version } => VarTxnAction::Read { version: *version },
                ActionValue::Write { .. } => VarTxnAction::Write,
                ActionValue::Create { .. } => VarTxnAction::Write,
                ActionValue::ReadWrite { version, .. } => {
                    VarTxnAction::ReadWrite { version: *version }
                }
                ActionValue::Roll { version, .. } => VarTxnAction::Roll { version: *version },
                ActionValue::Missing => continue,
            };
            self.vars.receive_txn(action.var, txn.id, var_action);
        }
    }

    fn create_proposer(&mut self, txn: Arc<Txn>, mode: ProposerMode) -> &mut Proposer {
        let txn_id = txn.id;
        if self.proposers.contains_key(&txn_id) {
            panic!("proposer for {txn_id} already exists");
        }
        self.proposers
            .entry(txn_id)
            .or_insert_with(|| Proposer::new(txn, mode, self.rm_id))
    }

    fn new_proposal(&mut self, txn: Arc<Txn>, ballots: Vec<Ballot>) {
        let id: InstanceId = (txn.id, self.rm_id);
        if self.proposals.contains_key(&id) {
            return;
        }
        let mut proposal = Proposal::new(txn, self.rm_id, self.tie_break, self.rm_id, ballots);
        let sends = proposal.start();
        self.proposals.insert(id, proposal);
        self.dispatch(sends);
    }

    // ------------------------------------------------------------------
    // Wire entry points
    // ------------------------------------------------------------------

    pub fn ballot_cast(&mut self, txn_id: TxnId, ballot: Ballot) {
        let id: InstanceId = (txn_id, self.rm_id);
        let Some(proposal) = self.proposals.get_mut(&id) else {
            // Outcome already reached; the ballot is moot.
            trace!(txn = %txn_id, "ballot for finished proposal ignored");
            return;
        };
        let sends = proposal.add_ballots(vec![ballot]);
        self.dispatch(sends);
    }

    pub fn one_b_received(&mut self, sender: RMId, votes: OneBTxnVotes) {
        let id: InstanceId = (votes.txn_id, votes.instance_rm_id);
        if let Some(proposal) = self.proposals.get_mut(&id) {
            let sends = proposal.one_b_received(sender, votes);
            self.dispatch(sends);
        }
        // Unknown: a delayed 1B for an instance we no longer drive.
    }

    pub fn two_b_received(&mut self, sender: RMId, votes: TwoBTxnVotes) {
        match votes {
            TwoBTxnVotes::Failures {
                txn_id,
                instance_rm_id,
                failures,
            } => {
                let id: InstanceId = (txn_id, instance_rm_id);
                if let Some(proposal) = self.proposals.get_mut(&id) {
                    let sends = proposal.two_b_failures_received(sender, failures);
                    self.dispatch(sends);
                }
            }
            TwoBTxnVotes::Outcome { txn, outcome } => {
                self.outcome_received(sender, txn, outcome);
            }
        }
    }

    fn outcome_received(&mut self, sender: RMId, txn: Txn, outcome: Outcome) {
        let txn_id = txn.id;
        if let Some(proposer) = self.proposers.get_mut(&txn_id) {
            let effects = proposer.outcome_received(sender, outcome);
            self.run_effects(txn_id, effects);
            self.check_all_disk();
            return;
        }

        let txn = Arc::new(txn);
        let active = txn
            .allocation_for(self.rm_id)
            .map(|a| a.is_active())
            .unwrap_or(false);

        if active {
            // We were active but hold no record: we died and recovered.
            // Start abort proposals for our own instance so the result
            // propagates to every acceptor, and learn the outcome.
            debug!(txn = %txn_id, %sender, "2B for unknown txn while active; starting abort proposals");
            let ballots = make_abort_ballots(&txn, self.rm_id);
            self.create_proposer(txn.clone(), ProposerMode::ActiveLearner);
            self.new_proposal(txn, ballots);
            let effects = self
                .proposers
                .get_mut(&txn_id)
                .expect("created above")
                .outcome_received(sender, outcome);
            self.run_effects(txn_id, effects);
        } else if outcome.is_commit() {
            debug!(txn = %txn_id, %sender, "2B commit for unknown txn; passive learner");
            self.create_proposer(txn, ProposerMode::PassiveLearner);
            let effects = self
                .proposers
                .get_mut(&txn_id)
                .expect("created above")
                .outcome_received(sender, outcome);
            self.run_effects(txn_id, effects);
        } else {
            // An abort we once knew about and have since forgotten:
            // answer with an immediate TLC.
            trace!(txn = %txn_id, %sender, "immediate TLC for unknown abort");
            self.router.send(sender, Message::TxnLocallyComplete(txn_id));
        }
        self.check_all_disk();
    }

    pub fn tgc_received(&mut self, sender: RMId, txn_id: TxnId) {
        if let Some(proposer) = self.proposers.get_mut(&txn_id) {
            let effects = proposer.tgc_received(sender);
            self.run_effects(txn_id, effects);
        } else {
            trace!(txn = %txn_id, %sender, "TGC ignored");
        }
    }

    /// The submitter gave up on the txn before an outcome (connection
    /// to its client died).
    pub fn tsa_received(&mut self, _sender: RMId, txn_id: TxnId) {
        if self.proposers.contains_key(&txn_id) {
            // Feed abort ballots into our instance; consensus completes
            // as an abort unless a commit was already accepted.
            let Some(proposer) = self.proposers.get(&txn_id) else {
                return;
            };
            if proposer.outcome().is_some() {
                return;
            }
            let ballots = make_abort_ballots(proposer.txn(), self.rm_id);
            let id: InstanceId = (txn_id, self.rm_id);
            if let Some(proposal) = self.proposals.get_mut(&id) {
                let sends = proposal.add_ballots(ballots);
                self.dispatch(sends);
            }
        }
    }

    pub fn topology_changed(&mut self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>) {
        if let Some(prev) = self.on_disk.take() {
            prev(false);
        }
        self.topology = Some(topology.clone());
        let txn_ids: Vec<TxnId> = self.proposers.keys().copied().collect();
        for txn_id in txn_ids {
            if let Some(proposer) = self.proposers.get_mut(&txn_id) {
                let effects = proposer.topology_changed(&topology);
                self.run_effects(txn_id, effects);
            }
        }

        if topology.next().is_some() {
            self.on_disk = Some(done);
            self.check_all_disk();
        } else {
            done(true);
        }
    }

    /// Quiet stages 0 and 2 complete once every non-topology proposer
    /// has its TLC durably recorded.
    fn check_all_disk(&mut self) {
        if self.on_disk.is_none() {
            return;
        }
        let all_done = self
            .proposers
            .values()
            .all(|p| p.tlc_done() || p.is_topology_txn());
        if all_done {
            if let Some(done) = self.on_disk.take() {
                done(true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn run_effects(&mut self, txn_id: TxnId, effects: ProposerEffects) {
        if let Some(outcome) = effects.deliver {
            self.deliver_to_vars(txn_id, &outcome);
            self.finish_proposals(txn_id);
        }
        if let Some(rm) = effects.reply_tlc {
            self.router.send(rm, Message::TxnLocallyComplete(txn_id));
        }
        if effects.send_tlc {
            self.persist_and_send_tlc(txn_id);
        }
        if effects.finished {
            self.finish_proposer(txn_id);
        }
    }

    fn deliver_to_vars(&self, txn_id: TxnId, outcome: &Outcome) {
        let Some(proposer) = self.proposers.get(&txn_id) else {
            return;
        };
        let txn = proposer.txn().clone();
        let Some(alloc) = txn.allocation_for(self.rm_id) else {
            return;
        };
        let (committed, clock) = match outcome {
            Outcome::Commit { clock } => (true, clock.clone()),
            Outcome::Abort(_) => (false, tessera_types::VectorClock::new()),
        };
        for action in txn.actions_for(alloc) {
            let positions: Option<Positions> = match &action.value {
                ActionValue::Create { positions, .. } => Some(positions.clone()),
                _ => None,
            };
            self.vars.receive_outcome(
                action.var,
                txn_id,
                committed,
                clock.clone(),
                action.is_read(),
                action.is_write(),
                (committed && action.is_write()).then(|| txn.clone()),
                positions,
            );
        }
    }

    /// Persists the proposer record, then sends TLC to every acceptor.
    /// The TLC rides a one-shot sender so not-yet-reconnected acceptors
    /// still get theirs.
    fn persist_and_send_tlc(&mut self, txn_id: TxnId) {
        let Some(proposer) = self.proposers.get_mut(&txn_id) else {
            return;
        };
        proposer.tlc_sent();
        let state = proposer.state();
        let acceptors = state.acceptors.clone();
        let bytes = bincode::serialize(&state).expect("proposer state serializes");
        let key = txn_id.as_bytes().to_vec();
        let handle = self.self_handle.clone().expect("manager wired");

        let future = self
            .db
            .read_write(move |txn| txn.put(Table::Proposers, &key, &bytes));
        std::thread::Builder::new()
            .name("proposer-write-wait".to_string())
            .spawn(move || {
                if future.wait().is_err() {
                    return;
                }
                handle.enqueue(move |pm| pm.send_tlc(txn_id, acceptors));
            })
            .expect("spawn proposer write waiter");
    }

    fn send_tlc(&mut self, txn_id: TxnId, acceptors: Vec<RMId>) {
        trace!(txn = %txn_id, ?acceptors, "sending TLC");
        self.tlc_senders.retain(|s| !s.is_done());
        let sender = Arc::new(OneShotSender::new(
            Message::TxnLocallyComplete(txn_id),
            acceptors,
        ));
        self.tlc_senders.push(sender.clone());
        self.publisher
            .add_subscriber(sender as Arc<dyn ServerConnectionSubscriber>);
        self.check_all_disk();
    }

    fn finish_proposals(&mut self, txn_id: TxnId) {
        let ids: Vec<InstanceId> = self
            .proposals
            .keys()
            .filter(|(t, _)| *t == txn_id)
            .copied()
            .collect();
        for id in ids {
            if let Some(proposal) = self.proposals.get_mut(&id) {
                proposal.finish();
            }
        }
    }

    fn finish_proposer(&mut self, txn_id: TxnId) {
        let Some(proposer) = self.proposers.remove(&txn_id) else {
            return;
        };
        debug!(txn = %txn_id, "proposer finished");
        self.proposals.retain(|(t, _), _| *t != txn_id);
        drop(proposer);

        let key = txn_id.as_bytes().to_vec();
        let _ = self.db.read_write(move |txn| {
            txn.delete(Table::Proposers, &key);
        });
        self.check_all_disk();
    }

    /// Installs a restored proposer (startup recovery path): TLCs are
    /// re-sent immediately.
    fn load_from_state(&mut self, state: ProposerState) {
        let txn_id = state.txn.id;
        if self.proposers.contains_key(&txn_id) {
            panic!("proposer for {txn_id} already exists at load");
        }
        let proposer = Proposer::from_state(state, self.rm_id);
        let acceptors = proposer.acceptors().to_vec();
        self.proposers.insert(txn_id, proposer);
        self.send_tlc(txn_id, acceptors);
    }

    fn dispatch(&self, sends: Sends) {
        for (rm, msg) in sends {
            self.router.send(rm, msg);
        }
    }

    pub fn status(&self, out: &mut String) {
        let _ = writeln!(out, "- Proposers: {}", self.proposers.len());
        for proposer in self.proposers.values() {
            proposer.status(out);
        }
        let _ = writeln!(out, "- Proposals: {}", self.proposals.len());
    }
}

// ============================================================================
// ProposerDispatcher
// ============================================================================

/// Routes proposer traffic by the txn id's sharding byte; implements
/// the var layer's [`VoteSink`] so ballots land on the right shard.
pub struct ProposerDispatcher {
    dispatcher: ShardedDispatcher<ProposerManager>,
}

impl ProposerDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        shard_count: usize,
        rm_id: RMId,
        boot_count: BootCount,
        tie_break: u32,
        db: Db,
        router: Arc<dyn MessageRouter>,
        publisher: Arc<dyn ServerConnectionPublisher>,
        vars: Arc<VarDispatcher>,
    ) -> Self {
        let dispatcher = ShardedDispatcher::spawn("proposers", shard_count, |_| {
            ProposerManager::new(
                rm_id,
                boot_count,
                tie_break,
                db.clone(),
                router.clone(),
                publisher.clone(),
                vars.clone(),
            )
        });
        for handle in dispatcher.handles() {
            let wired = handle.clone();
            handle.enqueue(move |pm| pm.set_self_handle(wired));
        }
        let this = Self { dispatcher };
        this.load_from_disk(&db);
        this
    }

    fn load_from_disk(&self, db: &Db) {
        let states = db
            .read(|txn| {
                txn.cursor(Table::Proposers)
                    .map(|(_, v)| v)
                    .collect::<Vec<_>>()
            })
            .wait()
            .unwrap_or_else(|e| panic!("store scan failed loading proposers: {e}"));
        let count = states.len();
        for bytes in states {
            let state: ProposerState = bincode::deserialize(&bytes)
                .unwrap_or_else(|e| panic!("persisted proposer state failed to decode: {e}"));
            self.dispatcher
                .with_shard(state.txn.id.sharding_byte(), move |pm| {
                    pm.load_from_state(state)
                });
        }
        if count > 0 {
            info!(count, "loaded proposers from disk");
        }
    }

    pub fn txn_received(&self, sender: RMId, txn: Txn) {
        self.dispatcher
            .with_shard(txn.id.sharding_byte(), move |pm| {
                pm.txn_received(sender, txn)
            });
    }

    pub fn one_b_received(&self, sender: RMId, votes: OneBTxnVotes) {
        self.dispatcher
            .with_shard(votes.txn_id.sharding_byte(), move |pm| {
                pm.one_b_received(sender, votes)
            });
    }

    pub fn two_b_received(&self, sender: RMId, votes: TwoBTxnVotes) {
        let txn_id = match &votes {
            TwoBTxnVotes::Outcome { txn, .. } => txn.id,
            TwoBTxnVotes::Failures { txn_id, .. } => *txn_id,
        };
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |pm| {
                pm.two_b_received(sender, votes)
            });
    }

    pub fn tgc_received(&self, sender: RMId, txn_id: TxnId) {
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |pm| {
                pm.tgc_received(sender, txn_id)
            });
    }

    pub fn tsa_received(&self, sender: RMId, txn_id: TxnId) {
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |pm| {
                pm.tsa_received(sender, txn_id)
            });
    }

    /// Fans the topology out to every shard; `done` fires once with the
    /// conjunction of the shard results.
    pub fn topology_changed(&self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>) {
        let shards = self.dispatcher.shard_count();
        let gate = Arc::new(std::sync::Mutex::new((shards, true, Some(done))));
        self.dispatcher.for_each_shard(move |pm| {
            let gate = gate.clone();
            pm.topology_changed(
                topology.clone(),
                Box::new(move |ok| {
                    let mut gate = gate.lock().expect("gate");
                    gate.1 &= ok;
                    gate.0 -= 1;
                    if gate.0 == 0 {
                        if let Some(done) = gate.2.take() {
                            done(gate.1);
                        }
                    }
                }),
            );
        });
    }

    pub fn shutdown(self) {
        self.dispatcher.shutdown();
    }
}

impl VoteSink for ProposerDispatcher {
    fn ballot_cast(&self, txn_id: TxnId, ballot: Ballot) {
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |pm| {
                pm.ballot_cast(txn_id, ballot)
            });
    }

    fn outcome_processed(&self, txn_id: TxnId, var: VarUUId) {
        self.dispatcher
            .with_shard(txn_id.sharding_byte(), move |pm| {
                if let Some(proposer) = pm.proposers.get_mut(&txn_id) {
                    let effects = proposer.var_processed(var);
                    pm.run_effects(txn_id, effects);
                    pm.check_all_disk();
                }
            });
    }
}
