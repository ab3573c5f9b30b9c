//! Per-instance proposals.
//!
//! A [`Proposal`] drives the Paxos rounds for one instance of one
//! transaction: 1A to the acceptors, 1B promises back, then 2A with the
//! chosen ballots. Failure reports bump the round (ordered by the
//! handshake tiebreak) and restart phase 1. Phase 1 is never skipped:
//! a previous incarnation of this node may have voted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use tessera_types::{Ballot, RMId, Txn, TxnId, VarUUId};
use tessera_wire::{Message, OneATxnVotes, OneBTxnVotes, Promise, RoundNumber, TwoATxnVotes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Collecting 1B promises.
    OneA,
    /// 2A sent; awaiting the outcome (or failures).
    TwoA,
    /// Outcome reached; no further rounds.
    Finished,
}

/// Messages a proposal wants sent, paired with their destinations.
pub type Sends = Vec<(RMId, Message)>;

/// One Paxos instance: `(txn, instance_rm)`.
pub struct Proposal {
    txn: Arc<Txn>,
    instance: RMId,
    acceptors: Vec<RMId>,

    /// Promise quorum: `F+1` of the `2F+1` acceptors.
    quorum: usize,

    round: RoundNumber,
    phase: Phase,

    /// Vars this instance votes on.
    expected_vars: BTreeSet<VarUUId>,

    /// Our own ballots, as the vars deliver them.
    ballots: BTreeMap<VarUUId, Ballot>,

    /// 1B promises per acceptor for the current round.
    promises: HashMap<RMId, Vec<(VarUUId, Promise)>>,
}

impl Proposal {
    pub fn new(
        txn: Arc<Txn>,
        instance: RMId,
        tie_break: u32,
        proposer_rm: RMId,
        ballots: Vec<Ballot>,
    ) -> Self {
        let acceptors = txn.acceptors();
        let quorum = usize::from(txn.f_inc);
        let expected_vars = txn
            .allocation_for(instance)
            .map(|alloc| {
                alloc
                    .action_indices
                    .iter()
                    .map(|&idx| txn.actions[idx as usize].var)
                    .collect()
            })
            .unwrap_or_default();
        let mut this = Self {
            round: RoundNumber::new(0, tie_break, proposer_rm),
            txn,
            instance,
            acceptors,
            quorum,
            phase: Phase::OneA,
            expected_vars,
            ballots: BTreeMap::new(),
            promises: HashMap::new(),
        };
        for ballot in ballots {
            this.ballots.insert(ballot.var, ballot);
        }
        this
    }

    pub fn instance(&self) -> RMId {
        self.instance
    }

    /// Opens the first round.
    pub fn start(&mut self) -> Sends {
        debug!(
            txn = %self.txn.id,
            instance = %self.instance,
            acceptors = ?self.acceptors,
            "proposal starting"
        );
        self.send_one_a()
    }

    /// A var delivered its ballot for this instance.
    pub fn add_ballots(&mut self, ballots: Vec<Ballot>) -> Sends {
        for ballot in ballots {
            self.ballots.insert(ballot.var, ballot);
        }
        self.maybe_send_two_a()
    }

    pub fn one_b_received(&mut self, sender: RMId, votes: OneBTxnVotes) -> Sends {
        if self.phase != Phase::OneA || votes.round_number != self.round {
            trace!(txn = %self.txn.id, %sender, "stale 1B ignored");
            return Vec::new();
        }

        // Any too-low promise forces a higher round immediately.
        let blocked: Option<RoundNumber> = votes
            .promises
            .iter()
            .filter_map(|(_, p)| match p {
                Promise::RoundNumberTooLow { promised } => Some(*promised),
                _ => None,
            })
            .max();
        if let Some(promised) = blocked {
            return self.bump_round(promised);
        }

        self.promises.insert(sender, votes.promises);
        self.maybe_send_two_a()
    }

    /// 2B failure report: some acceptor had higher promises.
    pub fn two_b_failures_received(
        &mut self,
        _sender: RMId,
        failures: Vec<(VarUUId, RoundNumber)>,
    ) -> Sends {
        if self.phase == Phase::Finished {
            return Vec::new();
        }
        let highest = failures
            .iter()
            .map(|(_, r)| *r)
            .max()
            .unwrap_or(self.round);
        self.bump_round(highest)
    }

    /// The outcome is known; stop proposing.
    pub fn finish(&mut self) {
        self.phase = Phase::Finished;
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    // ------------------------------------------------------------------

    fn bump_round(&mut self, at_least: RoundNumber) -> Sends {
        let base = self.round.round.max(at_least.round);
        self.round = RoundNumber::new(
            base.saturating_add(1),
            self.round.tie_break,
            self.round.rm_id,
        );
        self.phase = Phase::OneA;
        self.promises.clear();
        debug!(txn = %self.txn.id, instance = %self.instance, round = self.round.round, "retrying at higher round");
        self.send_one_a()
    }

    fn send_one_a(&mut self) -> Sends {
        let msg = Message::OneATxnVotes(OneATxnVotes {
            txn_id: self.txn.id,
            instance_rm_id: self.instance,
            round_number: self.round,
        });
        self.acceptors
            .iter()
            .map(|&rm| (rm, msg.clone()))
            .collect()
    }

    /// Phase 2 opens once a promise quorum is in and every expected var
    /// has a ballot (own or carried forward from a prior round).
    fn maybe_send_two_a(&mut self) -> Sends {
        if self.phase != Phase::OneA || self.promises.len() < self.quorum {
            return Vec::new();
        }

        // Promised acceptances override our own ballots: highest
        // accepted round per var wins.
        let mut chosen: BTreeMap<VarUUId, (Option<RoundNumber>, Ballot)> = BTreeMap::new();
        for ballot in self.ballots.values() {
            chosen.insert(ballot.var, (None, ballot.clone()));
        }
        for promises in self.promises.values() {
            for (var, promise) in promises {
                if let Promise::Accepted {
                    round_number,
                    ballot,
                } = promise
                {
                    let replace = match chosen.get(var) {
                        Some((Some(prev), _)) => round_number > prev,
                        Some((None, _)) | None => true,
                    };
                    if replace {
                        chosen.insert(*var, (Some(*round_number), ballot.clone()));
                    }
                }
            }
        }

        let have: BTreeSet<VarUUId> = chosen.keys().copied().collect();
        if !self.expected_vars.iter().all(|v| have.contains(v)) {
            // Still waiting on local var votes.
            return Vec::new();
        }

        self.phase = Phase::TwoA;
        let ballots: Vec<Ballot> = chosen.into_values().map(|(_, b)| b).collect();
        trace!(txn = %self.txn.id, instance = %self.instance, n = ballots.len(), "sending 2A");
        let msg = Message::TwoATxnVotes(TwoATxnVotes {
            txn: (*self.txn).clone(),
            instance_rm_id: self.instance,
            round_number: self.round,
            ballots,
        });
        self.acceptors
            .iter()
            .map(|&rm| (rm, msg.clone()))
            .collect()
    }
}

/// Synthesises deadlock-abort ballots for every action allocated to
/// `rm` — issued when local progress is impossible (wrong incarnation,
/// removed sender) so the cluster still converges.
pub fn make_abort_ballots(txn: &Txn, rm: RMId) -> Vec<Ballot> {
    txn.allocation_for(rm)
        .map(|alloc| {
            alloc
                .action_indices
                .iter()
                .map(|&idx| Ballot::deadlock(txn.actions[idx as usize].var))
                .collect()
        })
        .unwrap_or_default()
}

/// The id of a proposal: `(txn, instance)`.
pub type InstanceId = (TxnId, RMId);

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{
        Action, ActionValue, Allocation, BootCount, VectorClockBuilder,
    };

    fn uuid(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn txn() -> Arc<Txn> {
        Arc::new(Txn {
            id: TxnId::from_parts(1, Default::default(), BootCount::new(1), RMId::new(1)),
            actions: vec![Action::new(uuid(1), ActionValue::Write {
                value: Default::default(),
                references: vec![],
            })],
            allocations: vec![
                Allocation::active(RMId::new(1), BootCount::new(1), vec![0]),
                Allocation::active(RMId::new(2), BootCount::new(1), vec![0]),
                Allocation::passive(RMId::new(3), vec![0]),
            ],
            f_inc: 2,
            two_f_inc: 3,
            topology_version: 1,
            is_topology: false,
            retry: false,
        })
    }

    fn commit_ballot() -> Ballot {
        Ballot::commit(uuid(1), VectorClockBuilder::new().set(uuid(1), 1).build())
    }

    fn free_one_b(p: &Proposal) -> OneBTxnVotes {
        OneBTxnVotes {
            txn_id: p.txn.id,
            instance_rm_id: p.instance,
            round_number: p.round,
            promises: vec![(uuid(1), Promise::FreeChoice)],
        }
    }

    #[test]
    fn phase_one_then_two() {
        let mut p = Proposal::new(txn(), RMId::new(1), 7, RMId::new(1), vec![commit_ballot()]);
        let one_a = p.start();
        assert_eq!(one_a.len(), 3);
        assert!(matches!(one_a[0].1, Message::OneATxnVotes(_)));

        // One promise is below quorum.
        let vb = free_one_b(&p);
        assert!(p.one_b_received(RMId::new(1), vb).is_empty());

        // Quorum reached with our ballot present: 2A goes out to all.
        let vb = free_one_b(&p);
        let two_a = p.one_b_received(RMId::new(2), vb);
        assert_eq!(two_a.len(), 3);
        match &two_a[0].1 {
            Message::TwoATxnVotes(v) => {
                assert_eq!(v.ballots.len(), 1);
                assert!(v.ballots[0].vote.is_commit());
            }
            other => panic!("expected 2A, got {other:?}"),
        }
    }

    #[test]
    fn two_a_waits_for_local_ballots() {
        let mut p = Proposal::new(txn(), RMId::new(1), 7, RMId::new(1), vec![]);
        p.start();
        let vb = free_one_b(&p);
        p.one_b_received(RMId::new(1), vb);
        let vb = free_one_b(&p);
        assert!(
            p.one_b_received(RMId::new(2), vb).is_empty(),
            "no ballot for the expected var yet"
        );

        let two_a = p.add_ballots(vec![commit_ballot()]);
        assert_eq!(two_a.len(), 3);
    }

    #[test]
    fn prior_acceptance_overrides_own_ballot() {
        let mut p = Proposal::new(txn(), RMId::new(1), 7, RMId::new(1), vec![commit_ballot()]);
        p.start();

        let accepted = Ballot::deadlock(uuid(1));
        let vb = OneBTxnVotes {
            txn_id: p.txn.id,
            instance_rm_id: p.instance,
            round_number: p.round,
            promises: vec![(
                uuid(1),
                Promise::Accepted {
                    round_number: RoundNumber::new(3, 0, RMId::new(9)),
                    ballot: accepted.clone(),
                },
            )],
        };
        p.one_b_received(RMId::new(1), vb);
        let vb = free_one_b(&p);
        let two_a = p.one_b_received(RMId::new(2), vb);
        match &two_a[0].1 {
            Message::TwoATxnVotes(v) => assert_eq!(v.ballots[0], accepted),
            other => panic!("expected 2A, got {other:?}"),
        }
    }

    #[test]
    fn too_low_promise_bumps_round() {
        let mut p = Proposal::new(txn(), RMId::new(1), 7, RMId::new(1), vec![commit_ballot()]);
        p.start();
        let first_round = p.round;

        let vb = OneBTxnVotes {
            txn_id: p.txn.id,
            instance_rm_id: p.instance,
            round_number: p.round,
            promises: vec![(
                uuid(1),
                Promise::RoundNumberTooLow {
                    promised: RoundNumber::new(5, 0, RMId::new(9)),
                },
            )],
        };
        let resend = p.one_b_received(RMId::new(1), vb);
        assert_eq!(resend.len(), 3, "new 1A round broadcast");
        assert!(p.round.round > 5);
        assert!(p.round > first_round);
    }

    #[test]
    fn failures_restart_phase_one() {
        let mut p = Proposal::new(txn(), RMId::new(1), 7, RMId::new(1), vec![commit_ballot()]);
        p.start();
        let vb = free_one_b(&p);
        p.one_b_received(RMId::new(1), vb);
        let vb = free_one_b(&p);
        p.one_b_received(RMId::new(2), vb);

        let resend = p.two_b_failures_received(
            RMId::new(2),
            vec![(uuid(1), RoundNumber::new(4, 0, RMId::new(2)))],
        );
        assert!(matches!(resend[0].1, Message::OneATxnVotes(_)));
        assert_eq!(p.round.round, 5);

        p.finish();
        assert!(p
            .two_b_failures_received(RMId::new(2), vec![])
            .is_empty());
    }

    #[test]
    fn abort_ballots_cover_allocated_actions() {
        let t = txn();
        let ballots = make_abort_ballots(&t, RMId::new(1));
        assert_eq!(ballots.len(), 1);
        assert!(ballots[0].aborted());
        assert!(make_abort_ballots(&t, RMId::new(99)).is_empty());
    }
}
