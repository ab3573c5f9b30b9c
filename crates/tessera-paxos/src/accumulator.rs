//! Ballot accumulation.
//!
//! An acceptor combines the ballots it accepts — per var, per instance,
//! across retries — into the transaction's outcome. The outcome is
//! determined once every var holds a ballot from each of its voting
//! instances; until then (and even after, for retries) instances may
//! replace their ballots and flip the outcome.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use tessera_types::{
    Abort, Ballot, Outcome, RMId, Txn, TxnId, Update, VarUUId, VectorClockBuilder, Vote,
};
use tessera_wire::RoundNumber;

/// One accepted ballot slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedBallot {
    pub round_number: RoundNumber,
    pub ballot: Ballot,
}

/// Combines per-var ballots across instances into an outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotAccumulator {
    txn_id: TxnId,

    /// For each var: the instances expected to vote on it.
    expected: BTreeMap<VarUUId, BTreeSet<RMId>>,

    /// Accepted ballots, keyed by (var, instance). Replacement is
    /// legal: an instance can change its mind on a retry round.
    accepted: BTreeMap<(VarUUId, RMId), AcceptedBallot>,
}

impl BallotAccumulator {
    /// Builds the accumulator from the transaction's allocations: a
    /// var's voters are the active RMs allocated its action.
    pub fn new(txn: &Txn) -> Self {
        let mut expected: BTreeMap<VarUUId, BTreeSet<RMId>> = BTreeMap::new();
        for alloc in txn.allocations.iter().filter(|a| a.is_active()) {
            for &idx in &alloc.action_indices {
                let var = txn.actions[idx as usize].var;
                expected.entry(var).or_default().insert(alloc.rm_id);
            }
        }
        Self {
            txn_id: txn.id,
            expected,
            accepted: BTreeMap::new(),
        }
    }

    /// Restores from the persisted acceptor state.
    pub fn from_parts(
        txn: &Txn,
        accepted: BTreeMap<(VarUUId, RMId), AcceptedBallot>,
    ) -> Self {
        let mut this = Self::new(txn);
        this.accepted = accepted;
        this
    }

    pub fn accepted(&self) -> &BTreeMap<(VarUUId, RMId), AcceptedBallot> {
        &self.accepted
    }

    /// Records (or replaces) a ballot from `instance` for `ballot.var`
    /// and returns the outcome if one is now determined.
    pub fn ballot_received(
        &mut self,
        instance: RMId,
        round_number: RoundNumber,
        ballot: Ballot,
    ) -> Option<Outcome> {
        let key = (ballot.var, instance);
        if let Some(prev) = self.accepted.get(&key) {
            if prev.round_number > round_number {
                // Stale retry; the newer acceptance stands.
                return self.determine();
            }
        }
        trace!(
            txn = %self.txn_id,
            var = %ballot.var,
            instance = %instance,
            vote = ballot.vote.name(),
            "ballot received"
        );
        self.accepted.insert(
            key,
            AcceptedBallot {
                round_number,
                ballot,
            },
        );
        self.determine()
    }

    /// True once every var has a ballot from each of its voting
    /// instances.
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|(var, instances)| {
            instances
                .iter()
                .all(|rm| self.accepted.contains_key(&(*var, *rm)))
        })
    }

    /// Combines the accepted ballots, if complete:
    ///
    /// - all commits → `Commit(max clock)`
    /// - any bad read → `Abort(Rerun(evidence))`, earliest conflicting
    ///   txn first
    /// - otherwise → `Abort(Resubmit)`
    pub fn determine(&self) -> Option<Outcome> {
        if !self.is_complete() {
            return None;
        }

        let mut updates: Vec<Update> = Vec::new();
        let mut any_abort = false;
        let mut clock = VectorClockBuilder::new();

        for slot in self.accepted.values() {
            match &slot.ballot.vote {
                Vote::Commit => {
                    clock = clock.merge_in_max(&slot.ballot.clock);
                }
                Vote::AbortDeadlock => {
                    any_abort = true;
                }
                Vote::AbortBadRead { txn_id, actions } => {
                    any_abort = true;
                    if !updates.iter().any(|u| u.txn_id == *txn_id) {
                        updates.push(Update {
                            txn_id: *txn_id,
                            actions: actions.clone(),
                            clock: slot.ballot.clock.clone(),
                        });
                    }
                }
            }
        }

        let outcome = if !any_abort {
            Outcome::Commit {
                clock: clock.build(),
            }
        } else if updates.is_empty() {
            Outcome::Abort(Abort::Resubmit)
        } else {
            updates.sort_by_key(|u| u.txn_id);
            Outcome::Abort(Abort::Rerun(updates))
        };
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{Action, ActionValue, Allocation, BootCount, VectorClock};

    fn uuid(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn txn_id(n: u64) -> TxnId {
        TxnId::from_parts(n, Default::default(), BootCount::new(1), RMId::new(1))
    }

    fn round(rm: RMId) -> RoundNumber {
        RoundNumber::new(0, 0, rm)
    }

    /// Two actions; var 1 voted by RMs 1 and 2, var 2 by RM 2 only.
    fn txn_fixture() -> Txn {
        Txn {
            id: txn_id(1),
            actions: vec![
                Action::new(uuid(1), ActionValue::Read { version: 1 }),
                Action::new(uuid(2), ActionValue::Read { version: 1 }),
            ],
            allocations: vec![
                Allocation::active(RMId::new(1), BootCount::new(1), vec![0]),
                Allocation::active(RMId::new(2), BootCount::new(1), vec![0, 1]),
                Allocation::passive(RMId::new(3), vec![0, 1]),
            ],
            f_inc: 2,
            two_f_inc: 3,
            topology_version: 1,
            is_topology: false,
            retry: false,
        }
    }

    fn clock_at(var: VarUUId, v: u64) -> VectorClock {
        VectorClockBuilder::new().set(var, v).build()
    }

    #[test]
    fn no_outcome_until_every_instance_votes() {
        let txn = txn_fixture();
        let mut acc = BallotAccumulator::new(&txn);

        let out = acc.ballot_received(
            RMId::new(1),
            round(RMId::new(1)),
            Ballot::commit(uuid(1), clock_at(uuid(1), 1)),
        );
        assert!(out.is_none());

        let out = acc.ballot_received(
            RMId::new(2),
            round(RMId::new(2)),
            Ballot::commit(uuid(1), clock_at(uuid(1), 1)),
        );
        assert!(out.is_none(), "var 2 still unvoted");

        let out = acc.ballot_received(
            RMId::new(2),
            round(RMId::new(2)),
            Ballot::commit(uuid(2), clock_at(uuid(2), 3)),
        );
        let outcome = out.expect("complete");
        match outcome {
            Outcome::Commit { clock } => {
                assert_eq!(clock.at(&uuid(1)), 1);
                assert_eq!(clock.at(&uuid(2)), 3);
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn any_deadlock_aborts_as_resubmit() {
        let txn = txn_fixture();
        let mut acc = BallotAccumulator::new(&txn);
        acc.ballot_received(
            RMId::new(1),
            round(RMId::new(1)),
            Ballot::deadlock(uuid(1)),
        );
        acc.ballot_received(
            RMId::new(2),
            round(RMId::new(2)),
            Ballot::commit(uuid(1), clock_at(uuid(1), 1)),
        );
        let outcome = acc
            .ballot_received(
                RMId::new(2),
                round(RMId::new(2)),
                Ballot::commit(uuid(2), clock_at(uuid(2), 1)),
            )
            .expect("complete");
        assert_eq!(outcome, Outcome::Abort(Abort::Resubmit));
    }

    #[test]
    fn bad_read_carries_evidence() {
        let txn = txn_fixture();
        let winner = txn_id(9);
        let mut acc = BallotAccumulator::new(&txn);
        acc.ballot_received(
            RMId::new(1),
            round(RMId::new(1)),
            Ballot::bad_read(uuid(1), clock_at(uuid(1), 2), winner, vec![]),
        );
        acc.ballot_received(
            RMId::new(2),
            round(RMId::new(2)),
            Ballot::commit(uuid(1), clock_at(uuid(1), 1)),
        );
        let outcome = acc
            .ballot_received(
                RMId::new(2),
                round(RMId::new(2)),
                Ballot::commit(uuid(2), clock_at(uuid(2), 1)),
            )
            .expect("complete");
        match outcome {
            Outcome::Abort(Abort::Rerun(updates)) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].txn_id, winner);
            }
            other => panic!("expected rerun, got {other:?}"),
        }
    }

    #[test]
    fn instance_can_change_its_mind() {
        let txn = txn_fixture();
        let mut acc = BallotAccumulator::new(&txn);
        acc.ballot_received(
            RMId::new(1),
            round(RMId::new(1)),
            Ballot::deadlock(uuid(1)),
        );
        acc.ballot_received(
            RMId::new(2),
            round(RMId::new(2)),
            Ballot::commit(uuid(1), clock_at(uuid(1), 1)),
        );
        let first = acc
            .ballot_received(
                RMId::new(2),
                round(RMId::new(2)),
                Ballot::commit(uuid(2), clock_at(uuid(2), 1)),
            )
            .expect("complete");
        assert_eq!(first, Outcome::Abort(Abort::Resubmit));

        // RM 1 retries at a higher round and commits this time.
        let second = acc
            .ballot_received(
                RMId::new(1),
                round(RMId::new(1)).next(),
                Ballot::commit(uuid(1), clock_at(uuid(1), 1)),
            )
            .expect("still complete");
        assert!(second.is_commit());

        // A stale lower-round replay does not regress the outcome.
        let third = acc
            .ballot_received(
                RMId::new(1),
                round(RMId::new(1)),
                Ballot::deadlock(uuid(1)),
            )
            .expect("still complete");
        assert!(third.is_commit());
    }
}
