//! Votes, ballots, and outcomes.
//!
//! A var votes on a transaction by issuing a [`Ballot`]; the acceptors'
//! accumulators combine ballots into an [`Outcome`], the cluster-wide
//! decision for the txn.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::ids::{TxnId, VarUUId};
use crate::txn::Action;

// ============================================================================
// Votes
// ============================================================================

/// A per-(txn, var) vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,

    /// The txn read a version that is no longer the var's current write;
    /// carries the winning txn and its actions so the client's version
    /// cache can be repaired.
    AbortBadRead {
        txn_id: TxnId,
        actions: Vec<Action>,
    },

    /// Local ordering made progress impossible (e.g. the vote was
    /// synthesised for a txn prepared for a previous incarnation).
    AbortDeadlock,
}

impl Vote {
    pub fn is_commit(&self) -> bool {
        matches!(self, Vote::Commit)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Vote::Commit => "commit",
            Vote::AbortBadRead { .. } => "abort-bad-read",
            Vote::AbortDeadlock => "abort-deadlock",
        }
    }
}

/// A vote plus the clock it was accepted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub var: VarUUId,
    pub clock: VectorClock,
    pub vote: Vote,
}

impl Ballot {
    pub fn commit(var: VarUUId, clock: VectorClock) -> Self {
        Self {
            var,
            clock,
            vote: Vote::Commit,
        }
    }

    pub fn bad_read(var: VarUUId, clock: VectorClock, txn_id: TxnId, actions: Vec<Action>) -> Self {
        Self {
            var,
            clock,
            vote: Vote::AbortBadRead { txn_id, actions },
        }
    }

    /// A deadlock abort at the bottom clock. Used when synthesising
    /// votes for txns this node cannot legitimately vote on.
    pub fn deadlock(var: VarUUId) -> Self {
        Self {
            var,
            clock: VectorClock::new(),
            vote: Vote::AbortDeadlock,
        }
    }

    pub fn aborted(&self) -> bool {
        !self.vote.is_commit()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// A version-cache repair entry carried by `Abort::Rerun`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// The txn whose commit superseded the aborted txn's reads.
    pub txn_id: TxnId,
    /// Actions of that txn, filtered to what the recipient may learn.
    pub actions: Vec<Action>,
    /// The commit clock of that txn.
    pub clock: VectorClock,
}

/// How an aborted transaction should be handled by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Abort {
    /// Nothing was structurally wrong; retry the identical txn after a
    /// backoff.
    Resubmit,

    /// The txn read stale versions; feed these updates into the version
    /// cache, then reissue.
    Rerun(Vec<Update>),
}

/// The cluster-wide decision for a transaction.
///
/// Two outcomes are equal iff they agree on commit-vs-abort and, for
/// commits, on the commit clock; `Rerun` aborts include their update
/// sets in the comparison. Derived equality implements exactly that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Commit { clock: VectorClock },
    Abort(Abort),
}

impl Outcome {
    pub fn is_commit(&self) -> bool {
        matches!(self, Outcome::Commit { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Commit { .. } => "commit",
            Outcome::Abort(Abort::Resubmit) => "abort-resubmit",
            Outcome::Abort(Abort::Rerun(_)) => "abort-rerun",
        }
    }

    /// Strips `Rerun` updates, leaving a plain `Resubmit`.
    ///
    /// Proposers do not need the updates; only the submitter does.
    pub fn without_updates(&self) -> Outcome {
        match self {
            Outcome::Abort(Abort::Rerun(_)) => Outcome::Abort(Abort::Resubmit),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClockBuilder;

    fn var(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    #[test]
    fn ballot_constructors() {
        let clock = VectorClockBuilder::new().set(var(1), 3).build();
        let commit = Ballot::commit(var(1), clock.clone());
        assert!(!commit.aborted());

        let deadlock = Ballot::deadlock(var(1));
        assert!(deadlock.aborted());
        assert!(deadlock.clock.is_empty());

        let bad = Ballot::bad_read(var(1), clock, TxnId::ZERO, vec![]);
        assert_eq!(bad.vote.name(), "abort-bad-read");
    }

    #[test]
    fn outcome_equality_is_commit_and_clock() {
        let c1 = Outcome::Commit {
            clock: VectorClockBuilder::new().set(var(1), 1).build(),
        };
        let c2 = Outcome::Commit {
            clock: VectorClockBuilder::new().set(var(1), 1).build(),
        };
        let c3 = Outcome::Commit {
            clock: VectorClockBuilder::new().set(var(1), 2).build(),
        };
        assert_eq!(c1, c2);
        assert_ne!(c1, c3);
        assert_ne!(c1, Outcome::Abort(Abort::Resubmit));
    }

    #[test]
    fn without_updates_strips_rerun() {
        let rerun = Outcome::Abort(Abort::Rerun(vec![Update {
            txn_id: TxnId::ZERO,
            actions: vec![],
            clock: VectorClock::new(),
        }]));
        assert_eq!(rerun.without_updates(), Outcome::Abort(Abort::Resubmit));

        let commit = Outcome::Commit {
            clock: VectorClock::new(),
        };
        assert_eq!(commit.without_updates(), commit);
    }
}
