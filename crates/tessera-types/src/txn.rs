//! The transaction model.
//!
//! A [`Txn`] is a batch of [`Action`]s over distinct vars plus the
//! allocation of those actions to RMs. Allocations list the active
//! (voting) RMs first; passive learners carry a zero boot count. The
//! same structure travels on the wire, is persisted in the `txns` table,
//! and is replayed by proposers and acceptors.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::ids::{BootCount, Positions, RMId, TxnId, VarUUId};

// ============================================================================
// References
// ============================================================================

/// An outgoing reference from one var to another.
///
/// References are the authorization mechanism: the capability bounds what
/// the holder may do with the target. Positions ride along so a receiver
/// can resolve the target's replicas without a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub var: VarUUId,
    pub positions: Option<Positions>,
    pub capability: Capability,
}

impl Reference {
    pub fn new(var: VarUUId, positions: Option<Positions>, capability: Capability) -> Self {
        Self {
            var,
            positions,
            capability,
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// What a single action does to its var.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionValue {
    /// Read at the claimed version (the var's writes-clock element).
    Read { version: u64 },

    /// Blind write of a new value and reference set.
    Write {
        value: Bytes,
        references: Vec<Reference>,
    },

    /// Read at `version` then write.
    ReadWrite {
        version: u64,
        value: Bytes,
        references: Vec<Reference>,
    },

    /// Create a new var. Positions are fixed here, forever.
    Create {
        positions: Positions,
        value: Bytes,
        references: Vec<Reference>,
    },

    /// A write that re-asserts the current value, issued by the var
    /// itself to compact its frame chain.
    Roll {
        version: u64,
        value: Bytes,
        references: Vec<Reference>,
    },

    /// Placeholder for an action another RM owns; carried so action
    /// indices stay aligned across replicas.
    Missing,
}

/// A unit of work on one var within a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub var: VarUUId,
    pub value: ActionValue,
}

impl Action {
    pub fn new(var: VarUUId, value: ActionValue) -> Self {
        Self { var, value }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self.value,
            ActionValue::Read { .. } | ActionValue::ReadWrite { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.value,
            ActionValue::Write { .. }
                | ActionValue::ReadWrite { .. }
                | ActionValue::Create { .. }
                | ActionValue::Roll { .. }
        )
    }

    pub fn is_create(&self) -> bool {
        matches!(self.value, ActionValue::Create { .. })
    }

    pub fn is_roll(&self) -> bool {
        matches!(self.value, ActionValue::Roll { .. })
    }

    /// The version this action claims to have read, if it reads.
    pub fn read_version(&self) -> Option<u64> {
        match self.value {
            ActionValue::Read { version }
            | ActionValue::ReadWrite { version, .. }
            | ActionValue::Roll { version, .. } => Some(version),
            _ => None,
        }
    }

    /// The value this action writes, if it writes.
    pub fn written_value(&self) -> Option<(&Bytes, &[Reference])> {
        match &self.value {
            ActionValue::Write { value, references }
            | ActionValue::ReadWrite {
                value, references, ..
            }
            | ActionValue::Create {
                value, references, ..
            }
            | ActionValue::Roll {
                value, references, ..
            } => Some((value, references)),
            _ => None,
        }
    }
}

// ============================================================================
// Allocations
// ============================================================================

/// Assignment of a subset of a transaction's actions to one RM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub rm_id: RMId,

    /// The boot count the txn was prepared for on this RM; zero marks a
    /// passive learner.
    pub active: BootCount,

    /// Indices into the txn's action list.
    pub action_indices: Vec<u32>,
}

impl Allocation {
    pub fn active(rm_id: RMId, boot: BootCount, action_indices: Vec<u32>) -> Self {
        debug_assert!(!boot.is_zero(), "active allocation requires a boot count");
        Self {
            rm_id,
            active: boot,
            action_indices,
        }
    }

    pub fn passive(rm_id: RMId, action_indices: Vec<u32>) -> Self {
        Self {
            rm_id,
            active: BootCount::ZERO,
            action_indices,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_zero()
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// A multi-object transaction.
///
/// # Invariants
///
/// - Actions touch distinct vars.
/// - Allocations list active RMs before passive ones.
/// - `two_f_inc` is the replica count per var under the topology version
///   the txn was submitted against (topology txns may carry fewer
///   allocations than `two_f_inc`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    pub id: TxnId,
    pub actions: Vec<Action>,
    pub allocations: Vec<Allocation>,
    pub f_inc: u8,
    pub two_f_inc: u16,
    pub topology_version: u32,
    pub is_topology: bool,
    pub retry: bool,
}

impl Txn {
    /// The RM that submitted this transaction.
    pub fn submitter(&self) -> RMId {
        self.id.rm_id()
    }

    /// The acceptors for this txn: the first `two_f_inc` allocated RMs.
    ///
    /// Topology txns may genuinely carry fewer.
    pub fn acceptors(&self) -> Vec<RMId> {
        self.allocations
            .iter()
            .take(self.two_f_inc as usize)
            .map(|a| a.rm_id)
            .collect()
    }

    /// The active (voting) RMs.
    pub fn active_rms(&self) -> Vec<RMId> {
        self.allocations
            .iter()
            .take_while(|a| a.is_active())
            .map(|a| a.rm_id)
            .collect()
    }

    /// This RM's allocation, if it has one.
    pub fn allocation_for(&self, rm_id: RMId) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.rm_id == rm_id)
    }

    /// The actions assigned to an allocation.
    pub fn actions_for<'a>(&'a self, alloc: &'a Allocation) -> impl Iterator<Item = &'a Action> {
        alloc
            .action_indices
            .iter()
            .map(move |&idx| &self.actions[idx as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    fn var(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn txn_fixture() -> Txn {
        Txn {
            id: TxnId::from_parts(1, Default::default(), BootCount::new(3), RMId::new(10)),
            actions: vec![
                Action::new(var(1), ActionValue::Read { version: 2 }),
                Action::new(
                    var(2),
                    ActionValue::Write {
                        value: Bytes::from_static(b"x"),
                        references: vec![Reference::new(var(1), None, Capability::read_all())],
                    },
                ),
            ],
            allocations: vec![
                Allocation::active(RMId::new(10), BootCount::new(3), vec![0, 1]),
                Allocation::active(RMId::new(11), BootCount::new(1), vec![0, 1]),
                Allocation::passive(RMId::new(12), vec![0, 1]),
            ],
            f_inc: 2,
            two_f_inc: 3,
            topology_version: 1,
            is_topology: false,
            retry: false,
        }
    }

    #[test]
    fn action_classification() {
        let read = Action::new(var(1), ActionValue::Read { version: 1 });
        assert!(read.is_read() && !read.is_write());
        assert_eq!(read.read_version(), Some(1));

        let rw = Action::new(
            var(1),
            ActionValue::ReadWrite {
                version: 1,
                value: Bytes::new(),
                references: vec![],
            },
        );
        assert!(rw.is_read() && rw.is_write());

        let create = Action::new(
            var(1),
            ActionValue::Create {
                positions: Positions::new(vec![0]),
                value: Bytes::new(),
                references: vec![],
            },
        );
        assert!(create.is_write() && create.is_create() && !create.is_read());
        assert_eq!(create.read_version(), None);
    }

    #[test]
    fn acceptors_and_actives() {
        let txn = txn_fixture();
        assert_eq!(
            txn.acceptors(),
            vec![RMId::new(10), RMId::new(11), RMId::new(12)]
        );
        assert_eq!(txn.active_rms(), vec![RMId::new(10), RMId::new(11)]);
        assert_eq!(txn.submitter(), RMId::new(10));
    }

    #[test]
    fn allocation_lookup() {
        let txn = txn_fixture();
        let alloc = txn.allocation_for(RMId::new(12)).expect("passive alloc");
        assert!(!alloc.is_active());
        assert_eq!(txn.actions_for(alloc).count(), 2);
        assert!(txn.allocation_for(RMId::new(99)).is_none());
    }
}
