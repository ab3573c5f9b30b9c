//! The durable var record.

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::ids::{Positions, TxnId, VarUUId};

/// What the store holds for a var: enough to rebuild its current frame.
///
/// The record never references a transaction that is not itself on
/// disk — the var's write protocol persists both in one store txn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRecord {
    pub var: VarUUId,
    pub positions: Positions,

    /// The txn that wrote the current frame.
    pub write_txn_id: TxnId,

    /// The read-set clock of that txn at commit.
    pub write_txn_clock: VectorClock,

    /// The writes clock of that txn.
    pub writes_clock: VectorClock,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClockBuilder;

    #[test]
    fn record_roundtrips_through_equality() {
        let var = VarUUId::derived_from(&TxnId::ZERO, 1);
        let rec = VarRecord {
            var,
            positions: Positions::new(vec![0, 1]),
            write_txn_id: TxnId::ZERO,
            write_txn_clock: VectorClockBuilder::new().set(var, 1).build(),
            writes_clock: VectorClockBuilder::new().set(var, 1).build(),
        };
        assert_eq!(rec, rec.clone());
    }
}
