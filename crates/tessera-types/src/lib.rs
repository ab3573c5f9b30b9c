//! # tessera-types: Core types for Tessera
//!
//! This crate contains the shared data model used across the Tessera
//! system:
//! - Node and transaction identity ([`RMId`], [`BootCount`], [`TxnId`],
//!   [`VarUUId`], [`ClusterUUId`])
//! - Object placement ([`Positions`], [`Resolver`], [`HashCache`])
//! - Causality ([`VectorClock`], [`VectorClockBuilder`])
//! - Authorization ([`Capability`])
//! - The transaction model ([`Txn`], [`Action`], [`Allocation`])
//! - Voting ([`Vote`], [`Ballot`]) and decisions ([`Outcome`], [`Abort`])
//! - Cluster membership ([`Configuration`], [`NextConfiguration`],
//!   [`Topology`])

pub mod backoff;
pub mod ballot;
pub mod capability;
pub mod clock;
pub mod hash;
pub mod ids;
pub mod record;
pub mod topology;
pub mod txn;

pub use backoff::BinaryBackoff;
pub use ballot::{Abort, Ballot, Outcome, Update, Vote};
pub use capability::{Capability, RefsCapability, ValueCapability};
pub use clock::{VectorClock, VectorClockBuilder};
pub use hash::{HashCache, Resolver};
pub use ids::{
    BootCount, ClusterUUId, ConnectionCount, Positions, RMId, TxnId, VarUUId, ID_LENGTH,
    SHARDING_BYTE_INDEX,
};
pub use record::VarRecord;
pub use topology::{
    Configuration, Fingerprint, NextConfiguration, Root, Topology, TopologyChangeSubscriberKind,
    TOPOLOGY_VAR_UUID, VERSION_ONE,
};
pub use txn::{Action, ActionValue, Allocation, Reference, Txn};

// ============================================================================
// Quorum helpers
// ============================================================================

/// Returns the learn threshold `F+1` for a replication factor `F`.
pub fn f_inc(f: u8) -> u8 {
    f + 1
}

/// Returns the quorum size `2F+1` for a replication factor `F`.
pub fn two_f_inc(f: u8) -> u16 {
    2 * u16::from(f) + 1
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the placement resolver.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Not enough live RMs to host an object.
    #[error("insufficient RMs: need {need}, have {have}")]
    InsufficientRMs { need: usize, have: usize },

    /// The positions vector is shorter than the RM list requires.
    #[error("positions too short: {len} positions for {rms} RMs")]
    PositionsTooShort { len: usize, rms: usize },

    /// The var has never been seen by this cache.
    #[error("var {0} not known to cache")]
    UnknownVar(VarUUId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        assert_eq!(f_inc(0), 1);
        assert_eq!(two_f_inc(0), 1);
        assert_eq!(f_inc(1), 2);
        assert_eq!(two_f_inc(1), 3);
        assert_eq!(f_inc(2), 3);
        assert_eq!(two_f_inc(2), 5);
    }
}
