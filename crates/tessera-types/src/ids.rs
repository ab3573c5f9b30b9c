//! Identity types.
//!
//! Every node is identified by a random 32-bit [`RMId`] plus a
//! [`BootCount`] that increments on each process start, making stale
//! in-flight work detectable. Transactions and vars share a 20-byte
//! identifier layout:
//!
//! ```text
//! ┌───────────────┬─────────────┬────────────┬─────────┐
//! │ 8-byte unique │  conn count │ boot count │  RMId   │
//! │  (big-endian) │  (4 bytes)  │ (4 bytes)  │ (4 B)   │
//! └───────────────┴─────────────┴────────────┴─────────┘
//!  0             7 8          11 12        15 16     19
//! ```
//!
//! Byte 7 is the least-significant (and therefore most random) byte of
//! the unique prefix; it is the sharding byte used to route an id to an
//! executor shard.

use std::fmt::{self, Debug, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length in bytes of [`TxnId`] and [`VarUUId`].
pub const ID_LENGTH: usize = 20;

/// Index of the byte used to route ids to executor shards.
pub const SHARDING_BYTE_INDEX: usize = 7;

// ============================================================================
// RMId - Copy (4-byte random node identity)
// ============================================================================

/// Unique identifier for a resource manager (cluster node).
///
/// Generated randomly at first boot and persisted. Zero is reserved to
/// mean "no RM" (empty slots in a configuration's RM list).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RMId(u32);

impl RMId {
    /// The reserved empty slot marker.
    pub const EMPTY: RMId = RMId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Generates a fresh non-zero random RMId.
    pub fn generate(rng: &mut impl Rng) -> Self {
        loop {
            let id = rng.gen::<u32>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Display for RMId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "RM-empty")
        } else {
            write!(f, "RM:{:08x}", self.0)
        }
    }
}

impl From<u32> for RMId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<RMId> for u32 {
    fn from(id: RMId) -> Self {
        id.0
    }
}

// ============================================================================
// BootCount - Copy (per-process incarnation counter)
// ============================================================================

/// Monotonically increasing per-process incarnation counter.
///
/// Incremented every time the process starts. A transaction allocated to
/// an RM records the boot count it was prepared for; a mismatch on
/// receipt means the work belongs to a previous incarnation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BootCount(u32);

impl BootCount {
    /// Zero is the wildcard: ids with boot count 0 match any incarnation.
    pub const ZERO: BootCount = BootCount(0);

    pub fn new(count: u32) -> Self {
        Self(count)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for BootCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boot#{}", self.0)
    }
}

impl From<u32> for BootCount {
    fn from(count: u32) -> Self {
        Self(count)
    }
}

// ============================================================================
// ConnectionCount - Copy
// ============================================================================

/// Per-boot counter distinguishing client connections on one RM.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ConnectionCount(u32);

impl ConnectionCount {
    pub fn new(count: u32) -> Self {
        Self(count)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for ConnectionCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

// ============================================================================
// ClusterUUId - Copy (64-bit cluster instance id)
// ============================================================================

/// Random 64-bit identifier generated when the first topology commits.
///
/// Zero means "not yet assigned"; two nodes advertising different
/// non-zero values belong to different cluster histories and must not
/// connect.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClusterUUId(u64);

impl ClusterUUId {
    pub const UNSET: ClusterUUId = ClusterUUId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generates a fresh non-zero cluster id.
    pub fn generate(rng: &mut impl Rng) -> Self {
        loop {
            let id = rng.gen::<u64>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl Display for ClusterUUId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster:{:016x}", self.0)
    }
}

// ============================================================================
// 20-byte ids
// ============================================================================

macro_rules! twenty_byte_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            pub const ZERO: $name = $name([0; ID_LENGTH]);

            pub const fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Builds an id from its structural parts.
            pub fn from_parts(
                unique: u64,
                conn: ConnectionCount,
                boot: BootCount,
                rm: RMId,
            ) -> Self {
                let mut bytes = [0u8; ID_LENGTH];
                bytes[0..8].copy_from_slice(&unique.to_be_bytes());
                bytes[8..12].copy_from_slice(&conn.as_u32().to_be_bytes());
                bytes[12..16].copy_from_slice(&boot.as_u32().to_be_bytes());
                bytes[16..20].copy_from_slice(&rm.as_u32().to_be_bytes());
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }

            /// The connection counter embedded in the id.
            pub fn connection_count(&self) -> ConnectionCount {
                ConnectionCount::new(u32::from_be_bytes([
                    self.0[8], self.0[9], self.0[10], self.0[11],
                ]))
            }

            /// The boot count of the originating RM at submission time.
            pub fn boot_count(&self) -> BootCount {
                BootCount::new(u32::from_be_bytes([
                    self.0[12], self.0[13], self.0[14], self.0[15],
                ]))
            }

            /// The RM that originated this id.
            pub fn rm_id(&self) -> RMId {
                RMId::new(u32::from_be_bytes([
                    self.0[16], self.0[17], self.0[18], self.0[19],
                ]))
            }

            /// The byte used to route this id to an executor shard.
            pub fn sharding_byte(&self) -> u8 {
                self.0[SHARDING_BYTE_INDEX]
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0; ID_LENGTH]
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(self, f)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $prefix)?;
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    };
}

twenty_byte_id!(TxnId, "txn:");
twenty_byte_id!(VarUUId, "var:");

impl TxnId {
    /// Generates a fresh TxnId in the given namespace.
    pub fn generate(
        rng: &mut impl Rng,
        conn: ConnectionCount,
        boot: BootCount,
        rm: RMId,
    ) -> Self {
        Self::from_parts(rng.gen::<u64>(), conn, boot, rm)
    }
}

impl VarUUId {
    /// Derives the nth var created by a transaction.
    ///
    /// Create actions mint var ids inside the submitter's namespace so
    /// they can never collide with ids minted elsewhere.
    pub fn derived_from(txn_id: &TxnId, n: u64) -> Self {
        let unique = u64::from_be_bytes(txn_id.as_bytes()[0..8].try_into().expect("8 bytes"))
            .wrapping_add(n.wrapping_add(1));
        Self::from_parts(
            unique,
            txn_id.connection_count(),
            txn_id.boot_count(),
            txn_id.rm_id(),
        )
    }
}

// ============================================================================
// Positions - sticky placement record
// ============================================================================

/// Ordered byte-vector of permutation digits assigned to a var at
/// creation.
///
/// Length equals the configuration's `max_rm_count`; digit `i` lies in
/// `[0, i]` (a Lehmer code). Positions are sticky: they never change
/// after creation, so an object's canonical replica list moves only when
/// the RM list itself changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Positions(Vec<u8>);

impl Positions {
    pub fn new(digits: Vec<u8>) -> Self {
        debug_assert!(
            digits.iter().enumerate().all(|(i, &d)| usize::from(d) <= i),
            "position digit out of range"
        );
        Self(digits)
    }

    pub fn digits(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Positions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn id_field_roundtrip() {
        let id = TxnId::from_parts(
            0x0102030405060708,
            ConnectionCount::new(42),
            BootCount::new(7),
            RMId::new(0xdeadbeef),
        );
        assert_eq!(id.connection_count(), ConnectionCount::new(42));
        assert_eq!(id.boot_count(), BootCount::new(7));
        assert_eq!(id.rm_id(), RMId::new(0xdeadbeef));
        assert_eq!(id.sharding_byte(), 0x08);
    }

    #[test]
    fn generated_rm_id_nonzero() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..32 {
            assert!(!RMId::generate(&mut rng).is_empty());
        }
    }

    #[test]
    fn derived_var_ids_distinct() {
        let mut rng = StdRng::seed_from_u64(2);
        let txn = TxnId::generate(
            &mut rng,
            ConnectionCount::new(1),
            BootCount::new(1),
            RMId::new(9),
        );
        let a = VarUUId::derived_from(&txn, 0);
        let b = VarUUId::derived_from(&txn, 1);
        assert_ne!(a, b);
        assert_eq!(a.rm_id(), txn.rm_id());
    }

    #[test]
    fn zero_id_is_zero() {
        assert!(VarUUId::ZERO.is_zero());
        assert!(!VarUUId::derived_from(&TxnId::ZERO, 0).is_zero());
    }

    #[test]
    fn boot_count_wildcard() {
        assert!(BootCount::ZERO.is_zero());
        assert_eq!(BootCount::new(3).next(), BootCount::new(4));
    }
}
