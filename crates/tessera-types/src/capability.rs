//! Reference capabilities.
//!
//! Authorization in Tessera is purely structural: a client can act on a
//! var only by holding a reference to it, and every reference carries a
//! [`Capability`] bounding the actions the holder may issue, both on the
//! var's value and transitively on its outgoing references.

use serde::{Deserialize, Serialize};

/// What the holder may do with the var's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueCapability {
    None,
    Read,
    Write,
    ReadWrite,
}

impl ValueCapability {
    pub fn can_read(&self) -> bool {
        matches!(self, ValueCapability::Read | ValueCapability::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, ValueCapability::Write | ValueCapability::ReadWrite)
    }

    /// Least upper bound of two value capabilities.
    pub fn union(self, other: ValueCapability) -> ValueCapability {
        match (self.can_read() || other.can_read(), self.can_write() || other.can_write()) {
            (true, true) => ValueCapability::ReadWrite,
            (true, false) => ValueCapability::Read,
            (false, true) => ValueCapability::Write,
            (false, false) => ValueCapability::None,
        }
    }
}

/// Which of the var's outgoing references the holder may read or write.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RefsCapability {
    All,
    /// Only the reference slots at these indices (sorted, deduplicated).
    Only(Vec<u32>),
}

impl RefsCapability {
    pub fn none() -> Self {
        RefsCapability::Only(Vec::new())
    }

    pub fn permits(&self, index: u32) -> bool {
        match self {
            RefsCapability::All => true,
            RefsCapability::Only(indices) => indices.binary_search(&index).is_ok(),
        }
    }

    pub fn union(self, other: RefsCapability) -> RefsCapability {
        match (self, other) {
            (RefsCapability::All, _) | (_, RefsCapability::All) => RefsCapability::All,
            (RefsCapability::Only(mut a), RefsCapability::Only(b)) => {
                a.extend(b);
                a.sort_unstable();
                a.dedup();
                RefsCapability::Only(a)
            }
        }
    }
}

/// Per-reference authorization triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub value: ValueCapability,
    pub refs_read: RefsCapability,
    pub refs_write: RefsCapability,
}

impl Capability {
    /// Full authority: read/write the value and every reference slot.
    pub fn read_write_all() -> Self {
        Self {
            value: ValueCapability::ReadWrite,
            refs_read: RefsCapability::All,
            refs_write: RefsCapability::All,
        }
    }

    /// Read-only authority over value and references.
    pub fn read_all() -> Self {
        Self {
            value: ValueCapability::Read,
            refs_read: RefsCapability::All,
            refs_write: RefsCapability::none(),
        }
    }

    /// No authority at all; the reference only proves existence.
    pub fn none() -> Self {
        Self {
            value: ValueCapability::None,
            refs_read: RefsCapability::none(),
            refs_write: RefsCapability::none(),
        }
    }

    pub fn can_read(&self) -> bool {
        self.value.can_read()
    }

    pub fn can_write(&self) -> bool {
        self.value.can_write()
    }

    /// Least upper bound. Capabilities only ever grow as a client
    /// discovers more references to the same var.
    pub fn union(self, other: Capability) -> Capability {
        Capability {
            value: self.value.union(other.value),
            refs_read: self.refs_read.union(other.refs_read),
            refs_write: self.refs_write.union(other.refs_write),
        }
    }

    /// True iff `other` grants nothing that `self` does not.
    pub fn subsumes(&self, other: &Capability) -> bool {
        self.clone().union(other.clone()) == *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_capability_union() {
        assert_eq!(
            ValueCapability::Read.union(ValueCapability::Write),
            ValueCapability::ReadWrite
        );
        assert_eq!(
            ValueCapability::None.union(ValueCapability::Read),
            ValueCapability::Read
        );
        assert_eq!(
            ValueCapability::None.union(ValueCapability::None),
            ValueCapability::None
        );
    }

    #[test]
    fn refs_capability_permits() {
        let only = RefsCapability::Only(vec![1, 3, 5]);
        assert!(only.permits(3));
        assert!(!only.permits(2));
        assert!(RefsCapability::All.permits(2));
        assert!(!RefsCapability::none().permits(0));
    }

    #[test]
    fn refs_union_merges_sorted() {
        let a = RefsCapability::Only(vec![1, 3]);
        let b = RefsCapability::Only(vec![2, 3]);
        assert_eq!(a.union(b), RefsCapability::Only(vec![1, 2, 3]));
    }

    #[test]
    fn capability_subsumption() {
        let rw = Capability::read_write_all();
        let ro = Capability::read_all();
        assert!(rw.subsumes(&ro));
        assert!(!ro.subsumes(&rw));
        assert!(rw.subsumes(&Capability::none()));
    }
}
