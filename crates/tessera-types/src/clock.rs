//! Vector clocks.
//!
//! A [`VectorClock`] maps `VarUUId → u64`, tracking per-var write
//! versions. Clocks are immutable once published on the wire; a
//! [`VectorClockBuilder`] is used while composing. Absent entries read
//! as zero, so an empty clock is the bottom element.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::VarUUId;

/// Immutable vector clock keyed by var.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VectorClock(BTreeMap<VarUUId, u64>);

impl VectorClock {
    /// The empty (bottom) clock.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Returns the version recorded for `var`, or 0 if absent.
    pub fn at(&self, var: &VarUUId) -> u64 {
        self.0.get(var).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VarUUId, u64)> {
        self.0.iter().map(|(k, &v)| (k, v))
    }

    /// True iff every element of `self` is >= the corresponding element
    /// of `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.iter().all(|(var, v)| self.at(var) >= v)
    }

    /// True iff every element of `self` is <= the corresponding element
    /// of `other`.
    pub fn less_than_or_equal(&self, other: &VectorClock) -> bool {
        self.iter().all(|(var, v)| v <= other.at(var))
    }

    /// Reopens the clock for modification.
    pub fn into_builder(self) -> VectorClockBuilder {
        VectorClockBuilder(self.0)
    }

    pub fn to_builder(&self) -> VectorClockBuilder {
        VectorClockBuilder(self.0.clone())
    }
}

/// Mutable clock used while composing; frozen with [`Self::build`].
#[derive(Debug, Clone, Default)]
pub struct VectorClockBuilder(BTreeMap<VarUUId, u64>);

impl VectorClockBuilder {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn at(&self, var: &VarUUId) -> u64 {
        self.0.get(var).copied().unwrap_or(0)
    }

    /// Adds `n` to the entry for `var` (creating it at `n`).
    pub fn bump(mut self, var: VarUUId, n: u64) -> Self {
        *self.0.entry(var).or_insert(0) += n;
        self
    }

    /// Sets the entry for `var` to exactly `version`.
    pub fn set(mut self, var: VarUUId, version: u64) -> Self {
        self.0.insert(var, version);
        self
    }

    /// Element-wise maximum merge of `other` into `self`.
    pub fn merge_in_max(mut self, other: &VectorClock) -> Self {
        for (var, v) in other.iter() {
            let e = self.0.entry(*var).or_insert(0);
            if v > *e {
                *e = v;
            }
        }
        self
    }

    /// Copies entries from `other` that `self` does not yet carry.
    pub fn merge_in_missing(mut self, other: &VectorClock) -> Self {
        for (var, v) in other.iter() {
            self.0.entry(*var).or_insert(v);
        }
        self
    }

    /// Removes the entry for `var` if it matches `version`.
    pub fn delete_if_match(mut self, var: &VarUUId, version: u64) -> Self {
        if self.0.get(var) == Some(&version) {
            self.0.remove(var);
        }
        self
    }

    pub fn build(self) -> VectorClock {
        VectorClock(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TxnId;

    fn var(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    #[test]
    fn absent_reads_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.at(&var(1)), 0);
        assert!(clock.is_empty());
    }

    #[test]
    fn bump_and_set() {
        let clock = VectorClockBuilder::new()
            .bump(var(1), 1)
            .bump(var(1), 2)
            .set(var(2), 9)
            .build();
        assert_eq!(clock.at(&var(1)), 3);
        assert_eq!(clock.at(&var(2)), 9);
        assert_eq!(clock.len(), 2);
    }

    #[test]
    fn merge_in_max_takes_larger() {
        let a = VectorClockBuilder::new()
            .set(var(1), 5)
            .set(var(2), 1)
            .build();
        let b = VectorClockBuilder::new()
            .set(var(1), 3)
            .set(var(3), 7)
            .build();
        let merged = a.to_builder().merge_in_max(&b).build();
        assert_eq!(merged.at(&var(1)), 5);
        assert_eq!(merged.at(&var(2)), 1);
        assert_eq!(merged.at(&var(3)), 7);
    }

    #[test]
    fn merge_in_missing_keeps_existing() {
        let a = VectorClockBuilder::new().set(var(1), 5).build();
        let b = VectorClockBuilder::new()
            .set(var(1), 3)
            .set(var(2), 2)
            .build();
        let merged = a.to_builder().merge_in_missing(&b).build();
        assert_eq!(merged.at(&var(1)), 5);
        assert_eq!(merged.at(&var(2)), 2);
    }

    #[test]
    fn dominance() {
        let lo = VectorClockBuilder::new().set(var(1), 1).build();
        let hi = VectorClockBuilder::new()
            .set(var(1), 2)
            .set(var(2), 1)
            .build();
        assert!(hi.dominates(&lo));
        assert!(!lo.dominates(&hi));
        assert!(lo.less_than_or_equal(&hi));
        // Empty clock is bottom: dominated by everything.
        assert!(lo.dominates(&VectorClock::new()));
    }

    #[test]
    fn delete_if_match_only_on_exact_version() {
        let b = VectorClockBuilder::new().set(var(1), 4);
        let kept = b.clone().delete_if_match(&var(1), 3).build();
        assert_eq!(kept.at(&var(1)), 4);
        let dropped = b.delete_if_match(&var(1), 4).build();
        assert_eq!(dropped.at(&var(1)), 0);
    }
}
