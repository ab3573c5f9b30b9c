//! The per-client version cache.
//!
//! Tracks, for every var a client can reach, the version it last
//! observed (txn id and clock element) and the capability the client
//! holds over it. Reads are admitted only within granted capabilities;
//! commits bump cached versions; `Rerun` aborts feed the winning txns'
//! updates in before resubmission.

use std::collections::HashMap;

use tessera_types::{
    Capability, Reference, Txn, TxnId, Update, VarUUId, VectorClock,
};
use tessera_wire::ClientRoot;

use crate::{ClientError, ClientResult};

#[derive(Debug, Clone)]
struct CacheEntry {
    txn_id: TxnId,
    version: u64,
    capability: Capability,
}

/// A client's view of the object graph it can reach.
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: HashMap<VarUUId, CacheEntry>,
}

impl VersionCache {
    /// Seeds the cache from the roots granted at handshake.
    pub fn from_roots(roots: &[ClientRoot]) -> Self {
        let mut cache = Self::default();
        for root in roots {
            cache.entries.insert(
                root.var,
                CacheEntry {
                    txn_id: TxnId::ZERO,
                    version: 0,
                    capability: root.capability.clone(),
                },
            );
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The version the client last observed for `var`.
    pub fn version_of(&self, var: &VarUUId) -> Option<(TxnId, u64)> {
        self.entries.get(var).map(|e| (e.txn_id, e.version))
    }

    pub fn capability(&self, var: &VarUUId) -> Option<&Capability> {
        self.entries.get(var).map(|e| &e.capability)
    }

    /// Checks the client may read `var`.
    pub fn check_read(&self, var: &VarUUId) -> ClientResult<u64> {
        match self.entries.get(var) {
            None => Err(ClientError::UnknownVar(*var)),
            Some(e) if !e.capability.can_read() => Err(ClientError::ReadDenied(*var)),
            Some(e) => Ok(e.version),
        }
    }

    /// Checks the client may write `var`.
    pub fn check_write(&self, var: &VarUUId) -> ClientResult<()> {
        match self.entries.get(var) {
            None => Err(ClientError::UnknownVar(*var)),
            Some(e) if !e.capability.can_write() => Err(ClientError::WriteDenied(*var)),
            Some(_) => Ok(()),
        }
    }

    /// Registers a var the client just created: full authority.
    pub fn created(&mut self, var: VarUUId, txn_id: TxnId, version: u64) {
        self.entries.insert(
            var,
            CacheEntry {
                txn_id,
                version,
                capability: Capability::read_write_all(),
            },
        );
    }

    /// Absorbs a committed transaction of our own: written vars move to
    /// the commit clock's versions, and every reference they carry
    /// extends the reachable graph.
    pub fn update_from_commit(&mut self, txn: &Txn, clock: &VectorClock) {
        for action in &txn.actions {
            if let Some((_, references)) = action.written_value() {
                let version = clock.at(&action.var);
                match self.entries.get_mut(&action.var) {
                    Some(entry) => {
                        entry.txn_id = txn.id;
                        entry.version = version;
                    }
                    None => {
                        self.created(action.var, txn.id, version);
                    }
                }
                self.absorb_references(references);
            }
        }
    }

    /// Absorbs the `Rerun` updates of an aborted transaction: the
    /// winning txns' writes replace our stale versions.
    pub fn update_from_abort(&mut self, updates: &[Update]) {
        for update in updates {
            for action in &update.actions {
                if let Some((_, references)) = action.written_value() {
                    let version = update.clock.at(&action.var);
                    match self.entries.get_mut(&action.var) {
                        Some(entry) => {
                            // Only move forward.
                            if version >= entry.version {
                                entry.txn_id = update.txn_id;
                                entry.version = version;
                            }
                        }
                        None => {
                            self.entries.insert(
                                action.var,
                                CacheEntry {
                                    txn_id: update.txn_id,
                                    version,
                                    capability: Capability::none(),
                                },
                            );
                        }
                    }
                    self.absorb_references(references);
                }
            }
        }
    }

    /// References only ever widen a capability.
    fn absorb_references(&mut self, references: &[Reference]) {
        for reference in references {
            match self.entries.get_mut(&reference.var) {
                Some(entry) => {
                    entry.capability =
                        entry.capability.clone().union(reference.capability.clone());
                }
                None => {
                    self.entries.insert(
                        reference.var,
                        CacheEntry {
                            txn_id: TxnId::ZERO,
                            version: 0,
                            capability: reference.capability.clone(),
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessera_types::{
        Action, ActionValue, Allocation, BootCount, Positions, RMId, VectorClockBuilder,
    };

    fn uuid(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn root(var: VarUUId, capability: Capability) -> ClientRoot {
        ClientRoot {
            name: "root".into(),
            var,
            positions: Positions::new(vec![0]),
            capability,
        }
    }

    fn write_txn(id: u64, var: VarUUId, references: Vec<Reference>) -> Txn {
        Txn {
            id: TxnId::from_parts(id, Default::default(), BootCount::new(1), RMId::new(1)),
            actions: vec![Action::new(
                var,
                ActionValue::Write {
                    value: Bytes::from_static(b"v"),
                    references,
                },
            )],
            allocations: vec![Allocation::active(RMId::new(1), BootCount::new(1), vec![0])],
            f_inc: 1,
            two_f_inc: 1,
            topology_version: 1,
            is_topology: false,
            retry: false,
        }
    }

    #[test]
    fn capability_gates_reads_and_writes() {
        let cache = VersionCache::from_roots(&[
            root(uuid(1), Capability::read_all()),
            root(uuid(2), Capability::none()),
        ]);
        assert_eq!(cache.check_read(&uuid(1)), Ok(0));
        assert_eq!(
            cache.check_write(&uuid(1)),
            Err(ClientError::WriteDenied(uuid(1)))
        );
        assert_eq!(
            cache.check_read(&uuid(2)),
            Err(ClientError::ReadDenied(uuid(2)))
        );
        assert_eq!(
            cache.check_read(&uuid(9)),
            Err(ClientError::UnknownVar(uuid(9)))
        );
    }

    #[test]
    fn commit_bumps_versions_and_reveals_references() {
        let mut cache = VersionCache::from_roots(&[root(uuid(1), Capability::read_write_all())]);
        let reference = Reference::new(uuid(2), None, Capability::read_all());
        let txn = write_txn(1, uuid(1), vec![reference]);
        let clock = VectorClockBuilder::new().set(uuid(1), 3).build();

        cache.update_from_commit(&txn, &clock);
        assert_eq!(cache.version_of(&uuid(1)), Some((txn.id, 3)));
        // The reference made var 2 reachable, read-only.
        assert_eq!(cache.check_read(&uuid(2)), Ok(0));
        assert_eq!(
            cache.check_write(&uuid(2)),
            Err(ClientError::WriteDenied(uuid(2)))
        );
    }

    #[test]
    fn references_widen_but_never_narrow() {
        let mut cache = VersionCache::from_roots(&[root(uuid(1), Capability::read_write_all())]);
        let wide = Reference::new(uuid(2), None, Capability::read_write_all());
        let narrow = Reference::new(uuid(2), None, Capability::none());

        cache.update_from_commit(
            &write_txn(1, uuid(1), vec![wide]),
            &VectorClockBuilder::new().set(uuid(1), 1).build(),
        );
        cache.update_from_commit(
            &write_txn(2, uuid(1), vec![narrow]),
            &VectorClockBuilder::new().set(uuid(1), 2).build(),
        );
        assert!(cache.check_write(&uuid(2)).is_ok());
    }

    #[test]
    fn rerun_updates_repair_stale_versions() {
        let mut cache = VersionCache::from_roots(&[root(uuid(1), Capability::read_write_all())]);
        let winner = TxnId::from_parts(9, Default::default(), BootCount::new(1), RMId::new(2));
        let update = Update {
            txn_id: winner,
            actions: vec![Action::new(
                uuid(1),
                ActionValue::Write {
                    value: Bytes::from_static(b"w"),
                    references: vec![],
                },
            )],
            clock: VectorClockBuilder::new().set(uuid(1), 5).build(),
        };
        cache.update_from_abort(&[update]);
        assert_eq!(cache.version_of(&uuid(1)), Some((winner, 5)));

        // A stale update cannot regress the version.
        let stale = Update {
            txn_id: TxnId::ZERO,
            actions: vec![Action::new(
                uuid(1),
                ActionValue::Write {
                    value: Bytes::from_static(b"old"),
                    references: vec![],
                },
            )],
            clock: VectorClockBuilder::new().set(uuid(1), 2).build(),
        };
        cache.update_from_abort(&[stale]);
        assert_eq!(cache.version_of(&uuid(1)), Some((winner, 5)));
    }
}
