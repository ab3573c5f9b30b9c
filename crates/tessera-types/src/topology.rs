//! Cluster membership and reconfiguration state.
//!
//! A [`Configuration`] names the cluster, its RMs and hosts, the
//! replication factor, and client certificate fingerprints. A
//! [`Topology`] is a configuration as committed: it carries the derived
//! quorum sizes, the TxnId it was written by, and the resolved root
//! vars. Topology is itself stored in a distinguished var
//! ([`TOPOLOGY_VAR_UUID`]) and changed through the same transaction
//! machinery as any other object.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::ids::{Positions, RMId, TxnId, VarUUId, ID_LENGTH};
use crate::{f_inc, two_f_inc, ClusterUUId};

/// The distinguished var holding the cluster topology: all zeros.
pub const TOPOLOGY_VAR_UUID: VarUUId = VarUUId::from_bytes([0; ID_LENGTH]);

/// The TxnId that writes the blank, pre-bootstrap topology.
///
/// Byte 7 is set so the id is non-zero while still naming RM 0, which
/// cannot exist.
pub const VERSION_ONE: TxnId = TxnId::from_bytes({
    let mut bytes = [0u8; ID_LENGTH];
    bytes[7] = 1;
    bytes
});

// ============================================================================
// Fingerprints
// ============================================================================

/// SHA-256 fingerprint of a client certificate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fp:")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…")
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// The externally supplied cluster description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Human-chosen cluster name; immutable once non-empty.
    pub cluster_id: String,

    /// Random cluster instance id, assigned when the first topology
    /// commits; zero until then.
    pub cluster_uuid: ClusterUUId,

    /// Strictly increasing configuration version.
    pub version: u32,

    /// Replication factor: each object lives on `2F+1` RMs, the first
    /// `F+1` of which vote.
    pub f: u8,

    /// Length of every positions vector; immutable after version 0.
    pub max_rm_count: u16,

    /// RM slots. Removed RMs leave [`RMId::EMPTY`] holes so surviving
    /// slots keep their indices.
    pub rms: Vec<RMId>,

    /// `host:port` for each live RM, index-aligned with the non-empty
    /// entries of `rms`.
    pub hosts: Vec<String>,

    /// Client certificate fingerprint → names of root vars the client
    /// may reach.
    pub fingerprints: BTreeMap<Fingerprint, Vec<String>>,

    /// Names of the cluster's root vars, in creation order.
    pub roots: Vec<String>,

    /// RMs that have left the cluster. Never shrinks.
    pub rms_removed: BTreeSet<RMId>,

    /// An in-progress reconfiguration, if any.
    pub next: Option<Box<NextConfiguration>>,
}

impl Configuration {
    /// A blank configuration for a node that has not yet joined or
    /// bootstrapped a cluster.
    pub fn blank(cluster_id: String, max_rm_count: u16) -> Self {
        Self {
            cluster_id,
            cluster_uuid: ClusterUUId::UNSET,
            version: 0,
            f: 0,
            max_rm_count,
            rms: Vec::new(),
            hosts: Vec::new(),
            fingerprints: BTreeMap::new(),
            roots: Vec::new(),
            rms_removed: BTreeSet::new(),
            next: None,
        }
    }

    /// Live (non-empty, non-removed) RMs in slot order.
    pub fn live_rms(&self) -> impl Iterator<Item = RMId> + '_ {
        self.rms
            .iter()
            .copied()
            .filter(|rm| !rm.is_empty() && !self.rms_removed.contains(rm))
    }

    pub fn contains_rm(&self, rm: RMId) -> bool {
        self.live_rms().any(|r| r == rm)
    }

    /// Equality of the externally supplied content: everything except
    /// the reconfiguration bookkeeping.
    pub fn equal_externally(&self, other: &Configuration) -> bool {
        self.cluster_id == other.cluster_id
            && self.version == other.version
            && self.f == other.f
            && self.max_rm_count == other.max_rm_count
            && self.hosts == other.hosts
            && self.fingerprints == other.fingerprints
    }

    /// Splits hosts into (local, remote) by matching `local_host`.
    pub fn local_remote_hosts(&self, local_host: &str) -> (Option<String>, Vec<String>) {
        let mut local = None;
        let mut remote = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            if local.is_none() && host == local_host {
                local = Some(host.clone());
            } else {
                remote.push(host.clone());
            }
        }
        (local, remote)
    }
}

// ============================================================================
// NextConfiguration
// ============================================================================

/// Bookkeeping for an in-progress reconfiguration, persisted inside the
/// topology var so progress survives crashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextConfiguration {
    /// The target configuration.
    pub config: Configuration,

    /// RMs joining the cluster in this change.
    pub new_rm_ids: Vec<RMId>,

    /// RMs leaving the cluster in this change.
    pub lost_rm_ids: BTreeSet<RMId>,

    /// RMs that have gossiped the target to all members.
    pub installed_on_new: BTreeSet<RMId>,

    /// RMs that have reached the first barrier (rolls banned).
    pub barrier_reached1: BTreeSet<RMId>,

    /// RMs that have reached the second barrier (all vars on disk).
    pub barrier_reached2: BTreeSet<RMId>,

    /// RMs that have gone quiet (drained in-flight txns).
    pub quiet_rm_ids: BTreeSet<RMId>,

    /// RMs still owing object migrations, with outstanding batch counts.
    pub pending: BTreeMap<RMId, u32>,
}

impl NextConfiguration {
    pub fn new(config: Configuration, new_rm_ids: Vec<RMId>, lost_rm_ids: BTreeSet<RMId>) -> Self {
        Self {
            config,
            new_rm_ids,
            lost_rm_ids,
            installed_on_new: BTreeSet::new(),
            barrier_reached1: BTreeSet::new(),
            barrier_reached2: BTreeSet::new(),
            quiet_rm_ids: BTreeSet::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    /// All RMs that have installed the target everywhere they must.
    pub fn installed_everywhere(&self, all: impl Iterator<Item = RMId>) -> bool {
        let mut any = false;
        for rm in all {
            any = true;
            if !self.installed_on_new.contains(&rm) {
                return false;
            }
        }
        any
    }
}

// ============================================================================
// Topology
// ============================================================================

/// A root var as resolved at bootstrap: its id and sticky positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub name: String,
    pub var: VarUUId,
    pub positions: Positions,
}

/// A configuration as committed, with derived quorum sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub config: Configuration,

    /// `F+1`: the learn threshold and the number of voting replicas.
    pub f_inc: u8,

    /// `2F+1`: the replica count per object and the acceptor count.
    pub two_f_inc: u16,

    /// The txn that wrote this topology version.
    pub db_version: TxnId,

    /// Resolved root vars.
    pub roots: Vec<Root>,
}

impl Topology {
    /// The pre-bootstrap topology: version 0, no RMs, `VERSION_ONE`.
    pub fn blank(cluster_id: String, max_rm_count: u16) -> Self {
        Self {
            config: Configuration::blank(cluster_id, max_rm_count),
            f_inc: 1,
            two_f_inc: 1,
            db_version: VERSION_ONE,
            roots: Vec::new(),
        }
    }

    pub fn new(config: Configuration, db_version: TxnId, roots: Vec<Root>) -> Self {
        let f = config.f;
        Self {
            config,
            f_inc: f_inc(f),
            two_f_inc: two_f_inc(f),
            db_version,
            roots,
        }
    }

    pub fn version(&self) -> u32 {
        self.config.version
    }

    pub fn next(&self) -> Option<&NextConfiguration> {
        self.config.next.as_deref()
    }

    /// Replaces the configuration, rederiving quorum sizes.
    pub fn set_configuration(&mut self, config: Configuration) {
        self.f_inc = f_inc(config.f);
        self.two_f_inc = two_f_inc(config.f);
        self.config = config;
    }

    /// True before the first real configuration has committed.
    pub fn is_blank(&self) -> bool {
        self.config.max_rm_count == 0
            || self.config.live_rms().count() < usize::from(self.two_f_inc)
    }

    /// Whether `rm` has passed the roll-ban barrier of the pending
    /// change.
    pub fn next_barrier_reached1(&self, rm: RMId) -> bool {
        self.next()
            .map(|n| n.barrier_reached1.contains(&rm))
            .unwrap_or(false)
    }

    /// Whether `rm` has passed the all-on-disk barrier of the pending
    /// change.
    pub fn next_barrier_reached2(&self, rm: RMId) -> bool {
        self.next()
            .map(|n| n.barrier_reached2.contains(&rm))
            .unwrap_or(false)
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Topology{{{} v{} F+1={} 2F+1={} rms={:?} next={}}}",
            self.config.cluster_id,
            self.config.version,
            self.f_inc,
            self.two_f_inc,
            self.config.rms,
            self.next().map(|n| n.version()).unwrap_or(0),
        )
    }
}

// ============================================================================
// Subscriber kinds
// ============================================================================

/// Buckets for topology-change subscribers. `SetTopology` fires its
/// per-kind callback only once every subscriber of that kind has
/// acknowledged the new topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopologyChangeSubscriberKind {
    ConnectionManager,
    Proposer,
    Acceptor,
    Var,
    Connection,
    Misc,
}

impl TopologyChangeSubscriberKind {
    pub const ALL: [TopologyChangeSubscriberKind; 6] = [
        TopologyChangeSubscriberKind::ConnectionManager,
        TopologyChangeSubscriberKind::Proposer,
        TopologyChangeSubscriberKind::Acceptor,
        TopologyChangeSubscriberKind::Var,
        TopologyChangeSubscriberKind::Connection,
        TopologyChangeSubscriberKind::Misc,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(version: u32, f: u8, rms: Vec<u32>) -> Configuration {
        Configuration {
            cluster_id: "test".into(),
            cluster_uuid: ClusterUUId::new(1),
            version,
            f,
            max_rm_count: 8,
            rms: rms.into_iter().map(RMId::new).collect(),
            hosts: vec!["a:1".into(), "b:1".into(), "c:1".into()],
            fingerprints: BTreeMap::new(),
            roots: vec!["root".into()],
            rms_removed: BTreeSet::new(),
            next: None,
        }
    }

    #[test]
    fn topology_var_is_all_zeros() {
        assert!(TOPOLOGY_VAR_UUID.is_zero());
        assert!(!VERSION_ONE.is_zero());
        assert_eq!(VERSION_ONE.rm_id(), RMId::EMPTY);
    }

    #[test]
    fn derived_quorums() {
        let t = Topology::new(config(1, 1, vec![1, 2, 3]), VERSION_ONE, vec![]);
        assert_eq!(t.f_inc, 2);
        assert_eq!(t.two_f_inc, 3);
        assert!(!t.is_blank());
    }

    #[test]
    fn blank_topology() {
        let t = Topology::blank("test".into(), 8);
        assert!(t.is_blank());
        assert_eq!(t.version(), 0);
        assert_eq!(t.db_version, VERSION_ONE);
    }

    #[test]
    fn live_rms_skip_holes_and_removed() {
        let mut c = config(1, 1, vec![1, 0, 3]);
        c.rms_removed.insert(RMId::new(3));
        assert_eq!(c.live_rms().collect::<Vec<_>>(), vec![RMId::new(1)]);
        assert!(c.contains_rm(RMId::new(1)));
        assert!(!c.contains_rm(RMId::new(3)));
    }

    #[test]
    fn external_equality_ignores_reconfig_bookkeeping() {
        let a = config(1, 1, vec![1, 2, 3]);
        let mut b = a.clone();
        b.next = Some(Box::new(NextConfiguration::new(
            config(2, 1, vec![1, 2, 3]),
            vec![],
            BTreeSet::new(),
        )));
        b.rms_removed.insert(RMId::new(9));
        assert!(a.equal_externally(&b));

        let mut c = a.clone();
        c.version = 2;
        assert!(!a.equal_externally(&c));
    }

    #[test]
    fn local_remote_split() {
        let c = config(1, 1, vec![1, 2, 3]);
        let (local, remote) = c.local_remote_hosts("b:1");
        assert_eq!(local.as_deref(), Some("b:1"));
        assert_eq!(remote, vec!["a:1".to_string(), "c:1".to_string()]);

        let (none, all) = c.local_remote_hosts("zzz:9");
        assert!(none.is_none());
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn barrier_queries() {
        let mut c = config(1, 1, vec![1, 2, 3]);
        let mut next = NextConfiguration::new(config(2, 1, vec![1, 2]), vec![], BTreeSet::new());
        next.barrier_reached1.insert(RMId::new(1));
        c.next = Some(Box::new(next));
        let t = Topology::new(c, VERSION_ONE, vec![]);
        assert!(t.next_barrier_reached1(RMId::new(1)));
        assert!(!t.next_barrier_reached1(RMId::new(2)));
        assert!(!t.next_barrier_reached2(RMId::new(1)));
    }
}
