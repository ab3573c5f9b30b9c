//! The topology transmogrifier.
//!
//! A long-lived actor that owns the cluster's configuration lifecycle.
//! Reconfiguration proceeds as an ordered sequence of guarded tasks;
//! every durable step is itself a transaction on the distinguished
//! topology var, so progress survives crashes and is totally ordered
//! with all other writes.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use tessera_client::LocalConnection;
use tessera_engine::{Executor, ExecutorHandle};
use tessera_net::{ConnectionManagerHandle, TopologyCallbacks, TopologyEventSink};
use tessera_paxos::MessageRouter;
use tessera_store::{Db, Table};
use tessera_types::{
    Action, ActionValue, Allocation, BootCount, ClusterUUId, Configuration, NextConfiguration,
    Outcome, RMId, Topology, TopologyChangeSubscriberKind, Txn, TxnId, VarRecord,
    TOPOLOGY_VAR_UUID,
};
use tessera_wire::{Message, MigrationBatch};

use crate::migration::{emigration_batches, immigrate};
use crate::{TopologyError, TopologyResult};

/// Elements per migration batch.
pub const MIGRATION_BATCH_SIZE: usize = 64;

/// Delay before re-ticking after an aborted topology transaction.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Asks the supervisor to shut the process down (used when this RM is
/// removed from the cluster).
pub trait ShutdownSignaller: Send + Sync {
    fn signal_shutdown(&self);
}

// ============================================================================
// Tasks
// ============================================================================

/// The ordered reconfiguration tasks. Each is a guarded transition;
/// invalid guards skip forward, a newer target abandons the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    /// Propose the target to the current RMs, recording it under
    /// `next`.
    InstallTargetOld,

    /// Gossip the widened topology to old ∪ new RMs; record
    /// `installed_on_new[self]`.
    InstallTargetNew,

    /// New RMs synchronise: wait until the target is installed
    /// everywhere before going quiet.
    JoinCluster,

    /// Drain this RM: stop admitting client txns (stage 0), ban rolls
    /// and drain vars (stage 1), flush TLCs (stage 2), then record
    /// `quiet_rm_ids[self]` (stage 3).
    Quiet { stage: u8, installing: u32 },

    /// Stream owned objects to their new homes.
    Migrate {
        started: bool,
        outstanding: BTreeSet<RMId>,
    },

    /// Commit the target as the configuration, populating
    /// `rms_removed` and clearing `next`.
    InstallCompletion,
}

impl Task {
    fn first() -> Task {
        Task::InstallTargetOld
    }

    fn next(&self) -> Option<Task> {
        match self {
            Task::InstallTargetOld => Some(Task::InstallTargetNew),
            Task::InstallTargetNew => Some(Task::JoinCluster),
            Task::JoinCluster => Some(Task::Quiet {
                stage: 0,
                installing: 0,
            }),
            Task::Quiet { .. } => Some(Task::Migrate {
                started: false,
                outstanding: BTreeSet::new(),
            }),
            Task::Migrate { .. } => Some(Task::InstallCompletion),
            Task::InstallCompletion => None,
        }
    }
}

// ============================================================================
// Target validation
// ============================================================================

/// Rejects illegal configuration changes. `versus` is the task's
/// current target if one exists, else the active configuration.
pub fn validate_target(
    versus: &Configuration,
    target: &Configuration,
) -> TopologyResult<bool> {
    if target.cluster_id != versus.cluster_id && !versus.cluster_id.is_empty() {
        return Err(TopologyError::ClusterIdChange {
            current: versus.cluster_id.clone(),
            proposed: target.cluster_id.clone(),
        });
    }
    if target.cluster_uuid.is_set()
        && versus.cluster_uuid.is_set()
        && target.cluster_uuid != versus.cluster_uuid
    {
        return Err(TopologyError::ClusterUUIdChange);
    }
    if target.max_rm_count != versus.max_rm_count && versus.version != 0 {
        return Err(TopologyError::MaxRMCountChange);
    }
    if target.equal_externally(versus) {
        // Silent success: the goal is already reached or targeted.
        return Ok(false);
    }
    if target.version == versus.version {
        return Err(TopologyError::ContentChangedVersionDidNot(target.version));
    }
    if target.version < versus.version {
        return Err(TopologyError::VersionNotIncreased {
            current: versus.version,
            proposed: target.version,
        });
    }
    Ok(true)
}

// ============================================================================
// Core
// ============================================================================

pub struct TransmogrifierCore {
    self_rm: RMId,
    boot_count: BootCount,
    listen_port: u16,

    mgr: ConnectionManagerHandle,
    local: Arc<LocalConnection>,
    db: Db,
    shutdown: Arc<dyn ShutdownSignaller>,

    /// Mirror of the active topology for the client session factory.
    shared_topology: Arc<RwLock<Option<Topology>>>,

    active: Option<Topology>,
    target: Option<Configuration>,
    task: Option<Task>,

    /// Version element of the topology var's writes clock, for the
    /// read-write actions of topology txns.
    topology_var_version: u64,

    rng: StdRng,
    self_handle: Option<ExecutorHandle<TransmogrifierCore>>,
}

impl TransmogrifierCore {
    fn local_remote_hosts(&self, config: &Configuration) -> (String, Vec<String>) {
        let local = self.mgr.local_host();
        let (found, remote) = config.local_remote_hosts(&local);
        (found.unwrap_or(local), remote)
    }

    // ------------------------------------------------------------------
    // Active topology
    // ------------------------------------------------------------------

    fn set_active_topology(&mut self, topology: Topology) -> TopologyResult<()> {
        debug!(topology = %topology, "set active topology");
        if let Some(active) = &self.active {
            if topology.config.cluster_id != active.config.cluster_id
                && !active.config.cluster_id.is_empty()
            {
                return Err(TopologyError::ClusterIdChange {
                    current: active.config.cluster_id.clone(),
                    proposed: topology.config.cluster_id.clone(),
                });
            }
            if topology.version() < active.version() {
                info!(
                    goal = topology.version(),
                    active = active.version(),
                    "ignoring topology below active version"
                );
                return Ok(());
            }
            if active.config.equal_externally(&topology.config)
                && active.config.next == topology.config.next
            {
                return Ok(());
            }
        }

        if topology.config.rms_removed.contains(&self.self_rm) {
            error!("we have been removed from the cluster; shutting down");
            self.shutdown.signal_shutdown();
            return Err(TopologyError::RemovedFromCluster(self.self_rm));
        }

        *self.shared_topology.write().expect("lock") = Some(topology.clone());
        self.active = Some(topology.clone());

        if self.task.is_none() {
            match topology.next() {
                None => {
                    let (local, remote) = self.local_remote_hosts(&topology.config);
                    self.install_topology(topology.clone(), TopologyCallbacks::new());
                    info!(version = topology.version(), %local, ?remote, "topology change complete");
                    self.maybe_create_roots();
                    Ok(())
                }
                Some(next) => self.set_target(next.config.clone()),
            }
        } else {
            self.tick();
            Ok(())
        }
    }

    fn install_topology(&mut self, topology: Topology, callbacks: TopologyCallbacks) {
        let (local, remote) = self.local_remote_hosts(&topology.config);
        // During a change, peers include the target's hosts too.
        let remote = match topology.next() {
            Some(next) => {
                let mut all: BTreeSet<String> = remote.into_iter().collect();
                for host in &next.config.hosts {
                    if *host != local {
                        all.insert(host.clone());
                    }
                }
                all.into_iter().collect()
            }
            None => remote,
        };
        self.mgr.set_topology(topology, callbacks, local, remote);
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    fn set_target(&mut self, target: Configuration) -> TopologyResult<()> {
        let versus = match (&self.task, &self.target, &self.active) {
            (Some(_), Some(target), _) => target.clone(),
            (_, _, Some(active)) => active.config.clone(),
            _ => Configuration::blank(target.cluster_id.clone(), target.max_rm_count),
        };
        match validate_target(&versus, &target) {
            Ok(true) => {}
            Ok(false) => {
                info!(version = versus.version, "config already reached or targeted");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if self.task.is_some() {
            // Abandoning is idempotent: in-flight topology txns either
            // committed (we will observe them) or aborted harmlessly.
            info!("abandoning current reconfiguration task for newer target");
        }
        info!(version = target.version, "new reconfiguration target");
        self.target = Some(target);
        self.task = Some(Task::first());
        self.tick();
        Ok(())
    }

    // ------------------------------------------------------------------
    // The task machine
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        let Some(task) = self.task.clone() else {
            return;
        };
        match task {
            Task::InstallTargetOld => self.tick_install_target_old(),
            Task::InstallTargetNew => self.tick_install_target_new(),
            Task::JoinCluster => self.tick_join_cluster(),
            Task::Quiet { stage, installing } => self.tick_quiet(stage, installing),
            Task::Migrate {
                started,
                outstanding,
            } => self.tick_migrate(started, outstanding),
            Task::InstallCompletion => self.tick_install_completion(),
        }
    }

    fn advance_task(&mut self) {
        self.task = self.task.as_ref().and_then(Task::next);
        if self.task.is_none() {
            self.target = None;
        }
        self.tick();
    }

    fn active_next(&self) -> Option<&NextConfiguration> {
        self.active.as_ref().and_then(|t| t.next())
    }

    fn target_version(&self) -> u32 {
        self.target.as_ref().map(|t| t.version).unwrap_or(0)
    }

    fn tick_install_target_old(&mut self) {
        // Valid while the active topology does not yet carry the
        // target, or carries it without this RM recorded.
        let local_host = self.mgr.local_host();
        if let Some(next) = self.active_next() {
            if next.version() >= self.target_version() {
                let ours = next.config.hosts.contains(&local_host);
                if ours && !next.config.rms.contains(&self.self_rm) {
                    // Another node installed the target first; append
                    // ourselves to it.
                    let active = self.active.clone().expect("active with next");
                    let joining = !active.config.live_rms().any(|rm| rm == self.self_rm);
                    let mut new_config = active.config.clone();
                    if let Some(next) = new_config.next.as_mut() {
                        next.config.rms.push(self.self_rm);
                        if joining {
                            next.new_rm_ids.push(self.self_rm);
                        }
                    }
                    info!("recording our RMId into the installed target");
                    self.run_topology_txn(new_config);
                } else {
                    self.advance_task();
                }
                return;
            }
        }
        let Some(active) = self.active.clone() else {
            return;
        };
        let Some(mut target) = self.target.clone() else {
            return;
        };

        // Configurations name hosts; RMIds are runtime identities. Each
        // RM records itself into the target when it first proposes it,
        // serialized by the topology var like every other write.
        if target.hosts.contains(&local_host) && !target.rms.contains(&self.self_rm) {
            target.rms.push(self.self_rm);
            self.target = Some(target.clone());
        }

        let mut new_config = active.config.clone();
        let old_rms: BTreeSet<RMId> = active.config.live_rms().collect();
        let new_rms: Vec<RMId> = target
            .rms
            .iter()
            .copied()
            .filter(|rm| !rm.is_empty() && !old_rms.contains(rm))
            .collect();
        let lost: BTreeSet<RMId> = old_rms
            .iter()
            .copied()
            .filter(|rm| !target.rms.contains(rm))
            .collect();
        let next_version = target.version;
        new_config.next = Some(Box::new(NextConfiguration::new(target, new_rms, lost)));

        info!(version = next_version, "installing target on current RMs");
        self.run_topology_txn(new_config);
    }

    fn tick_install_target_new(&mut self) {
        let Some(next) = self.active_next() else {
            return;
        };
        if next.version() != self.target_version() {
            return;
        }
        if next.installed_on_new.contains(&self.self_rm) {
            self.advance_task();
            return;
        }

        // Gossip the widened topology (old ∪ new hosts) and record that
        // this RM has done so.
        let active = self.active.clone().expect("active with next");
        self.install_topology(active.clone(), TopologyCallbacks::new());

        let mut new_config = active.config.clone();
        if let Some(next) = new_config.next.as_mut() {
            next.installed_on_new.insert(self.self_rm);
        }
        info!("recording installed-on-new");
        self.run_topology_txn(new_config);
    }

    fn tick_join_cluster(&mut self) {
        let Some(next) = self.active_next() else {
            return;
        };
        if next.version() != self.target_version() {
            return;
        }
        // Proceed once every involved RM has installed the target; new
        // RMs receive their share of the object space during Migrate.
        let everyone = self
            .active
            .as_ref()
            .map(|t| {
                t.config
                    .live_rms()
                    .chain(next.new_rm_ids.iter().copied())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        if next.installed_everywhere(everyone.into_iter()) {
            self.advance_task();
        }
        // Otherwise wait: observing the next topology commit re-ticks.
    }

    fn tick_quiet(&mut self, stage: u8, installing: u32) {
        let Some(next) = self.active_next() else {
            return;
        };
        if next.version() != self.target_version()
            || !next.installed_on_new.contains(&self.self_rm)
        {
            return;
        }
        if next.quiet_rm_ids.contains(&self.self_rm) {
            self.advance_task();
            return;
        }

        // A changed target config restarts the stages.
        let current_version = next.version();
        let stage = if installing != current_version { 0 } else { stage };
        self.task = Some(Task::Quiet {
            stage,
            installing: current_version,
        });

        let active = self.active.clone().expect("active with next");
        let handle = self.self_handle.clone().expect("wired");

        match stage {
            // 0: proposer managers stop admitting client txns.
            // 2: proposer managers again, ensuring TLCs are on disk.
            0 | 2 => {
                info!(stage, "quiet: installing on to proposers");
                let mut callbacks = TopologyCallbacks::new();
                callbacks.insert(
                    TopologyChangeSubscriberKind::Proposer,
                    Box::new(move || {
                        handle.enqueue(move |core| {
                            if let Some(Task::Quiet { stage, installing }) = core.task.clone() {
                                if installing == current_version && (stage == 0 || stage == 2) {
                                    core.task = Some(Task::Quiet {
                                        stage: stage + 1,
                                        installing,
                                    });
                                }
                            }
                            core.tick();
                        });
                    }),
                );
                self.install_topology(active, callbacks);
            }
            // 1: var managers ban rolls and drain active txns.
            1 => {
                info!("quiet: installing on to vars");
                let mut callbacks = TopologyCallbacks::new();
                callbacks.insert(
                    TopologyChangeSubscriberKind::Var,
                    Box::new(move || {
                        handle.enqueue(move |core| {
                            if let Some(Task::Quiet { stage: 1, installing }) = core.task.clone()
                            {
                                if installing == current_version {
                                    core.task = Some(Task::Quiet {
                                        stage: 2,
                                        installing,
                                    });
                                }
                            }
                            core.tick();
                        });
                    }),
                );
                self.install_topology(active, callbacks);
            }
            // 3: record the achieved quiet.
            3 => {
                info!("quiet achieved; recording progress");
                let mut new_config = active.config.clone();
                if let Some(next) = new_config.next.as_mut() {
                    next.quiet_rm_ids.insert(self.self_rm);
                }
                self.run_topology_txn(new_config);
            }
            other => panic!("unexpected quiet stage: {other}"),
        }
    }

    fn tick_migrate(&mut self, started: bool, outstanding: BTreeSet<RMId>) {
        let Some(next) = self.active_next() else {
            return;
        };
        if next.version() != self.target_version()
            || !next.quiet_rm_ids.contains(&self.self_rm)
        {
            return;
        }

        if !started {
            let active = self.active.clone().expect("active");
            let target = next.config.clone();
            let version = next.version();
            let batches =
                match emigration_batches(&self.db, &active, &target, MIGRATION_BATCH_SIZE) {
                    Ok(b) => b,
                    Err(e) => {
                        // Storage owns durability; nothing sane to do.
                        panic!("emigration scan failed: {e}");
                    }
                };

            let mut outstanding = BTreeSet::new();
            for (rm, rm_batches) in batches {
                outstanding.insert(rm);
                for batch in rm_batches {
                    self.mgr.send(rm, Message::Migration(batch));
                }
                // An empty trailer marks the end of the stream.
                self.mgr.send(
                    rm,
                    Message::Migration(MigrationBatch {
                        version,
                        elements: Vec::new(),
                    }),
                );
            }
            info!(recipients = outstanding.len(), "emigration streams sent");
            let empty = outstanding.is_empty();
            self.task = Some(Task::Migrate {
                started: true,
                outstanding,
            });
            // No recipients: fall straight through.
            if empty {
                self.advance_task();
            }
            return;
        }

        if outstanding.is_empty() {
            self.advance_task();
        }
    }

    fn tick_install_completion(&mut self) {
        let Some(next) = self.active_next() else {
            // Someone else completed the installation; we observed it.
            self.task = None;
            self.target = None;
            return;
        };
        if next.version() != self.target_version() {
            return;
        }

        let active = self.active.clone().expect("active");
        let mut new_config = next.config.clone();
        let lost_rm_ids = next.lost_rm_ids.clone();
        new_config.cluster_id = active.config.cluster_id.clone();
        if !new_config.cluster_uuid.is_set() {
            new_config.cluster_uuid = if active.config.cluster_uuid.is_set() {
                active.config.cluster_uuid
            } else {
                ClusterUUId::generate(&mut self.rng)
            };
        }
        let mut removed = active.config.rms_removed.clone();
        removed.extend(lost_rm_ids.iter().copied());
        new_config.rms_removed = removed;
        new_config.next = None;

        info!(version = new_config.version, "installing completed configuration");
        self.run_topology_txn(new_config);
    }

    // ------------------------------------------------------------------
    // Topology transactions
    // ------------------------------------------------------------------

    /// Commits `new_config` into the topology var. On commit the new
    /// topology becomes active; on abort the task re-ticks after a
    /// delay (someone else may have moved the topology forward).
    fn run_topology_txn(&mut self, new_config: Configuration) {
        let value = bincode::serialize(&new_config).expect("configuration serializes");
        let peers = self.mgr.peers();

        // Voters: every live RM of old ∪ new, actives first. For
        // topology txns there are generally not 2F+1 acceptors.
        let mut rms: Vec<RMId> = self
            .active
            .as_ref()
            .map(|t| t.config.live_rms().collect::<Vec<_>>())
            .unwrap_or_default();
        for rm in new_config.live_rms() {
            if !rms.contains(&rm) {
                rms.push(rm);
            }
        }
        if rms.is_empty() {
            rms.push(self.self_rm);
        }

        let allocations: Vec<Allocation> = rms
            .iter()
            .map(|&rm| {
                let boot = if rm == self.self_rm {
                    self.boot_count
                } else {
                    peers.get(&rm).map(|p| p.boot_count).unwrap_or(BootCount::ZERO)
                };
                Allocation {
                    rm_id: rm,
                    active: boot,
                    action_indices: vec![0],
                }
            })
            .collect();

        let txn_id = TxnId::from_parts(
            self.rng.gen::<u64>(),
            Default::default(),
            self.boot_count,
            self.self_rm,
        );
        let two_f_inc = allocations.len() as u16;
        let f_inc = allocations.iter().filter(|a| a.is_active()).count().max(1) as u8;
        let txn = Txn {
            id: txn_id,
            actions: vec![Action::new(
                TOPOLOGY_VAR_UUID,
                ActionValue::ReadWrite {
                    version: self.topology_var_version,
                    value: value.into(),
                    references: vec![],
                },
            )],
            allocations,
            f_inc,
            two_f_inc,
            topology_version: self.active.as_ref().map(|t| t.version()).unwrap_or(0),
            is_topology: true,
            retry: false,
        };

        let handle = self.self_handle.clone().expect("wired");
        self.local.run_transaction(
            txn,
            Box::new(move |txn_id, outcome| {
                handle.enqueue(move |core| core.topology_txn_outcome(txn_id, new_config, outcome));
            }),
        );
    }

    fn topology_txn_outcome(
        &mut self,
        txn_id: TxnId,
        new_config: Configuration,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::Commit { clock } => {
                self.topology_var_version = clock.at(&TOPOLOGY_VAR_UUID);
                let roots = self
                    .active
                    .as_ref()
                    .map(|t| t.roots.clone())
                    .unwrap_or_default();
                let topology = Topology::new(new_config, txn_id, roots);
                if let Err(e) = self.set_active_topology(topology) {
                    warn!(error = %e, "committed topology rejected locally");
                }
            }
            Outcome::Abort(_) => {
                // Lost a race on the topology var: re-read our state and
                // try again shortly.
                debug!(txn = %txn_id, "topology txn aborted; re-ticking");
                self.topology_var_version = self.load_topology_var_version();
                let handle = self.self_handle.clone().expect("wired");
                handle.enqueue_after(RETRY_DELAY, |core| core.tick());
            }
        }
    }

    fn load_topology_var_version(&self) -> u64 {
        let key = TOPOLOGY_VAR_UUID.as_bytes().to_vec();
        self.db
            .read(move |txn| txn.get(Table::Vars, &key))
            .wait()
            .ok()
            .flatten()
            .and_then(|bytes| bincode::deserialize::<VarRecord>(&bytes).ok())
            .map(|record| record.writes_clock.at(&TOPOLOGY_VAR_UUID))
            .unwrap_or(self.topology_var_version)
    }

    // ------------------------------------------------------------------
    // Root vars
    // ------------------------------------------------------------------

    /// Creates any root vars the configuration names that do not exist
    /// yet. Root assignments (name, var id, positions) are kept in the
    /// store so clients keep their entry points across restarts.
    fn maybe_create_roots(&mut self) {
        let Some(active) = self.active.clone() else {
            return;
        };
        if active.is_blank() || active.next().is_some() {
            return;
        }

        let roots = self.load_stored_roots();
        let missing: Vec<String> = active
            .config
            .roots
            .iter()
            .filter(|name| !roots.iter().any(|r| &r.name == *name))
            .cloned()
            .collect();

        if missing.is_empty() {
            self.install_roots(roots);
            return;
        }

        // Build one create txn covering the missing roots.
        let resolver = tessera_types::Resolver::new(
            active.config.rms.clone(),
            usize::from(active.two_f_inc),
        );
        let txn_id = TxnId::from_parts(
            self.rng.gen::<u64>(),
            Default::default(),
            self.boot_count,
            self.self_rm,
        );
        let mut actions = Vec::with_capacity(missing.len());
        let mut new_roots = Vec::with_capacity(missing.len());
        let mut replica_sets = Vec::with_capacity(missing.len());
        for (n, name) in missing.iter().enumerate() {
            let var = tessera_types::VarUUId::derived_from(&txn_id, n as u64);
            let Ok((positions, replicas)) = tessera_types::hash::create_positions(
                &resolver,
                usize::from(active.config.max_rm_count),
                &mut self.rng,
            ) else {
                warn!(root = %name, "cannot place root yet; not enough RMs");
                return;
            };
            actions.push(Action::new(
                var,
                ActionValue::Create {
                    positions: positions.clone(),
                    value: Default::default(),
                    references: vec![],
                },
            ));
            new_roots.push(tessera_types::Root {
                name: name.clone(),
                var,
                positions,
            });
            replica_sets.push(replicas);
        }

        // Allocate each action to its replicas, voters first.
        let peers = self.mgr.peers();
        let f_inc = usize::from(active.f_inc);
        let mut allocs: std::collections::HashMap<RMId, (bool, Vec<u32>)> = Default::default();
        for (idx, replicas) in replica_sets.iter().enumerate() {
            for (pos, rm) in replicas.iter().enumerate() {
                let entry = allocs.entry(*rm).or_insert((false, Vec::new()));
                entry.0 |= pos < f_inc;
                entry.1.push(idx as u32);
            }
        }
        let mut allocations: Vec<Allocation> = allocs
            .into_iter()
            .map(|(rm, (active_rm, action_indices))| {
                let boot = if rm == self.self_rm {
                    self.boot_count
                } else {
                    peers.get(&rm).map(|p| p.boot_count).unwrap_or(BootCount::ZERO)
                };
                Allocation {
                    rm_id: rm,
                    active: if active_rm { boot } else { BootCount::ZERO },
                    action_indices,
                }
            })
            .collect();
        allocations.sort_by_key(|a| (!a.is_active(), a.rm_id));

        let txn = Txn {
            id: txn_id,
            actions,
            allocations,
            f_inc: active.f_inc,
            two_f_inc: active.two_f_inc,
            topology_version: active.version(),
            is_topology: false,
            retry: false,
        };

        info!(roots = ?missing, "creating root vars");
        let handle = self.self_handle.clone().expect("wired");
        self.local.run_transaction(
            txn,
            Box::new(move |_txn_id, outcome| {
                handle.enqueue(move |core| match outcome {
                    Outcome::Commit { .. } => {
                        let mut roots = core.load_stored_roots();
                        roots.extend(new_roots);
                        core.store_roots(&roots);
                        core.install_roots(roots);
                    }
                    Outcome::Abort(_) => {
                        // Another node raced us; its roots will arrive
                        // with the next topology observation.
                        debug!("root creation aborted; retrying");
                        let h = core.self_handle.clone().expect("wired");
                        h.enqueue_after(RETRY_DELAY, |core| core.maybe_create_roots());
                    }
                });
            }),
        );
    }

    fn install_roots(&mut self, roots: Vec<tessera_types::Root>) {
        if roots.is_empty() {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.roots = roots;
            *self.shared_topology.write().expect("lock") = Some(active.clone());
        }
    }

    fn load_stored_roots(&self) -> Vec<tessera_types::Root> {
        self.db
            .read(|txn| txn.get(Table::Meta, b"roots"))
            .wait()
            .ok()
            .flatten()
            .and_then(|bytes| bincode::deserialize(&bytes).ok())
            .unwrap_or_default()
    }

    fn store_roots(&self, roots: &[tessera_types::Root]) {
        let bytes = bincode::serialize(roots).expect("roots serialize");
        let _ = self
            .db
            .read_write(move |txn| txn.put(Table::Meta, b"roots", &bytes))
            .wait();
    }

    // ------------------------------------------------------------------
    // Migration plumbing
    // ------------------------------------------------------------------

    fn migration_received(&mut self, sender: RMId, batch: MigrationBatch) {
        let version = batch.version;
        if version < self.active.as_ref().map(|t| t.version()).unwrap_or(0) {
            return; // stale stream
        }
        let end_of_stream = batch.elements.is_empty();
        match immigrate(&self.db, batch) {
            Ok(installed) => {
                debug!(from = %sender, installed, "migration batch installed");
            }
            Err(e) => panic!("immigration failed: {e}"),
        }
        if end_of_stream {
            self.mgr.send(sender, Message::MigrationComplete { version });
        }
    }

    fn migration_complete_received(&mut self, sender: RMId, version: u32) {
        if version != self.target_version() {
            return;
        }
        let acked = if let Some(Task::Migrate {
            started: true,
            outstanding,
        }) = &mut self.task
        {
            outstanding.remove(&sender);
            debug!(from = %sender, remaining = outstanding.len(), "migration acknowledged");
            true
        } else {
            false
        };
        if acked {
            self.tick();
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Loads the persisted topology (if any) and reconciles it with the
    /// configuration supplied on the command line.
    fn startup(&mut self, cli_config: Option<Configuration>) {
        let stored = self.load_stored_topology();
        let topology = match stored {
            Some(t) => t,
            None => {
                let cluster_id = cli_config
                    .as_ref()
                    .map(|c| c.cluster_id.clone())
                    .unwrap_or_default();
                let max = cli_config.as_ref().map(|c| c.max_rm_count).unwrap_or(0);
                Topology::blank(cluster_id, max)
            }
        };
        self.topology_var_version = self.load_topology_var_version();
        if let Err(e) = self.set_active_topology(topology) {
            error!(error = %e, "startup topology rejected");
            return;
        }
        if let Some(config) = cli_config {
            if let Err(e) = self.set_target(config) {
                warn!(error = %e, "command-line configuration rejected");
            }
        }
    }

    fn load_stored_topology(&self) -> Option<Topology> {
        let key = TOPOLOGY_VAR_UUID.as_bytes().to_vec();
        let record = self
            .db
            .read(move |txn| txn.get(Table::Vars, &key))
            .wait()
            .ok()
            .flatten()?;
        let record: VarRecord = bincode::deserialize(&record).ok()?;
        let txn_key = record.write_txn_id.as_bytes().to_vec();
        let txn_bytes = self
            .db
            .read(move |txn| txn.get(Table::Txns, &txn_key))
            .wait()
            .ok()
            .flatten()?;
        let txn: Txn = bincode::deserialize(&txn_bytes).ok()?;
        let action = txn
            .actions
            .iter()
            .find(|a| a.var == TOPOLOGY_VAR_UUID)?;
        let (value, _) = action.written_value()?;
        let config: Configuration = bincode::deserialize(value).ok()?;
        info!(version = config.version, "restored topology from store");
        Some(Topology::new(config, record.write_txn_id, Vec::new()))
    }
}

// ============================================================================
// Actor wrapper
// ============================================================================

/// The transmogrifier actor.
pub struct Transmogrifier;

#[derive(Clone)]
pub struct TransmogrifierHandle {
    handle: ExecutorHandle<TransmogrifierCore>,
}

impl Transmogrifier {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        mgr: ConnectionManagerHandle,
        local: Arc<LocalConnection>,
        db: Db,
        shutdown: Arc<dyn ShutdownSignaller>,
        shared_topology: Arc<RwLock<Option<Topology>>>,
        listen_port: u16,
        cli_config: Option<Configuration>,
    ) -> TransmogrifierHandle {
        let core = TransmogrifierCore {
            self_rm: mgr.rm_id(),
            boot_count: mgr.boot_count(),
            listen_port,
            mgr,
            local,
            db,
            shutdown,
            shared_topology,
            active: None,
            target: None,
            task: None,
            topology_var_version: 0,
            rng: StdRng::from_entropy(),
            self_handle: None,
        };
        let exe = Executor::spawn("transmogrifier", core);
        let handle = TransmogrifierHandle {
            handle: exe.handle.clone(),
        };
        let wired = exe.handle.clone();
        exe.handle.enqueue(move |core| {
            core.set_self_handle(wired);
            core.startup(cli_config);
        });
        handle
    }
}

impl TransmogrifierCore {
    fn set_self_handle(&mut self, handle: ExecutorHandle<TransmogrifierCore>) {
        self.self_handle = Some(handle);
    }
}

impl TransmogrifierHandle {
    /// A new target configuration (SIGHUP reload or admin request).
    pub fn request_change(&self, config: Configuration) {
        self.handle.enqueue(move |core| {
            if let Err(e) = core.set_target(config) {
                warn!(error = %e, "topology change request rejected");
            }
        });
    }

    pub fn status(&self, reply: std::sync::mpsc::SyncSender<String>) {
        self.handle.enqueue(move |core| {
            let mut out = String::new();
            use std::fmt::Write as _;
            let _ = writeln!(
                out,
                "- Topology: {}",
                core.active
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            let _ = writeln!(out, "- Task: {:?}", core.task);
            let _ = writeln!(out, "- Listen port: {}", core.listen_port);
            let _ = reply.send(out);
        });
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

impl TopologyEventSink for TransmogrifierHandle {
    fn request_topology_change(&self, config: Configuration) {
        self.request_change(config);
    }

    fn migration_received(&self, sender: RMId, batch: MigrationBatch) {
        self.handle
            .enqueue(move |core| core.migration_received(sender, batch));
    }

    fn migration_complete_received(&self, sender: RMId, version: u32) {
        self.handle
            .enqueue(move |core| core.migration_complete_received(sender, version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(version: u32, f: u8, rms: Vec<u32>) -> Configuration {
        let mut c = Configuration::blank("test".into(), 8);
        c.version = version;
        c.f = f;
        c.rms = rms.into_iter().map(RMId::new).collect();
        c.hosts = c.rms.iter().map(|r| format!("node{r}:1")).collect();
        c
    }

    #[test]
    fn target_validation_rules() {
        let active = config(1, 1, vec![1, 2, 3]);

        // Higher version with changed content: accepted.
        assert!(matches!(
            validate_target(&active, &config(2, 1, vec![1, 2])),
            Ok(true)
        ));

        // Identical external content: silent success.
        assert!(matches!(validate_target(&active, &active.clone()), Ok(false)));

        // Changed content, same version.
        let mut same_version = config(1, 2, vec![1, 2, 3]);
        same_version.hosts.push("extra:1".into());
        assert!(matches!(
            validate_target(&active, &same_version),
            Err(TopologyError::ContentChangedVersionDidNot(1))
        ));

        // Version regression.
        assert!(matches!(
            validate_target(&active, &config(0, 0, vec![1])),
            Err(TopologyError::VersionNotIncreased { .. })
        ));

        // Cluster id change.
        let mut renamed = config(2, 1, vec![1, 2, 3]);
        renamed.cluster_id = "other".into();
        assert!(matches!(
            validate_target(&active, &renamed),
            Err(TopologyError::ClusterIdChange { .. })
        ));

        // Max RM count change after version 0.
        let mut resized = config(2, 1, vec![1, 2, 3]);
        resized.max_rm_count = 16;
        assert!(matches!(
            validate_target(&active, &resized),
            Err(TopologyError::MaxRMCountChange)
        ));

        // Cluster uuid conflict.
        let mut active_with_uuid = active.clone();
        active_with_uuid.cluster_uuid = ClusterUUId::new(7);
        let mut conflicting = config(2, 1, vec![1, 2, 3]);
        conflicting.cluster_uuid = ClusterUUId::new(9);
        assert!(matches!(
            validate_target(&active_with_uuid, &conflicting),
            Err(TopologyError::ClusterUUIdChange)
        ));
    }

    #[test]
    fn task_chain_order() {
        let mut task = Task::first();
        let mut names = vec![format!("{task:?}")];
        while let Some(next) = task.next() {
            names.push(format!("{next:?}"));
            task = next;
        }
        assert_eq!(names.len(), 6);
        assert!(names[0].starts_with("InstallTargetOld"));
        assert!(names[1].starts_with("InstallTargetNew"));
        assert!(names[2].starts_with("JoinCluster"));
        assert!(names[3].starts_with("Quiet"));
        assert!(names[4].starts_with("Migrate"));
        assert!(names[5].starts_with("InstallCompletion"));
    }
}
