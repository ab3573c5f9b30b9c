//! The transaction submitter.
//!
//! Turns a client's action batch into a fully allocated transaction:
//! versions come from the version cache, placements from the positions
//! cache, voter/learner split from the topology. The submission is
//! broadcast to the active replicas; aborts are retried automatically
//! with bounded backoff (`Resubmit` verbatim under a fresh TxnId,
//! `Rerun` after repairing the cache), and only the final commit is
//! delivered back to the client.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use tessera_engine::Executor;
use tessera_net::{ClientConnection, ClientTxnMetrics, ConnectionManagerHandle};
use tessera_paxos::{PeerMap, ServerConnectionSubscriber, ServerPeer};
use tessera_types::{
    Abort, Action, ActionValue, Allocation, BinaryBackoff, BootCount, ConnectionCount, HashCache,
    Outcome, RMId, Resolver, Reference, Topology, Txn, TxnId, VarUUId,
};
use tessera_wire::{ClientOutcome, ClientRoot, ClientTxn, Message};

use crate::version_cache::VersionCache;
use crate::{ClientError, ClientResult};

use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Retry delay bounds for aborted submissions.
pub const SUBMIT_DELAY_MIN: Duration = Duration::from_millis(2);
pub const SUBMIT_DELAY_MAX: Duration = Duration::from_secs(2);

/// Delivery of the final outcome back to the client.
pub type Deliver = Box<dyn FnOnce(ClientOutcome) + Send>;

struct Pending {
    original: TxnId,
    actions: Vec<Action>,
    txn: Txn,
    deliver: Option<Deliver>,
}

/// The submitter state, owned by its executor thread.
pub struct SubmitterCore {
    rm_id: RMId,
    boot_count: BootCount,
    connection_count: ConnectionCount,

    cache: VersionCache,
    placements: HashCache,
    topology: Option<Topology>,
    peers: PeerMap,

    backoff: BinaryBackoff,
    rng: StdRng,
    txn_counter: u64,

    pending: HashMap<TxnId, Pending>,
    metrics: Arc<ClientTxnMetrics>,

    self_handle: Option<tessera_engine::ExecutorHandle<SubmitterCore>>,
}

impl SubmitterCore {
    pub fn new(
        rm_id: RMId,
        boot_count: BootCount,
        connection_count: ConnectionCount,
        roots: &[ClientRoot],
        metrics: Arc<ClientTxnMetrics>,
    ) -> Self {
        let mut placements = HashCache::new(Resolver::new(Vec::new(), 0));
        for root in roots {
            placements.add_position(root.var, root.positions.clone());
        }
        Self {
            rm_id,
            boot_count,
            connection_count,
            cache: VersionCache::from_roots(roots),
            placements,
            topology: None,
            peers: PeerMap::new(),
            backoff: BinaryBackoff::new(SUBMIT_DELAY_MIN, SUBMIT_DELAY_MAX),
            rng: StdRng::from_entropy(),
            txn_counter: 0,
            pending: HashMap::new(),
            metrics,
            self_handle: None,
        }
    }

    pub fn set_self_handle(&mut self, handle: tessera_engine::ExecutorHandle<SubmitterCore>) {
        self.self_handle = Some(handle);
    }

    pub fn set_topology(&mut self, topology: Topology) {
        self.placements.set_resolver(Resolver::new(
            topology.config.rms.clone(),
            usize::from(topology.two_f_inc),
        ));
        self.topology = Some(topology);
    }

    pub fn set_peers(&mut self, peers: PeerMap) {
        self.peers = peers;
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Entry point for a client's submission.
    pub fn submit(&mut self, client_txn: ClientTxn, deliver: Deliver) {
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        let original = client_txn.id;
        match self.translate_and_send(client_txn.actions, original) {
            Ok((txn_id, txn, actions)) => {
                self.pending.insert(
                    txn_id,
                    Pending {
                        original,
                        actions,
                        txn,
                        deliver: Some(deliver),
                    },
                );
            }
            Err(e) => {
                warn!(txn = %original, error = %e, "submission rejected");
                deliver(ClientOutcome {
                    txn_id: original,
                    final_txn_id: original,
                    outcome: Outcome::Abort(Abort::Resubmit),
                });
            }
        }
    }

    /// Builds the allocated txn and broadcasts it to the active RMs.
    fn translate_and_send(
        &mut self,
        client_actions: Vec<Action>,
        original: TxnId,
    ) -> ClientResult<(TxnId, Txn, Vec<Action>)> {
        let topology = self.topology.clone().ok_or(ClientError::NoTopology)?;

        self.txn_counter += 1;
        let txn_id = TxnId::from_parts(
            self.txn_counter
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                ^ rand::Rng::gen::<u64>(&mut self.rng),
            self.connection_count,
            self.boot_count,
            self.rm_id,
        );

        // Re-resolve actions against the current caches.
        let mut actions = Vec::with_capacity(client_actions.len());
        let mut created_count = 0u64;
        for action in &client_actions {
            let rebuilt = match &action.value {
                ActionValue::Read { .. } => {
                    let version = self.cache.check_read(&action.var)?;
                    Action::new(action.var, ActionValue::Read { version })
                }
                ActionValue::Write { value, references } => {
                    self.cache.check_write(&action.var)?;
                    Action::new(
                        action.var,
                        ActionValue::Write {
                            value: value.clone(),
                            references: references.clone(),
                        },
                    )
                }
                ActionValue::ReadWrite { value, references, .. } => {
                    let version = self.cache.check_read(&action.var)?;
                    self.cache.check_write(&action.var)?;
                    Action::new(
                        action.var,
                        ActionValue::ReadWrite {
                            version,
                            value: value.clone(),
                            references: references.clone(),
                        },
                    )
                }
                ActionValue::Create { value, references, .. } => {
                    let var = VarUUId::derived_from(&txn_id, created_count);
                    created_count += 1;
                    let (positions, _) = self.placements.create_positions(
                        var,
                        usize::from(topology.config.max_rm_count),
                        &mut self.rng,
                    )?;
                    self.cache.created(var, txn_id, 0);
                    Action::new(
                        var,
                        ActionValue::Create {
                            positions,
                            value: value.clone(),
                            references: references.clone(),
                        },
                    )
                }
                ActionValue::Roll { version, value, references } => Action::new(
                    action.var,
                    ActionValue::Roll {
                        version: *version,
                        value: value.clone(),
                        references: references.clone(),
                    },
                ),
                ActionValue::Missing => continue,
            };
            // Positions travel with references; keep the placement
            // cache fed as the graph is explored.
            if let Some((_, references)) = rebuilt.written_value() {
                for Reference { var, positions, .. } in references {
                    if let Some(p) = positions {
                        self.placements.add_position(*var, p.clone());
                    }
                }
            }
            actions.push(rebuilt);
        }

        // Allocate: per var, the first F+1 replicas vote.
        let f_inc = usize::from(topology.f_inc);
        let mut allocs: HashMap<RMId, (bool, Vec<u32>)> = HashMap::new();
        for (idx, action) in actions.iter().enumerate() {
            let replicas = self.placements.hash_codes(&action.var)?.to_vec();
            for (pos, rm) in replicas.into_iter().enumerate() {
                let entry = allocs.entry(rm).or_insert((false, Vec::new()));
                entry.0 |= pos < f_inc;
                if !entry.1.contains(&(idx as u32)) {
                    entry.1.push(idx as u32);
                }
            }
        }

        let mut allocations = Vec::with_capacity(allocs.len());
        for (rm, (active, action_indices)) in allocs {
            if active {
                let boot = self
                    .peers
                    .get(&rm)
                    .map(|p| p.boot_count)
                    .unwrap_or(BootCount::ZERO);
                allocations.push(Allocation {
                    rm_id: rm,
                    active: boot,
                    action_indices,
                });
            } else {
                allocations.push(Allocation::passive(rm, action_indices));
            }
        }
        // Actives first (stably), passives after.
        allocations.sort_by_key(|a| (!a.is_active(), a.rm_id));

        let txn = Txn {
            id: txn_id,
            actions: actions.clone(),
            allocations,
            f_inc: topology.f_inc,
            two_f_inc: topology.two_f_inc,
            topology_version: topology.version(),
            is_topology: false,
            retry: false,
        };

        self.broadcast(&txn);
        trace!(txn = %txn_id, original = %original, "submitted");
        Ok((txn_id, txn, client_actions))
    }

    /// Sends the submission to every active RM currently connected.
    /// Disconnected actives are repaired by the acceptors' submitter
    /// takeover, or by our retry.
    fn broadcast(&self, txn: &Txn) {
        for rm in txn.active_rms() {
            if let Some(peer) = self.peers.get(&rm) {
                peer.sender.send(Message::TxnSubmission(txn.clone()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    /// An acceptor delivered the cluster's outcome for one of our
    /// submissions.
    pub fn outcome_received(&mut self, sender: RMId, txn: Txn, outcome: Outcome) {
        let txn_id = txn.id;
        let Some(mut pending) = self.pending.remove(&txn_id) else {
            // Already handled (acceptors resend): just confirm.
            self.send_tsc(&txn, sender);
            return;
        };

        // First confirmation: release the acceptors.
        self.send_tsc_all(&pending.txn);

        match outcome {
            Outcome::Commit { clock } => {
                debug!(txn = %txn_id, "commit");
                self.metrics.committed.fetch_add(1, Ordering::Relaxed);
                self.backoff.shrink(&mut self.rng, SUBMIT_DELAY_MIN);
                self.cache.update_from_commit(&pending.txn, &clock);
                if let Some(deliver) = pending.deliver.take() {
                    deliver(ClientOutcome {
                        txn_id: pending.original,
                        final_txn_id: txn_id,
                        outcome: Outcome::Commit { clock },
                    });
                }
            }
            Outcome::Abort(abort) => {
                self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
                if let Abort::Rerun(updates) = &abort {
                    self.cache.update_from_abort(updates);
                }
                self.schedule_retry(pending);
            }
        }
    }

    /// Retries an aborted submission after a jittered backoff.
    fn schedule_retry(&mut self, pending: Pending) {
        self.metrics.resubmitted.fetch_add(1, Ordering::Relaxed);
        let delay = self.backoff.current();
        self.backoff.advance(&mut self.rng);
        let handle = self.self_handle.clone().expect("submitter wired");
        debug!(original = %pending.original, ?delay, "scheduling resubmission");

        let retry = move |core: &mut SubmitterCore| {
            let Pending {
                original,
                actions,
                deliver,
                ..
            } = pending;
            match core.translate_and_send(actions, original) {
                Ok((txn_id, txn, actions)) => {
                    core.pending.insert(
                        txn_id,
                        Pending {
                            original,
                            actions,
                            txn,
                            deliver,
                        },
                    );
                }
                Err(e) => {
                    warn!(txn = %original, error = %e, "resubmission rejected");
                    if let Some(deliver) = deliver {
                        deliver(ClientOutcome {
                            txn_id: original,
                            final_txn_id: original,
                            outcome: Outcome::Abort(Abort::Resubmit),
                        });
                    }
                }
            }
        };
        if delay.is_zero() {
            handle.enqueue(retry);
        } else {
            handle.enqueue_after(delay, retry);
        }
    }

    fn send_tsc_all(&self, txn: &Txn) {
        for rm in txn.acceptors() {
            if let Some(peer) = self.peers.get(&rm) {
                peer.sender.send(Message::SubmissionComplete(txn.id));
            }
        }
    }

    fn send_tsc(&self, txn: &Txn, to: RMId) {
        if let Some(peer) = self.peers.get(&to) {
            peer.sender.send(Message::SubmissionComplete(txn.id));
        }
    }

    /// The session died: abandon in-flight submissions so their
    /// proposers can abort them.
    pub fn shutdown(&mut self) {
        for (txn_id, pending) in self.pending.drain() {
            for rm in pending.txn.active_rms() {
                if let Some(peer) = self.peers.get(&rm) {
                    peer.sender.send(Message::SubmissionAbort(txn_id));
                }
            }
        }
    }
}

// ============================================================================
// Actor wrapper
// ============================================================================

/// A submitter running on its own executor.
pub struct Submitter;

/// Handle implementing the registry-facing traits.
#[derive(Clone)]
pub struct SubmitterHandle {
    handle: tessera_engine::ExecutorHandle<SubmitterCore>,
}

impl Submitter {
    /// Spawns a submitter for one client session and registers it with
    /// the connection manager.
    pub fn spawn(
        mgr: &ConnectionManagerHandle,
        connection_count: ConnectionCount,
        roots: &[ClientRoot],
    ) -> Option<SubmitterHandle> {
        let core = SubmitterCore::new(
            mgr.rm_id(),
            mgr.boot_count(),
            connection_count,
            roots,
            mgr.client_metrics(),
        );
        let exe = Executor::spawn(format!("submitter-{}", connection_count.as_u32()), core);
        let handle = SubmitterHandle { handle: exe.handle.clone() };
        let wired = exe.handle.clone();
        exe.handle.enqueue(move |core| core.set_self_handle(wired));

        let (peers, _metrics) =
            mgr.client_established(connection_count, Arc::new(handle.clone()))?;
        handle.handle.enqueue(move |core| core.set_peers(peers));
        Some(handle)
    }

}

impl SubmitterHandle {
    pub fn submit(&self, client_txn: ClientTxn, deliver: Deliver) {
        self.handle
            .enqueue(move |core| core.submit(client_txn, deliver));
    }

    pub fn set_topology(&self, topology: Topology) {
        self.handle.enqueue(move |core| core.set_topology(topology));
    }

    pub fn set_peers(&self, peers: PeerMap) {
        self.handle.enqueue(move |core| core.set_peers(peers));
    }

    pub fn stop(&self) {
        self.handle.enqueue(|core| core.shutdown());
        self.handle.shutdown();
    }
}

impl ClientConnection for SubmitterHandle {
    fn outcome_received(&self, sender: RMId, txn: Txn, outcome: Outcome) {
        self.handle
            .enqueue(move |core| core.outcome_received(sender, txn, outcome));
    }

    fn topology_changed(&self, topology: Topology) {
        self.set_topology(topology);
    }

    fn shutdown(&self) {
        self.stop();
    }
}

impl ServerConnectionSubscriber for SubmitterHandle {
    fn connected_rms(&self, peers: &PeerMap) {
        self.set_peers(peers.clone());
    }

    fn connection_lost(&self, _rm_id: RMId, peers: &PeerMap) {
        self.set_peers(peers.clone());
    }

    fn connection_established(
        &self,
        _peer: &ServerPeer,
        peers: &PeerMap,
        done: Box<dyn FnOnce() + Send>,
    ) {
        self.set_peers(peers.clone());
        done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tessera_paxos::PeerSender;
    use tessera_types::{Capability, ClusterUUId, Configuration, Positions, VERSION_ONE};

    struct Recorder(Mutex<Vec<Message>>, AtomicUsize);
    impl PeerSender for Recorder {
        fn send(&self, msg: Message) -> bool {
            self.0.lock().unwrap().push(msg);
            self.1.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn topology_of(rms: &[u32], f: u8) -> Topology {
        let mut config = Configuration::blank("test".into(), rms.len() as u16);
        config.version = 1;
        config.f = f;
        config.cluster_uuid = ClusterUUId::new(1);
        config.rms = rms.iter().map(|&r| RMId::new(r)).collect();
        config.hosts = rms.iter().map(|r| format!("node{r}:1")).collect();
        Topology::new(config, VERSION_ONE, vec![])
    }

    fn peers_of(rms: &[u32], recorder: &Arc<Recorder>) -> PeerMap {
        rms.iter()
            .map(|&r| {
                (
                    RMId::new(r),
                    ServerPeer {
                        rm_id: RMId::new(r),
                        boot_count: BootCount::new(1),
                        cluster_uuid: ClusterUUId::new(1),
                        sender: recorder.clone() as Arc<dyn PeerSender>,
                    },
                )
            })
            .collect()
    }

    fn core_with(rms: &[u32], f: u8, recorder: &Arc<Recorder>) -> SubmitterCore {
        let root_var = VarUUId::derived_from(&TxnId::ZERO, 1);
        let roots = vec![ClientRoot {
            name: "root".into(),
            var: root_var,
            positions: Positions::new(vec![0; rms.len()]),
            capability: Capability::read_write_all(),
        }];
        let mut core = SubmitterCore::new(
            RMId::new(1),
            BootCount::new(1),
            ConnectionCount::new(7),
            &roots,
            Arc::new(ClientTxnMetrics::default()),
        );
        core.set_topology(topology_of(rms, f));
        core.set_peers(peers_of(rms, recorder));
        core
    }

    fn root_var() -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, 1)
    }

    #[test]
    fn submission_broadcasts_to_actives_with_namespace() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new()), AtomicUsize::new(0)));
        let mut core = core_with(&[1, 2, 3], 1, &recorder);

        let client_txn = ClientTxn {
            id: TxnId::ZERO,
            retry: false,
            actions: vec![Action::new(
                root_var(),
                ActionValue::Write {
                    value: Bytes::from_static(b"x"),
                    references: vec![],
                },
            )],
        };
        core.submit(client_txn, Box::new(|_| {}));

        let sent = recorder.0.lock().unwrap();
        // F+1 = 2 active replicas get the submission.
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Message::TxnSubmission(txn) => {
                assert_eq!(txn.id.rm_id(), RMId::new(1));
                assert_eq!(txn.id.connection_count(), ConnectionCount::new(7));
                assert_eq!(txn.two_f_inc, 3);
                assert_eq!(txn.active_rms().len(), 2);
                assert_eq!(txn.allocations.len(), 3);
            }
            other => panic!("expected submission, got {other:?}"),
        }
    }

    #[test]
    fn capability_violation_is_rejected_before_the_wire() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new()), AtomicUsize::new(0)));
        let mut core = core_with(&[1], 0, &recorder);

        let delivered = Arc::new(Mutex::new(None));
        let delivered2 = delivered.clone();
        let unknown = VarUUId::derived_from(&TxnId::ZERO, 99);
        core.submit(
            ClientTxn {
                id: TxnId::ZERO,
                retry: false,
                actions: vec![Action::new(unknown, ActionValue::Read { version: 0 })],
            },
            Box::new(move |outcome| {
                *delivered2.lock().unwrap() = Some(outcome);
            }),
        );

        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(matches!(
            delivered.lock().unwrap().as_ref().map(|o| &o.outcome),
            Some(Outcome::Abort(_))
        ));
    }

    #[test]
    fn commit_updates_cache_and_sends_tsc() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new()), AtomicUsize::new(0)));
        let mut core = core_with(&[1], 0, &recorder);

        let delivered = Arc::new(Mutex::new(None));
        let delivered2 = delivered.clone();
        core.submit(
            ClientTxn {
                id: TxnId::ZERO,
                retry: false,
                actions: vec![Action::new(
                    root_var(),
                    ActionValue::Write {
                        value: Bytes::from_static(b"x"),
                        references: vec![],
                    },
                )],
            },
            Box::new(move |outcome| {
                *delivered2.lock().unwrap() = Some(outcome);
            }),
        );

        let submitted = {
            let sent = recorder.0.lock().unwrap();
            match sent.last().expect("submission") {
                Message::TxnSubmission(txn) => txn.clone(),
                other => panic!("expected submission, got {other:?}"),
            }
        };

        let clock = tessera_types::VectorClockBuilder::new()
            .set(root_var(), 1)
            .build();
        core.outcome_received(
            RMId::new(1),
            submitted.clone(),
            Outcome::Commit { clock },
        );

        let outcome = delivered.lock().unwrap().take().expect("delivered");
        assert_eq!(outcome.txn_id, TxnId::ZERO);
        assert_eq!(outcome.final_txn_id, submitted.id);
        assert!(outcome.outcome.is_commit());
        assert_eq!(
            core.cache.version_of(&root_var()).map(|(_, v)| v),
            Some(1)
        );

        let sent = recorder.0.lock().unwrap();
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::SubmissionComplete(id) if *id == submitted.id)));
    }
}
