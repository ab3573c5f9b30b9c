//! The active-var table.
//!
//! One [`VarManager`] lives on each var executor shard. It owns the
//! active vars routed to that shard, hydrates evicted vars from the
//! store on demand, submits their durable writes, and relays their
//! ballots to the vote layer.
//!
//! During reconfiguration the manager participates in the quiet
//! barriers: rolls are banned once barrier 1 is reached, and between
//! barriers 1 and 2 the manager reports completion only when every var
//! it hosts is durably on disk.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use tessera_store::{Db, Table};
use tessera_types::{
    Ballot, Positions, RMId, Topology, Txn, TxnId, VarRecord, VarUUId, VectorClock,
    TOPOLOGY_VAR_UUID,
};

use crate::dispatcher::ExecutorHandle;
use crate::var::{Var, VarEvent, VarOutput, VarTxnAction, WriteRequest};

/// Jitter window for roll issuance.
pub const ROLL_DELAY_MIN: Duration = Duration::from_millis(50);
pub const ROLL_DELAY_MAX: Duration = Duration::from_millis(500);

// ============================================================================
// Collaborator traits
// ============================================================================

/// Where a var's votes and outcome acknowledgements go (the proposer
/// layer implements this).
pub trait VoteSink: Send + Sync {
    /// A var cast its ballot for a txn.
    fn ballot_cast(&self, txn_id: TxnId, ballot: Ballot);

    /// A var finished processing a txn's outcome (counted towards the
    /// txn becoming locally complete).
    fn outcome_processed(&self, txn_id: TxnId, var: VarUUId);
}

/// Issues roll transactions on behalf of idle vars (the local
/// submitter implements this).
pub trait RollIssuer: Send + Sync {
    fn issue_roll(&self, var: VarUUId, version: u64, frame_txn: TxnId);
}

// ============================================================================
// VarManager
// ============================================================================

pub struct VarManager {
    rm_id: RMId,
    db: Db,
    active: HashMap<VarUUId, Var>,
    vote_sink: Arc<dyn VoteSink>,
    roll_issuer: Arc<dyn RollIssuer>,
    pub roll_allowed: bool,
    topology: Option<Topology>,

    /// Vars with a roll timer in flight; no second timer is armed.
    pending_rolls: std::collections::HashSet<VarUUId>,

    /// Fired once every hosted var is on disk (quiet barrier 1 → 2).
    on_disk: Option<Box<dyn FnOnce(bool) + Send>>,

    /// Handle back to this manager's own shard, for store completions.
    self_handle: Option<ExecutorHandle<VarManager>>,
}

impl VarManager {
    pub fn new(
        rm_id: RMId,
        db: Db,
        vote_sink: Arc<dyn VoteSink>,
        roll_issuer: Arc<dyn RollIssuer>,
    ) -> Self {
        Self {
            rm_id,
            db,
            active: HashMap::new(),
            vote_sink,
            roll_issuer,
            roll_allowed: true,
            topology: None,
            pending_rolls: std::collections::HashSet::new(),
            on_disk: None,
            self_handle: None,
        }
    }

    /// Wires the manager to its own executor shard. Must be the first
    /// job enqueued after spawn.
    pub fn set_self_handle(&mut self, handle: ExecutorHandle<VarManager>) {
        self.self_handle = Some(handle);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    // ------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------

    pub fn receive_txn(&mut self, var: VarUUId, txn_id: TxnId, action: VarTxnAction) {
        let output = self.apply(var, true, move |v| {
            v.process(VarEvent::ReceiveTxn { txn_id, action }, Instant::now())
        });
        if let Some(ballot) = output.and_then(|o| o.ballot) {
            self.vote_sink.ballot_cast(txn_id, ballot);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn receive_outcome(
        &mut self,
        var: VarUUId,
        txn_id: TxnId,
        committed: bool,
        clock: VectorClock,
        is_read: bool,
        is_write: bool,
        txn: Option<Arc<Txn>>,
        positions: Option<Positions>,
    ) {
        self.apply(var, committed && is_write, move |v| {
            v.process(
                VarEvent::ReceiveOutcome {
                    txn_id,
                    committed,
                    clock,
                    is_read,
                    is_write,
                    txn,
                    positions,
                },
                Instant::now(),
            )
        });
        self.vote_sink.outcome_processed(txn_id, var);
    }

    pub fn globally_complete(&mut self, var: VarUUId, txn_id: TxnId, is_write: bool) {
        self.apply(var, false, move |v| {
            v.process(VarEvent::GloballyComplete { txn_id, is_write }, Instant::now())
        });
    }

    fn write_completed(&mut self, var: VarUUId, frame_id: u64) {
        self.apply(var, false, move |v| {
            v.process(VarEvent::WriteCompleted { frame_id }, Instant::now())
        });
        self.check_all_disk();
    }

    // ------------------------------------------------------------------
    // Var lookup and output handling
    // ------------------------------------------------------------------

    /// Finds (hydrating or creating) the var and runs `f` against it,
    /// then schedules any disk write and retires the var if idle.
    /// Returns `None` when the var is unknown and must not be created.
    fn apply(
        &mut self,
        uuid: VarUUId,
        create_if_missing: bool,
        f: impl FnOnce(&mut Var) -> VarOutput,
    ) -> Option<VarOutput> {
        if !self.active.contains_key(&uuid) {
            match self.load(uuid) {
                Some(var) => {
                    self.active.insert(uuid, var);
                }
                None if create_if_missing => {
                    debug!(var = %uuid, "new var");
                    let mut var = Var::new(uuid);
                    if uuid == TOPOLOGY_VAR_UUID {
                        // The topology var is never created by a client
                        // and is replicated by its own transactions, so
                        // its positions are a fixed degenerate vector.
                        var.positions = Some(Positions::new(vec![0]));
                    }
                    self.active.insert(uuid, var);
                }
                None => {
                    trace!(var = %uuid, "event for unknown var ignored");
                    return None;
                }
            }
        }

        let var = self.active.get_mut(&uuid).expect("inserted above");
        let mut output = f(var);

        if let Some(write) = output.write.take() {
            self.submit_write(uuid, write);
        }
        self.maybe_roll(uuid);
        self.maybe_make_inactive(uuid);
        Some(output)
    }

    /// Hydrates a var from the store; blocks this shard on the store
    /// worker, preserving submission order.
    fn load(&self, uuid: VarUUId) -> Option<Var> {
        let key = uuid.as_bytes().to_vec();
        let bytes = self
            .db
            .read(move |txn| txn.get(Table::Vars, &key))
            .wait()
            .unwrap_or_else(|e| panic!("store read failed while loading {uuid}: {e}"))?;
        let record: VarRecord = bincode::deserialize(&bytes)
            .unwrap_or_else(|e| panic!("var record for {uuid} failed to decode: {e}"));
        Some(Var::from_record(record))
    }

    /// Submits the coalesced frame write: txn blob + var record in one
    /// store transaction, deleting the previously referenced txn.
    fn submit_write(&self, uuid: VarUUId, write: WriteRequest) {
        let WriteRequest {
            frame_id,
            record,
            txn,
            delete_txn,
        } = write;
        let handle = self
            .self_handle
            .clone()
            .expect("var manager not wired to its shard");

        let record_bytes = bincode::serialize(&record).expect("var record serializes");
        let txn_bytes = bincode::serialize(txn.as_ref()).expect("txn serializes");
        let txn_key = record.write_txn_id.as_bytes().to_vec();
        let var_key = uuid.as_bytes().to_vec();
        let delete_key = delete_txn.map(|t| t.as_bytes().to_vec());

        let future = self.db.read_write(move |store_txn| {
            store_txn.put(Table::Txns, &txn_key, &txn_bytes);
            store_txn.put(Table::Vars, &var_key, &record_bytes);
            if let Some(delete_key) = &delete_key {
                store_txn.delete(Table::Txns, delete_key);
            }
        });

        // Wait on the future off-shard, then hop back onto the shard.
        std::thread::Builder::new()
            .name("var-write-wait".to_string())
            .spawn(move || {
                if future.wait().is_err() {
                    // Store gone: shutdown in progress, nothing to do.
                    return;
                }
                handle.enqueue(move |vm| vm.write_completed(uuid, frame_id));
            })
            .expect("spawn write waiter");
    }

    fn maybe_make_inactive(&mut self, uuid: VarUUId) {
        if let Some(var) = self.active.get(&uuid) {
            if var.is_idle() {
                trace!(var = %uuid, "now inactive");
                self.active.remove(&uuid);
            }
        }
    }

    /// Rolls are delayed by a per-var jitter in
    /// `[ROLL_DELAY_MIN, ROLL_DELAY_MAX)` and re-checked at fire time:
    /// fresh traffic in the window cancels the roll.
    fn maybe_roll(&mut self, uuid: VarUUId) {
        if !self.roll_allowed || self.pending_rolls.contains(&uuid) {
            return;
        }
        let Some(var) = self.active.get(&uuid) else {
            return;
        };
        if !var.wants_roll(Instant::now()) {
            return;
        }
        let Some(handle) = self.self_handle.clone() else {
            return;
        };

        self.pending_rolls.insert(uuid);
        let range = (ROLL_DELAY_MAX - ROLL_DELAY_MIN).as_millis() as u64;
        let jitter =
            u64::from_be_bytes(uuid.as_bytes()[0..8].try_into().expect("8 bytes")) % range;
        let delay = ROLL_DELAY_MIN + Duration::from_millis(jitter);
        handle.enqueue_after(delay, move |vm| {
            vm.pending_rolls.remove(&uuid);
            if !vm.roll_allowed {
                return;
            }
            if let Some(var) = vm.active.get(&uuid) {
                if var.wants_roll(Instant::now()) {
                    if let Some(frame_txn) = var.current_frame_txn() {
                        vm.roll_issuer
                            .issue_roll(uuid, var.current_version(), frame_txn);
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Topology barriers
    // ------------------------------------------------------------------

    /// Installs a new topology.
    ///
    /// `done` fires once this shard has done what the change requires of
    /// it: immediately, unless the change is between quiet barriers 1
    /// and 2, in which case it fires once every hosted var is on disk.
    pub fn topology_changed(
        &mut self,
        topology: Topology,
        done: Box<dyn FnOnce(bool) + Send>,
    ) {
        // A superseding change abandons the previous barrier wait.
        if let Some(prev) = self.on_disk.take() {
            prev(false);
        }

        let rm = self.rm_id;
        if self.roll_allowed {
            self.roll_allowed = !topology.next_barrier_reached1(rm);
        }
        let going_to_disk =
            topology.next_barrier_reached1(rm) && !topology.next_barrier_reached2(rm);
        self.topology = Some(topology);

        if going_to_disk {
            self.on_disk = Some(done);
            self.check_all_disk();
        } else {
            done(true);
        }
    }

    fn check_all_disk(&mut self) {
        if self.on_disk.is_none() {
            return;
        }
        for (uuid, var) in &self.active {
            if *uuid != TOPOLOGY_VAR_UUID && !var.is_on_disk() {
                if !self.roll_allowed {
                    trace!(var = %uuid, "waiting for disk during quiet");
                }
                return;
            }
        }
        if let Some(done) = self.on_disk.take() {
            debug!("all vars on disk; quiet barrier passed");
            self.roll_allowed = false;
            done(true);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn status(&self, out: &mut String) {
        let _ = writeln!(out, "- Active vars: {}", self.active.len());
        let _ = writeln!(out, "- Rolls allowed: {}", self.roll_allowed);
        let _ = writeln!(
            out,
            "- Topology version: {}",
            self.topology.as_ref().map(|t| t.version()).unwrap_or(0)
        );
        for (uuid, var) in &self.active {
            let _ = writeln!(
                out,
                "  {uuid}: version {} frames {} idle {}",
                var.current_version(),
                var.frame_chain_len(),
                var.is_idle()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Executor;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tessera_types::{Allocation, BootCount, VectorClockBuilder, Vote};

    struct SinkRecorder {
        ballots: Mutex<Vec<(TxnId, Ballot)>>,
        processed: Mutex<Vec<(TxnId, VarUUId)>>,
    }

    impl SinkRecorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ballots: Mutex::new(Vec::new()),
                processed: Mutex::new(Vec::new()),
            })
        }
    }

    impl VoteSink for SinkRecorder {
        fn ballot_cast(&self, txn_id: TxnId, ballot: Ballot) {
            self.ballots.lock().unwrap().push((txn_id, ballot));
        }
        fn outcome_processed(&self, txn_id: TxnId, var: VarUUId) {
            self.processed.lock().unwrap().push((txn_id, var));
        }
    }

    struct NoRolls;
    impl RollIssuer for NoRolls {
        fn issue_roll(&self, _: VarUUId, _: u64, _: TxnId) {}
    }

    fn uuid(n: u64) -> VarUUId {
        VarUUId::derived_from(&TxnId::ZERO, n)
    }

    fn txn_id(n: u64) -> TxnId {
        TxnId::from_parts(n, Default::default(), BootCount::new(1), RMId::new(1))
    }

    fn dummy_txn(id: TxnId) -> Arc<Txn> {
        Arc::new(Txn {
            id,
            actions: vec![],
            allocations: vec![Allocation::active(RMId::new(1), BootCount::new(1), vec![])],
            f_inc: 1,
            two_f_inc: 1,
            topology_version: 0,
            is_topology: false,
            retry: false,
        })
    }

    /// Spawns a manager on its own shard over a fresh store.
    fn manager_fixture(
        sink: Arc<SinkRecorder>,
    ) -> (
        ExecutorHandle<VarManager>,
        Db,
        std::thread::JoinHandle<()>,
        tempfile::TempDir,
    ) {
        let dir = tempdir().expect("tempdir");
        let (db, store_thread) = Db::open(dir.path()).expect("open store");
        let vm = VarManager::new(RMId::new(1), db.clone(), sink, Arc::new(NoRolls));
        let exe = Executor::spawn("vars-test", vm);
        let handle = exe.handle.clone();
        let wired = handle.clone();
        handle.enqueue(move |vm| vm.set_self_handle(wired));
        (handle, db, store_thread, dir)
    }

    /// Runs a closure on the shard and waits for it.
    fn on_shard<T: Send + 'static>(
        handle: &ExecutorHandle<VarManager>,
        f: impl FnOnce(&mut VarManager) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = mpsc::sync_channel(1);
        handle.enqueue(move |vm| {
            let _ = tx.send(f(vm));
        });
        rx.recv().expect("shard alive")
    }

    #[test]
    fn commit_persists_record_and_evicts_var() {
        let sink = SinkRecorder::new();
        let (handle, db, _store, _dir) = manager_fixture(sink.clone());

        let v = uuid(1);
        let t = txn_id(1);
        on_shard(&handle, move |vm| {
            vm.receive_txn(v, t, VarTxnAction::Write)
        });
        assert!(matches!(
            sink.ballots.lock().unwrap().last(),
            Some((id, b)) if *id == t && b.vote == Vote::Commit
        ));

        let clock = VectorClockBuilder::new().set(v, 1).build();
        on_shard(&handle, move |vm| {
            vm.receive_outcome(
                v,
                t,
                true,
                clock,
                false,
                true,
                Some(dummy_txn(t)),
                Some(Positions::new(vec![0])),
            )
        });
        assert_eq!(sink.processed.lock().unwrap().len(), 1);

        // Wait for the disk write to land and the var to go inactive.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let count = on_shard(&handle, |vm| vm.active_count());
            if count == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "var never went inactive");
            std::thread::sleep(Duration::from_millis(10));
        }

        // The record is durable and rehydrates on demand.
        let key = v.as_bytes().to_vec();
        let bytes = db
            .read(move |txn| txn.get(Table::Vars, &key))
            .wait()
            .expect("read")
            .expect("record present");
        let record: VarRecord = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(record.write_txn_id, t);
        assert_eq!(record.writes_clock.at(&v), 1);

        // A read against the hydrated var commits at version 1.
        let t2 = txn_id(2);
        on_shard(&handle, move |vm| {
            vm.receive_txn(v, t2, VarTxnAction::Read { version: 1 })
        });
        assert!(matches!(
            sink.ballots.lock().unwrap().last(),
            Some((id, b)) if *id == t2 && b.vote == Vote::Commit
        ));
    }

    #[test]
    fn quiet_barrier_waits_for_disk() {
        let sink = SinkRecorder::new();
        let (handle, _db, _store, _dir) = manager_fixture(sink.clone());

        let v = uuid(1);
        let t = txn_id(1);
        let clock = VectorClockBuilder::new().set(v, 1).build();
        on_shard(&handle, move |vm| {
            vm.receive_txn(v, t, VarTxnAction::Write);
            vm.receive_outcome(
                v,
                t,
                true,
                clock,
                false,
                true,
                Some(dummy_txn(t)),
                Some(Positions::new(vec![0])),
            );
        });

        // Install a topology that has reached barrier 1 but not 2 for
        // this RM.
        let (tx, rx) = mpsc::sync_channel(1);
        on_shard(&handle, move |vm| {
            let mut config = tessera_types::Configuration::blank("test".into(), 4);
            config.version = 1;
            let mut next = tessera_types::NextConfiguration::new(
                tessera_types::Configuration::blank("test".into(), 4),
                vec![],
                Default::default(),
            );
            next.barrier_reached1.insert(RMId::new(1));
            config.next = Some(Box::new(next));
            let topology = Topology::new(config, tessera_types::VERSION_ONE, vec![]);
            vm.topology_changed(
                topology,
                Box::new(move |ok| {
                    let _ = tx.send(ok);
                }),
            );
        });

        // The barrier completes once the var's write lands on disk.
        assert!(rx
            .recv_timeout(Duration::from_secs(5))
            .expect("barrier completion"));
        let rolls = on_shard(&handle, |vm| vm.roll_allowed);
        assert!(!rolls);
    }
}
