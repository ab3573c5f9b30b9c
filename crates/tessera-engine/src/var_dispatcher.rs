//! The sharded front door to the var managers.

use std::sync::{Arc, Mutex, OnceLock};

use tessera_store::Db;
use tessera_types::{
    Ballot, Positions, RMId, Topology, Txn, TxnId, VarUUId, VectorClock,
};

use crate::dispatcher::ShardedDispatcher;
use crate::var::VarTxnAction;
use crate::var_manager::{RollIssuer, VarManager, VoteSink};

/// Routes var traffic by the var id's sharding byte.
pub struct VarDispatcher {
    dispatcher: ShardedDispatcher<VarManager>,
}

impl VarDispatcher {
    pub fn spawn(
        shard_count: usize,
        rm_id: RMId,
        db: Db,
        vote_sink: Arc<dyn VoteSink>,
        roll_issuer: Arc<dyn RollIssuer>,
    ) -> Self {
        let dispatcher = ShardedDispatcher::spawn("vars", shard_count, |_| {
            VarManager::new(rm_id, db.clone(), vote_sink.clone(), roll_issuer.clone())
        });
        for handle in dispatcher.handles() {
            let wired = handle.clone();
            handle.enqueue(move |vm| vm.set_self_handle(wired));
        }
        Self { dispatcher }
    }

    pub fn receive_txn(&self, var: VarUUId, txn_id: TxnId, action: VarTxnAction) {
        self.dispatcher
            .with_shard(var.sharding_byte(), move |vm| {
                vm.receive_txn(var, txn_id, action)
            });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn receive_outcome(
        &self,
        var: VarUUId,
        txn_id: TxnId,
        committed: bool,
        clock: VectorClock,
        is_read: bool,
        is_write: bool,
        txn: Option<Arc<Txn>>,
        positions: Option<Positions>,
    ) {
        self.dispatcher
            .with_shard(var.sharding_byte(), move |vm| {
                vm.receive_outcome(
                    var, txn_id, committed, clock, is_read, is_write, txn, positions,
                )
            });
    }

    pub fn globally_complete(&self, var: VarUUId, txn_id: TxnId, is_write: bool) {
        self.dispatcher
            .with_shard(var.sharding_byte(), move |vm| {
                vm.globally_complete(var, txn_id, is_write)
            });
    }

    /// Installs a topology on every shard; `done` fires once with the
    /// conjunction of the shard results (used as the quiet barrier
    /// acknowledgement).
    pub fn topology_changed(&self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>) {
        let shards = self.dispatcher.shard_count();
        let gate = Arc::new(Mutex::new(BarrierGate {
            remaining: shards,
            ok: true,
            done: Some(done),
        }));
        self.dispatcher.for_each_shard(move |vm| {
            let gate = gate.clone();
            vm.topology_changed(
                topology.clone(),
                Box::new(move |ok| {
                    let mut gate = gate.lock().expect("barrier gate");
                    gate.ok &= ok;
                    gate.remaining -= 1;
                    if gate.remaining == 0 {
                        if let Some(done) = gate.done.take() {
                            done(gate.ok);
                        }
                    }
                }),
            );
        });
    }

    pub fn shutdown(self) {
        self.dispatcher.shutdown();
    }
}

struct BarrierGate {
    remaining: usize,
    ok: bool,
    done: Option<Box<dyn FnOnce(bool) + Send>>,
}

/// A vote sink bound after construction, breaking the cycle between
/// the var layer (which casts ballots) and the proposer layer (which
/// both consumes ballots and engages vars).
#[derive(Default)]
pub struct LateVoteSink(OnceLock<Arc<dyn VoteSink>>);

impl LateVoteSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(OnceLock::new()))
    }

    pub fn bind(&self, sink: Arc<dyn VoteSink>) {
        if self.0.set(sink).is_err() {
            panic!("vote sink already bound");
        }
    }
}

impl VoteSink for LateVoteSink {
    fn ballot_cast(&self, txn_id: TxnId, ballot: Ballot) {
        match self.0.get() {
            Some(sink) => sink.ballot_cast(txn_id, ballot),
            None => panic!("ballot cast before vote sink bound"),
        }
    }

    fn outcome_processed(&self, txn_id: TxnId, var: VarUUId) {
        match self.0.get() {
            Some(sink) => sink.outcome_processed(txn_id, var),
            None => panic!("outcome processed before vote sink bound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountSink(std::sync::atomic::AtomicUsize);
    impl VoteSink for CountSink {
        fn ballot_cast(&self, _: TxnId, _: Ballot) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn outcome_processed(&self, _: TxnId, _: VarUUId) {}
    }

    #[test]
    fn late_sink_forwards_after_bind() {
        let late = LateVoteSink::new();
        let counter = Arc::new(CountSink(Default::default()));
        late.bind(counter.clone());
        late.ballot_cast(TxnId::ZERO, Ballot::deadlock(VarUUId::ZERO));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn double_bind_panics() {
        let late = LateVoteSink::new();
        let counter = Arc::new(CountSink(Default::default()));
        late.bind(counter.clone());
        late.bind(counter);
    }
}
