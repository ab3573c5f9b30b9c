//! The in-process client.
//!
//! Two internal callers submit transactions without a socket: the
//! topology transmogrifier (barrier and installation txns, built with
//! explicit allocations) and the var layer's roll machinery. Both go
//! through a [`LocalConnection`], which shares the submitter plumbing
//! but bypasses capability checks — the process trusts itself.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use tessera_engine::{Mailbox, RollIssuer};
use tessera_net::ConnectionManagerHandle;
use tessera_paxos::MessageRouter;
use tessera_store::{Db, Table};
use tessera_types::{
    Action, ActionValue, Outcome, Txn, TxnId, VarUUId,
};
use tessera_wire::Message;

/// Submits fully formed transactions from inside the process.
pub struct LocalConnection {
    mgr: ConnectionManagerHandle,
    db: Db,
    mailbox: Mailbox<LocalEvent>,
}

enum LocalEvent {
    Submit {
        txn: Txn,
        deliver: Box<dyn FnOnce(TxnId, Outcome) + Send>,
    },
    Outcome {
        sender: tessera_types::RMId,
        txn: Txn,
        outcome: Outcome,
    },
}

impl LocalConnection {
    /// Spawns the local connection's pump thread and registers its
    /// outcome sink with the caller (the server wiring routes
    /// `SubmissionOutcome`s for connection-count zero here).
    pub fn spawn(mgr: ConnectionManagerHandle, db: Db) -> Arc<LocalConnection> {
        let (tx, rx) = Mailbox::<LocalEvent>::new("local-connection", 256);
        let this = Arc::new(LocalConnection {
            mgr: mgr.clone(),
            db,
            mailbox: tx,
        });

        std::thread::Builder::new()
            .name("local-connection".to_string())
            .spawn(move || {
                let mut pending: Vec<(TxnId, Box<dyn FnOnce(TxnId, Outcome) + Send>)> =
                    Vec::new();
                while let Some(event) = rx.recv() {
                    match event {
                        LocalEvent::Submit { txn, deliver } => {
                            pending.push((txn.id, deliver));
                            for rm in txn.active_rms() {
                                mgr.send(rm, Message::TxnSubmission(txn.clone()));
                            }
                        }
                        LocalEvent::Outcome {
                            sender: _,
                            txn,
                            outcome,
                        } => {
                            // Confirm to the acceptors either way.
                            for rm in txn.acceptors() {
                                mgr.send(rm, Message::SubmissionComplete(txn.id));
                            }
                            if let Some(idx) =
                                pending.iter().position(|(id, _)| *id == txn.id)
                            {
                                let (_, deliver) = pending.swap_remove(idx);
                                deliver(txn.id, outcome);
                            }
                        }
                    }
                }
            })
            .expect("spawn local connection");
        this
    }

    /// Submits a fully allocated transaction. `deliver` fires with the
    /// cluster's outcome; retries are the caller's decision (topology
    /// txns must re-read before retrying).
    pub fn run_transaction(
        &self,
        txn: Txn,
        deliver: Box<dyn FnOnce(TxnId, Outcome) + Send>,
    ) {
        debug!(txn = %txn.id, topology = txn.is_topology, "local submission");
        self.mailbox.send(LocalEvent::Submit { txn, deliver });
    }

    /// Routes a `SubmissionOutcome` for a local submission.
    pub fn outcome_received(&self, sender: tessera_types::RMId, txn: Txn, outcome: Outcome) {
        self.mailbox.send(LocalEvent::Outcome {
            sender,
            txn,
            outcome,
        });
    }
}

/// Roll issuance: reread the frame's transaction from the store, lift
/// the written value, and submit it again as a roll. The roll's commit
/// sheds the clock entries the var has been dragging.
impl RollIssuer for LocalConnection {
    fn issue_roll(&self, var: VarUUId, version: u64, frame_txn: TxnId) {
        let key = frame_txn.as_bytes().to_vec();
        let Ok(Some(bytes)) = self.db.read(move |txn| txn.get(Table::Txns, &key)).wait() else {
            warn!(%var, txn = %frame_txn, "roll abandoned: frame txn not on disk");
            return;
        };
        let Ok(source) = bincode::deserialize::<Txn>(&bytes) else {
            warn!(%var, txn = %frame_txn, "roll abandoned: frame txn undecodable");
            return;
        };
        let Some((value, references)) = source
            .actions
            .iter()
            .find(|a| a.var == var)
            .and_then(|a| a.written_value())
        else {
            return;
        };

        let mut rng = StdRng::from_entropy();
        let roll_id = TxnId::from_parts(
            rng.gen::<u64>(),
            Default::default(),
            self.mgr.boot_count(),
            self.mgr.rm_id(),
        );
        let roll = Txn {
            id: roll_id,
            actions: vec![Action::new(
                var,
                ActionValue::Roll {
                    version,
                    value: value.clone(),
                    references: references.to_vec(),
                },
            )],
            // Rolls reuse the source txn's allocations: the var's
            // replica set has not moved (positions are sticky).
            allocations: source.allocations.clone(),
            f_inc: source.f_inc,
            two_f_inc: source.two_f_inc,
            topology_version: source.topology_version,
            is_topology: false,
            retry: false,
        };
        self.run_transaction(
            roll,
            Box::new(move |txn_id, outcome| {
                debug!(%var, txn = %txn_id, outcome = outcome.name(), "roll completed");
            }),
        );
    }
}
