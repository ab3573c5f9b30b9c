//! # tessera-paxos: Transaction coordination
//!
//! Turns a submitted transaction into an agreed, durable outcome:
//!
//! - [`Proposer`](proposer::Proposer)s drive 1A/2A rounds for the
//!   instances this node owns and shepherd the txn through local
//!   completion (TLC) and global completion (TGC).
//! - [`Acceptor`](acceptor::Acceptor)s answer 1A/2A, accumulate ballots
//!   into outcomes, persist them, and disseminate 2Bs.
//! - The [`BallotAccumulator`](accumulator::BallotAccumulator) combines
//!   per-var ballots across instances (and retries) into a single
//!   outcome.
//!
//! Proposers and acceptors are sharded by the txn id's sharding byte;
//! each manager owns the records on its shard.

pub mod acceptor;
pub mod accumulator;
pub mod proposal;
pub mod proposer;
pub mod senders;

pub use acceptor::{Acceptor, AcceptorDispatcher, AcceptorManager};
pub use accumulator::BallotAccumulator;
pub use proposal::Proposal;
pub use proposer::{Proposer, ProposerDispatcher, ProposerManager, ProposerMode};
pub use senders::{OneShotSender, RepeatingSender};

use std::collections::HashMap;
use std::sync::Arc;

use tessera_types::{BootCount, ClusterUUId, RMId};
use tessera_wire::Message;

// ============================================================================
// Connectivity traits
//
// Implemented by the connection layer; consumed here. The dependency
// points this way so coordination logic never sees sockets.
// ============================================================================

/// One established peer's outbound half.
pub trait PeerSender: Send + Sync {
    /// Queues a message; returns false if the connection is gone.
    fn send(&self, msg: Message) -> bool;
}

/// An established server peer as the registry exposes it.
#[derive(Clone)]
pub struct ServerPeer {
    pub rm_id: RMId,
    pub boot_count: BootCount,
    pub cluster_uuid: ClusterUUId,
    pub sender: Arc<dyn PeerSender>,
}

impl std::fmt::Debug for ServerPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPeer")
            .field("rm_id", &self.rm_id)
            .field("boot_count", &self.boot_count)
            .finish_non_exhaustive()
    }
}

/// Snapshot of the established peers, keyed by RMId. Includes a
/// loopback entry for the local RM.
pub type PeerMap = HashMap<RMId, ServerPeer>;

/// Edge-triggered observer of the peer set.
pub trait ServerConnectionSubscriber: Send + Sync {
    /// Fired on subscription with the current peer set.
    fn connected_rms(&self, peers: &PeerMap);

    fn connection_lost(&self, rm_id: RMId, peers: &PeerMap);

    /// `done` must be called once the subscriber has absorbed the event;
    /// the registry gates topology progress on it.
    fn connection_established(
        &self,
        peer: &ServerPeer,
        peers: &PeerMap,
        done: Box<dyn FnOnce() + Send>,
    );
}

/// The registry half the coordination layer needs: subscribe to peer
/// changes. Subscribers are identified by `Arc` pointer equality.
pub trait ServerConnectionPublisher: Send + Sync {
    fn add_subscriber(&self, sub: Arc<dyn ServerConnectionSubscriber>);
    fn remove_subscriber(&self, sub: &Arc<dyn ServerConnectionSubscriber>);
}

/// Fire-and-forget routing of a message to one RM, through whatever
/// connection currently serves it (including the loopback for the
/// local RM). Lost messages are repaired by protocol-level resends.
pub trait MessageRouter: Send + Sync {
    fn send(&self, to: RMId, msg: Message);
}

