//! # tessera-engine: Per-object serialization
//!
//! Each var is the serialization point for one object: a chain of
//! [`Frame`]s orders the writes ever committed to it, reads attach to
//! the newest frame whose version they match, and the var contributes a
//! [`Ballot`](tessera_types::Ballot) per transaction that touches it.
//!
//! Work is routed to executor shards by the id's sharding byte, so all
//! processing for one var (or one txn, for the vote layer) happens on a
//! single thread with no locks.
//!
//! - [`mailbox`]: bounded rotate-and-continue actor mailboxes
//! - [`dispatcher`]: the executor shard infrastructure
//! - [`poisson`]: arrival-rate estimation for roll pacing
//! - [`frame`]: the per-var ordering record
//! - [`var`]: the var state machine
//! - [`var_manager`]: the active-var table, hydration, durable writes

pub mod dispatcher;
pub mod frame;
pub mod mailbox;
pub mod poisson;
pub mod var;
pub mod var_dispatcher;
pub mod var_manager;

pub use dispatcher::{Executor, ExecutorHandle, ShardedDispatcher};
pub use mailbox::{Mailbox, MailboxReceiver, RecvTimeout, TryRecv};
pub use frame::{Frame, FrameId};
pub use poisson::Poisson;
pub use var::{Var, VarEvent, VarOutput, VarTxnAction, WriteRequest};
pub use var_dispatcher::{LateVoteSink, VarDispatcher};
pub use var_manager::{RollIssuer, VarManager, VoteSink};
