//! # tessera-store: Ordered transactional byte store
//!
//! The durability substrate the Tessera core persists into: a set of
//! named [`Table`]s, each an ordered byte map, written through batched
//! transactions that execute on the store's own worker thread.
//!
//! # Contract
//!
//! - A transaction is a closure run on the worker against a consistent
//!   view; writes apply atomically (one WAL record per transaction,
//!   synced before the future resolves).
//! - Submission returns a [`DbFuture`]; any thread may `wait()` on it,
//!   and actors typically forward completion back into their own
//!   mailbox.
//! - Submission order from one thread is execution order.
//!
//! # File layout
//!
//! ```text
//! {data_dir}/
//! ├── snapshot.db   <- full table dump at last compaction
//! └── wal.db        <- CRC-framed transaction records since then
//! ```

mod wal;
mod worker;

pub use worker::{Cursor, Db, DbFuture, ReadTxn, WriteTxn};

use serde::{Deserialize, Serialize};

// ============================================================================
// Tables
// ============================================================================

/// The named tables of a Tessera store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Table {
    /// `VarUUId → VarRecord` — current frame per var.
    Vars,
    /// `TxnId → Txn` — transaction blobs referenced by var records.
    Txns,
    /// `TxnId → AcceptorState` — 2B outcomes awaiting TLC/TSC.
    BallotOutcomes,
    /// `TxnId → ProposerState` — proposer checkpoints.
    Proposers,
    /// Small singleton keys: the local RMId and boot count.
    Meta,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Vars,
        Table::Txns,
        Table::BallotOutcomes,
        Table::Proposers,
        Table::Meta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Vars => "vars",
            Table::Txns => "txns",
            Table::BallotOutcomes => "ballot_outcomes",
            Table::Proposers => "proposers",
            Table::Meta => "meta",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by the store.
///
/// Callers treat any of these as fatal to the process: the store owns
/// durability and the core cannot proceed with partial state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("store worker terminated")]
    Terminated,
}

pub type StoreResult<T> = Result<T, StoreError>;
