//! # tessera-client: Transaction submission
//!
//! The submitting side of the protocol:
//!
//! - [`VersionCache`]: per-client view of var versions and
//!   capabilities; repaired by commit outcomes and `Rerun` updates.
//! - [`Submitter`]: turns client actions into fully allocated
//!   transactions, broadcasts them to the active replicas, and retries
//!   aborts with bounded backoff until a commit lands.
//! - [`LocalConnection`]: the in-process client the topology
//!   transmogrifier and the var roll machinery submit through.
//! - [`ClientSession`]: pumps `ClientMessage` frames for one connected
//!   client.

pub mod local;
pub mod session;
pub mod submitter;
pub mod version_cache;

pub use local::LocalConnection;
pub use session::ClientSession;
pub use submitter::{Submitter, SubmitterHandle};
pub use version_cache::VersionCache;

use tessera_types::VarUUId;

/// Errors raised while preparing a submission.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("no capability to read {0}")]
    ReadDenied(VarUUId),

    #[error("no capability to write {0}")]
    WriteDenied(VarUUId),

    #[error("reference to unknown var {0}")]
    UnknownVar(VarUUId),

    #[error("placement failed: {0}")]
    Placement(#[from] tessera_types::ResolveError),

    #[error("no usable topology yet")]
    NoTopology,
}

pub type ClientResult<T> = Result<T, ClientError>;
