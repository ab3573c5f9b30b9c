//! # tessera-topology: Online reconfiguration
//!
//! The topology transmogrifier drives cluster configuration change as
//! an ordered sequence of guarded tasks:
//!
//! ```text
//! Targetless → InstallTargetOld → InstallTargetNew → JoinCluster
//!            → Quiet (stages 0–3) → Migrate → InstallCompletion
//! ```
//!
//! Each task validates its preconditions against the active topology,
//! performs its step (usually a topology transaction through the local
//! connection, or a barrier acknowledged by the connection manager's
//! subscriber machinery), and hands over to the next. A newer target
//! preempts the current task; preemption is idempotent.

pub mod migration;
pub mod transmogrifier;

pub use migration::{emigration_batches, immigrate};
pub use transmogrifier::{
    ShutdownSignaller, Transmogrifier, TransmogrifierHandle, MIGRATION_BATCH_SIZE,
};

use tessera_types::RMId;

/// Errors raised by reconfiguration.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("config would change cluster id from {current:?} to {proposed:?}")]
    ClusterIdChange { current: String, proposed: String },

    #[error("config would change cluster uuid")]
    ClusterUUIdChange,

    #[error("changes to max-rm-count are not supported")]
    MaxRMCountChange,

    #[error("config version {proposed} is not above {current}")]
    VersionNotIncreased { current: u32, proposed: u32 },

    #[error("config changed but version did not increase ({0})")]
    ContentChangedVersionDidNot(u32),

    #[error("we ({0}) have been removed from the cluster")]
    RemovedFromCluster(RMId),

    #[error("store error: {0}")]
    Store(#[from] tessera_store::StoreError),
}

pub type TopologyResult<T> = Result<T, TopologyError>;
