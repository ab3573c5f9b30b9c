//! # tessera-net: The connection subsystem
//!
//! Peer links are mutually authenticated TLS streams carrying framed
//! records. Each link is an actor walking `Delay → Dial → Handshake →
//! Run`, restarting with jittered backoff after recoverable failures.
//! The process-wide [`ConnectionManager`] owns the desired-peer set,
//! dials missing peers, brokers topology and peer-availability
//! subscriptions, and routes inbound wire messages to the proposer,
//! acceptor, and topology layers.

pub mod connection;
pub mod handshake;
pub mod manager;
pub mod tls;

pub use connection::{Connection, ConnectionHandle, Duplex, HEARTBEAT_INTERVAL};
pub use handshake::{client_fingerprint, HandshakeError, PeerIdentity};
pub use manager::{
    ClientAcceptor, ClientConnection, ClientTxnMetrics, ConnectionManager,
    ConnectionManagerHandle, TopologyCallbacks, TopologyEventSink, TopologySubscriber,
};
pub use tls::{NodeTls, TlsError};

use std::time::Duration;

/// Minimum delay before a connection restart.
pub const RESTART_DELAY_MIN: Duration = Duration::from_secs(3);

/// Width of the uniform jitter added to the restart delay.
pub const RESTART_DELAY_RANGE_MS: u64 = 5000;

/// Errors raised by the connection subsystem.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("framing error: {0}")]
    Framing(#[from] tessera_wire::FramingError),

    /// Two heartbeat windows elapsed with no inbound traffic.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Protocol violation: fatal to the connection, no restart.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl NetError {
    /// True when the connection must not be restarted (protocol
    /// violations, identity conflicts). Transient I/O restarts.
    pub fn is_fatal(&self) -> bool {
        match self {
            NetError::Protocol(_) => true,
            NetError::Handshake(e) => e.is_fatal(),
            NetError::Framing(e) => e.is_fatal(),
            NetError::Io(_) | NetError::Tls(_) | NetError::HeartbeatTimeout => false,
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
