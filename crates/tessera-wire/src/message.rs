//! Protocol messages.
//!
//! Three families share the framed transport:
//!
//! - **Handshake**: [`Hello`] then either [`HelloServerFromServer`] or
//!   [`HelloClientFromServer`], depending on `is_client`.
//! - **Server ↔ server**: [`Message`] — transaction submission, the
//!   Paxos votes (1A/1B/2A/2B), the completion acknowledgements
//!   (TLC/TGC/TSC), topology gossip, and migration streams.
//! - **Server ↔ client**: [`ClientMessage`].

use serde::{Deserialize, Serialize};

use tessera_types::{
    Action, BootCount, Capability, ClusterUUId, Configuration, ConnectionCount, Outcome,
    Positions, RMId, TxnId, VarRecord, VarUUId,
};

// ============================================================================
// Handshake
// ============================================================================

/// First record on every connection, sent by both sides in plaintext.
///
/// Product and version must match byte-for-byte or the connection is
/// torn down before TLS is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub product: String,
    pub version: String,
    pub is_client: bool,
}

impl Hello {
    pub fn new(product: &str, version: &str, is_client: bool) -> Self {
        Self {
            product: product.to_string(),
            version: version.to_string(),
            is_client,
        }
    }

    /// Byte-equality check of product and version.
    pub fn matches(&self, product: &str, version: &str) -> bool {
        self.product.as_bytes() == product.as_bytes()
            && self.version.as_bytes() == version.as_bytes()
    }
}

/// Identity exchange between two server peers, inside TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloServerFromServer {
    pub local_host: String,
    pub rm_id: RMId,
    pub boot_count: BootCount,
    pub cluster_id: String,
    pub cluster_uuid: ClusterUUId,

    /// Random nonce; XOR of both sides' nonces breaks dial races.
    pub tie_break: u32,
}

/// A root var granted to a client at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRoot {
    pub name: String,
    pub var: VarUUId,
    pub positions: Positions,
    pub capability: Capability,
}

/// Server → client handshake completion.
///
/// The namespace triple prefixes every TxnId and VarUUId the client
/// generates, guaranteeing cluster-wide uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloClientFromServer {
    pub connection_count: ConnectionCount,
    pub boot_count: BootCount,
    pub rm_id: RMId,
    pub roots: Vec<ClientRoot>,
}

// ============================================================================
// Paxos rounds
// ============================================================================

/// A Paxos round number for one instance.
///
/// Ordering is `(round, tie_break, rm_id)`: concurrent proposers for the
/// same instance are separated by the handshake tiebreak before falling
/// back to identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RoundNumber {
    pub round: u32,
    pub tie_break: u32,
    pub rm_id: RMId,
}

impl RoundNumber {
    pub fn new(round: u32, tie_break: u32, rm_id: RMId) -> Self {
        Self {
            round,
            tie_break,
            rm_id,
        }
    }

    /// The next round with the same identity.
    pub fn next(&self) -> Self {
        Self {
            round: self.round.saturating_add(1),
            ..*self
        }
    }

    /// Round zero: phase 1 may be skipped for it by a sole first
    /// proposer.
    pub fn is_first(&self) -> bool {
        self.round == 0
    }
}

/// 1A: a proposer asks the acceptors to promise a round for one
/// instance of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneATxnVotes {
    pub txn_id: TxnId,

    /// The instance this proposal drives (the RM whose votes are being
    /// decided, not necessarily the sender).
    pub instance_rm_id: RMId,

    pub round_number: RoundNumber,
}

/// One var's answer inside a 1B.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Promise {
    /// Nothing accepted yet; the proposer may choose freely.
    FreeChoice,

    /// A ballot was accepted in an earlier round; the proposer must
    /// carry it forward.
    Accepted {
        round_number: RoundNumber,
        ballot: tessera_types::Ballot,
    },

    /// The request's round was below an existing promise.
    RoundNumberTooLow { promised: RoundNumber },
}

/// 1B: an acceptor's promises for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneBTxnVotes {
    pub txn_id: TxnId,
    pub instance_rm_id: RMId,
    pub round_number: RoundNumber,
    pub promises: Vec<(VarUUId, Promise)>,
}

/// 2A: a proposer submits ballots for one instance.
///
/// Carries the whole transaction so an acceptor that never saw the
/// submission can still participate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoATxnVotes {
    pub txn: tessera_types::Txn,
    pub instance_rm_id: RMId,
    pub round_number: RoundNumber,
    pub ballots: Vec<tessera_types::Ballot>,
}

/// 2B: either a decided outcome or per-var round failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoBTxnVotes {
    /// The acceptor's accumulated outcome for the txn.
    Outcome {
        txn: tessera_types::Txn,
        outcome: Outcome,
    },

    /// The 2A lost to higher promises; the proposer must retry those
    /// vars at a higher round.
    Failures {
        txn_id: TxnId,
        instance_rm_id: RMId,
        failures: Vec<(VarUUId, RoundNumber)>,
    },
}

// ============================================================================
// Migration
// ============================================================================

/// One emigrated var: its record plus the txn that wrote its frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationElement {
    pub record: VarRecord,
    pub txn: tessera_types::Txn,
}

/// A batch of emigrated vars for one topology version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationBatch {
    pub version: u32,
    pub elements: Vec<MigrationElement>,
}

// ============================================================================
// Server message union
// ============================================================================

/// The server-to-server message union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Heartbeat,
    ConnectionError(String),
    TxnSubmission(tessera_types::Txn),
    SubmissionOutcome {
        txn: tessera_types::Txn,
        outcome: Outcome,
    },
    SubmissionComplete(TxnId),
    SubmissionAbort(TxnId),
    OneATxnVotes(OneATxnVotes),
    OneBTxnVotes(OneBTxnVotes),
    TwoATxnVotes(TwoATxnVotes),
    TwoBTxnVotes(TwoBTxnVotes),
    TxnLocallyComplete(TxnId),
    TxnGloballyComplete(TxnId),
    TopologyChangeRequest(Configuration),
    Migration(MigrationBatch),
    MigrationComplete {
        version: u32,
    },
    Flushed,
}

impl Message {
    /// A human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Heartbeat => "Heartbeat",
            Message::ConnectionError(_) => "ConnectionError",
            Message::TxnSubmission(_) => "TxnSubmission",
            Message::SubmissionOutcome { .. } => "SubmissionOutcome",
            Message::SubmissionComplete(_) => "SubmissionComplete",
            Message::SubmissionAbort(_) => "SubmissionAbort",
            Message::OneATxnVotes(_) => "OneATxnVotes",
            Message::OneBTxnVotes(_) => "OneBTxnVotes",
            Message::TwoATxnVotes(_) => "TwoATxnVotes",
            Message::TwoBTxnVotes(_) => "TwoBTxnVotes",
            Message::TxnLocallyComplete(_) => "TxnLocallyComplete",
            Message::TxnGloballyComplete(_) => "TxnGloballyComplete",
            Message::TopologyChangeRequest(_) => "TopologyChangeRequest",
            Message::Migration(_) => "Migration",
            Message::MigrationComplete { .. } => "MigrationComplete",
            Message::Flushed => "Flushed",
        }
    }
}

// ============================================================================
// Client message union
// ============================================================================

/// A client-submitted transaction: actions only, no allocations.
///
/// The serving RM turns this into a full [`tessera_types::Txn`] by
/// resolving each var's replicas and allocating action indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTxn {
    pub id: TxnId,
    pub retry: bool,
    pub actions: Vec<Action>,
}

/// The outcome delivered back to a client.
///
/// `final_txn_id` differs from `txn_id` when the submitter resubmitted
/// internally; the client correlates on the original id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOutcome {
    pub txn_id: TxnId,
    pub final_txn_id: TxnId,
    pub outcome: Outcome,
}

/// The client-facing message union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Heartbeat,
    ClientTxnSubmission(ClientTxn),
    ClientTxnOutcome(ClientOutcome),
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Heartbeat => "Heartbeat",
            ClientMessage::ClientTxnSubmission(_) => "ClientTxnSubmission",
            ClientMessage::ClientTxnOutcome(_) => "ClientTxnOutcome",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_byte_equality() {
        let hello = Hello::new("tessera", "0.1.0", false);
        assert!(hello.matches("tessera", "0.1.0"));
        assert!(!hello.matches("tessera", "0.1.1"));
        assert!(!hello.matches("Tessera", "0.1.0"));
    }

    #[test]
    fn round_number_ordering() {
        let a = RoundNumber::new(1, 5, RMId::new(1));
        let b = RoundNumber::new(2, 0, RMId::new(1));
        let c = RoundNumber::new(1, 6, RMId::new(1));
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert_eq!(a.next().round, 2);
        assert!(RoundNumber::new(0, 9, RMId::new(2)).is_first());
    }

    #[test]
    fn message_names() {
        assert_eq!(Message::Heartbeat.name(), "Heartbeat");
        assert_eq!(Message::Flushed.name(), "Flushed");
        assert_eq!(
            Message::TxnLocallyComplete(TxnId::ZERO).name(),
            "TxnLocallyComplete"
        );
        assert_eq!(ClientMessage::Heartbeat.name(), "Heartbeat");
    }
}
