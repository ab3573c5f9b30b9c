//! # tessera-wire: Wire messages and framing for Tessera
//!
//! Every peer link carries length-prefixed framed records; each record
//! is a bincode-serialized tagged union, checksummed with CRC32.
//!
//! - [`Hello`] and its follow-ups drive the handshake
//! - [`Message`] is the server-to-server union
//! - [`ClientMessage`] is the client-facing union
//! - [`FrameEncoder`]/[`FrameDecoder`] implement the codec

pub mod frame;
pub mod message;

pub use frame::{FrameDecoder, FrameEncoder, FramingError, HEADER_SIZE};
pub use message::{
    ClientMessage, ClientOutcome, ClientRoot, ClientTxn, Hello, HelloClientFromServer,
    HelloServerFromServer, Message, MigrationBatch, MigrationElement, OneATxnVotes, OneBTxnVotes,
    Promise, RoundNumber, TwoATxnVotes, TwoBTxnVotes,
};

/// Product name exchanged (and byte-compared) during the handshake.
pub const PRODUCT_NAME: &str = "tessera";

/// Product version exchanged (and byte-compared) during the handshake.
pub const PRODUCT_VERSION: &str = env!("CARGO_PKG_VERSION");
