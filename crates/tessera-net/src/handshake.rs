//! The connection handshake.
//!
//! 1. Both sides write `Hello{product, version, is_client}` in plain
//!    text and verify byte-equality of product and version.
//! 2. TLS is established (mutual certificates signed by the cluster
//!    root).
//! 3. Server peers exchange `HelloServerFromServer` and validate
//!    identity; client peers are matched by certificate fingerprint and
//!    receive `HelloClientFromServer` with their namespace and roots.

use std::io::{Read, Write};

use sha2::{Digest, Sha256};
use tracing::debug;

use tessera_types::{BootCount, ClusterUUId, Fingerprint, RMId};
use tessera_wire::{
    FrameDecoder, FrameEncoder, FramingError, Hello, HelloServerFromServer, PRODUCT_NAME,
    PRODUCT_VERSION,
};

/// Errors raised during the handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("product mismatch: peer sent {0:?}")]
    ProductMismatch(String),

    #[error("version mismatch: peer sent {0:?}")]
    VersionMismatch(String),

    #[error("cluster id mismatch: ours {ours:?}, theirs {theirs:?}")]
    ClusterIdMismatch { ours: String, theirs: String },

    #[error("cluster uuid mismatch: ours {ours}, theirs {theirs}")]
    ClusterUUIdMismatch {
        ours: ClusterUUId,
        theirs: ClusterUUId,
    },

    #[error("peer {0} has been removed from the cluster")]
    RMRemoved(RMId),

    #[error("peer presents our own RMId {0}")]
    IdentityCollision(RMId),

    #[error("client certificate fingerprint not recognised")]
    UnknownFingerprint,
}

impl HandshakeError {
    /// Protocol violations are fatal to the connection (no restart);
    /// transport hiccups are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            HandshakeError::Io(_) | HandshakeError::Framing(FramingError::Io(_))
        )
    }
}

// ============================================================================
// Frame helpers
// ============================================================================

/// Writes one framed record.
pub fn write_record<S: Write, T: serde::Serialize>(
    stream: &mut S,
    record: &T,
) -> Result<(), HandshakeError> {
    let encoder = FrameEncoder::new();
    encoder.encode_to(record, stream)?;
    stream.flush()?;
    Ok(())
}

/// Blocks until one framed record arrives.
pub fn read_record<S: Read, T: serde::de::DeserializeOwned>(
    stream: &mut S,
) -> Result<T, HandshakeError> {
    let mut decoder: FrameDecoder<T> = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(record) = decoder.decode()? {
            return Ok(record);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            decoder.finish()?;
            return Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            )));
        }
        decoder.extend(&buf[..n]);
    }
}

// ============================================================================
// Hello exchange
// ============================================================================

/// Sends our hello, reads the peer's, verifies product and version
/// byte-for-byte. Returns the peer's hello (its `is_client` selects the
/// follow-up).
pub fn exchange_hello<S: Read + Write>(
    stream: &mut S,
    is_client: bool,
) -> Result<Hello, HandshakeError> {
    write_record(stream, &Hello::new(PRODUCT_NAME, PRODUCT_VERSION, is_client))?;
    let theirs: Hello = read_record(stream)?;
    if theirs.product.as_bytes() != PRODUCT_NAME.as_bytes() {
        return Err(HandshakeError::ProductMismatch(theirs.product));
    }
    if theirs.version.as_bytes() != PRODUCT_VERSION.as_bytes() {
        return Err(HandshakeError::VersionMismatch(theirs.version));
    }
    Ok(theirs)
}

// ============================================================================
// Server-peer identity
// ============================================================================

/// The validated identity of a server peer.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub rm_id: RMId,
    pub boot_count: BootCount,
    pub cluster_uuid: ClusterUUId,
    pub host: String,

    /// XOR of both sides' random nonces; identical on both ends, used
    /// to break dial races and order competing proposers.
    pub combined_tie_break: u32,
}

/// Exchanges `HelloServerFromServer` inside TLS and validates the peer
/// against our view of the cluster.
pub fn exchange_server_hello<S: Read + Write>(
    stream: &mut S,
    ours: &HelloServerFromServer,
    rms_removed: impl Fn(RMId) -> bool,
) -> Result<PeerIdentity, HandshakeError> {
    write_record(stream, ours)?;
    let theirs: HelloServerFromServer = read_record(stream)?;

    if theirs.rm_id == ours.rm_id {
        return Err(HandshakeError::IdentityCollision(theirs.rm_id));
    }
    if rms_removed(theirs.rm_id) {
        return Err(HandshakeError::RMRemoved(theirs.rm_id));
    }
    if theirs.cluster_id != ours.cluster_id {
        return Err(HandshakeError::ClusterIdMismatch {
            ours: ours.cluster_id.clone(),
            theirs: theirs.cluster_id,
        });
    }
    if ours.cluster_uuid.is_set()
        && theirs.cluster_uuid.is_set()
        && ours.cluster_uuid != theirs.cluster_uuid
    {
        return Err(HandshakeError::ClusterUUIdMismatch {
            ours: ours.cluster_uuid,
            theirs: theirs.cluster_uuid,
        });
    }

    debug!(peer = %theirs.rm_id, host = %theirs.local_host, "server handshake complete");
    Ok(PeerIdentity {
        rm_id: theirs.rm_id,
        boot_count: theirs.boot_count,
        cluster_uuid: theirs.cluster_uuid,
        host: theirs.local_host,
        combined_tie_break: ours.tie_break ^ theirs.tie_break,
    })
}

/// Decides whether *our outbound dial* survives a dial race against an
/// incoming connection from the same peer.
///
/// Both ends compute the same winner: the higher boot count's dial is
/// preferred; equal boot counts fall back to the combined tiebreak's
/// parity selecting the lower or higher RMId.
pub fn dial_survives(
    local: (RMId, BootCount),
    remote: (RMId, BootCount),
    combined_tie_break: u32,
) -> bool {
    let winner = if local.1 != remote.1 {
        if local.1 > remote.1 {
            local.0
        } else {
            remote.0
        }
    } else if combined_tie_break & 1 == 0 {
        local.0.min(remote.0)
    } else {
        local.0.max(remote.0)
    };
    winner == local.0
}

// ============================================================================
// Client fingerprints
// ============================================================================

/// SHA-256 fingerprint of a client certificate (DER bytes), matched
/// against the topology's account table.
pub fn client_fingerprint(cert_der: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(cert_der);
    Fingerprint::from_bytes(digest.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// An in-memory full-duplex stub: reads from one buffer, writes to
    /// another.
    struct Pipe {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn pipe_with<T: serde::Serialize>(record: &T) -> Pipe {
        let encoder = FrameEncoder::new();
        Pipe {
            input: Cursor::new(encoder.encode(record).expect("encode")),
            output: Vec::new(),
        }
    }

    #[test]
    fn hello_roundtrip_and_version_check() {
        let good = Hello::new(PRODUCT_NAME, PRODUCT_VERSION, false);
        let mut pipe = pipe_with(&good);
        let theirs = exchange_hello(&mut pipe, false).expect("handshake");
        assert!(!theirs.is_client);

        let bad = Hello::new(PRODUCT_NAME, "999.0.0", false);
        let mut pipe = pipe_with(&bad);
        let err = exchange_hello(&mut pipe, false).expect_err("version mismatch");
        assert!(matches!(err, HandshakeError::VersionMismatch(_)));
        assert!(err.is_fatal());
    }

    fn server_hello(rm: u32, cluster_uuid: u64, tie_break: u32) -> HelloServerFromServer {
        HelloServerFromServer {
            local_host: format!("node{rm}:7578"),
            rm_id: RMId::new(rm),
            boot_count: BootCount::new(1),
            cluster_id: "test".into(),
            cluster_uuid: ClusterUUId::new(cluster_uuid),
            tie_break,
        }
    }

    #[test]
    fn server_identity_checks() {
        let ours = server_hello(1, 7, 0b1010);

        // Healthy peer.
        let mut pipe = pipe_with(&server_hello(2, 7, 0b0110));
        let id = exchange_server_hello(&mut pipe, &ours, |_| false).expect("ok");
        assert_eq!(id.rm_id, RMId::new(2));
        assert_eq!(id.combined_tie_break, 0b1100);

        // Removed peer.
        let mut pipe = pipe_with(&server_hello(2, 7, 0));
        let err = exchange_server_hello(&mut pipe, &ours, |rm| rm == RMId::new(2))
            .expect_err("removed");
        assert!(matches!(err, HandshakeError::RMRemoved(_)));

        // Cluster uuid conflict (both non-zero).
        let mut pipe = pipe_with(&server_hello(2, 9, 0));
        let err = exchange_server_hello(&mut pipe, &ours, |_| false).expect_err("uuid");
        assert!(matches!(err, HandshakeError::ClusterUUIdMismatch { .. }));

        // An unset peer uuid is fine (it has not bootstrapped yet).
        let mut pipe = pipe_with(&server_hello(2, 0, 0));
        assert!(exchange_server_hello(&mut pipe, &ours, |_| false).is_ok());

        // Identity collision.
        let mut pipe = pipe_with(&server_hello(1, 7, 0));
        let err = exchange_server_hello(&mut pipe, &ours, |_| false).expect_err("collision");
        assert!(matches!(err, HandshakeError::IdentityCollision(_)));
    }

    #[test]
    fn dial_race_resolution_is_symmetric() {
        let a = (RMId::new(1), BootCount::new(1));
        let b = (RMId::new(2), BootCount::new(1));

        for tie in [0u32, 1, 2, 3] {
            let a_survives = dial_survives(a, b, tie);
            let b_survives = dial_survives(b, a, tie);
            assert_ne!(a_survives, b_survives, "exactly one dial survives");
        }

        // Higher boot count wins regardless of parity.
        let restarted = (RMId::new(2), BootCount::new(5));
        assert!(!dial_survives(a, restarted, 0));
        assert!(dial_survives(restarted, a, 0));
    }

    #[test]
    fn fingerprints_are_stable() {
        let fp1 = client_fingerprint(b"certificate-bytes");
        let fp2 = client_fingerprint(b"certificate-bytes");
        let fp3 = client_fingerprint(b"other-bytes");
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, fp3);
    }
}
