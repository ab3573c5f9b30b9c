//! Client sessions.
//!
//! One session per connected client: the factory matches the client
//! certificate fingerprint against the topology's account table,
//! answers with the client's namespace and roots, then pumps
//! `ClientMessage` frames between the socket and the session's
//! submitter.

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use tessera_engine::{Mailbox, MailboxReceiver, TryRecv};
use tessera_net::{ClientAcceptor, ConnectionManagerHandle, Duplex, HEARTBEAT_INTERVAL};
use tessera_types::{Capability, ConnectionCount, Fingerprint, Topology};
use tessera_wire::{
    ClientMessage, ClientRoot, FrameDecoder, FrameEncoder, HelloClientFromServer,
};

use crate::submitter::Submitter;

/// Builds sessions for handshaken client streams.
pub struct ClientSession {
    mgr: ConnectionManagerHandle,
    topology: Arc<RwLock<Option<Topology>>>,
    next_connection: AtomicU32,
}

impl ClientSession {
    pub fn factory(
        mgr: ConnectionManagerHandle,
        topology: Arc<RwLock<Option<Topology>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mgr,
            topology,
            next_connection: AtomicU32::new(1),
        })
    }

    /// Resolves the roots this fingerprint may reach.
    fn roots_for(&self, fingerprint: &Fingerprint) -> Option<Vec<ClientRoot>> {
        let guard = self.topology.read().expect("lock");
        let topology = guard.as_ref()?;
        let names = topology.config.fingerprints.get(fingerprint)?;
        let roots = topology
            .roots
            .iter()
            .filter(|root| names.contains(&root.name))
            .map(|root| ClientRoot {
                name: root.name.clone(),
                var: root.var,
                positions: root.positions.clone(),
                capability: Capability::read_write_all(),
            })
            .collect();
        Some(roots)
    }
}

impl ClientAcceptor for ClientSession {
    fn accept_client(&self, conn_id: u64, mut stream: Box<dyn Duplex>, fingerprint: Fingerprint) {
        let Some(roots) = self.roots_for(&fingerprint) else {
            info!(?fingerprint, "client fingerprint not recognised; closing");
            return;
        };

        let connection_count =
            ConnectionCount::new(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let hello = HelloClientFromServer {
            connection_count,
            boot_count: self.mgr.boot_count(),
            rm_id: self.mgr.rm_id(),
            roots: roots.clone(),
        };

        let encoder: FrameEncoder<HelloClientFromServer> = FrameEncoder::new();
        if encoder.encode_to(&hello, &mut stream).is_err() {
            return;
        }

        let Some(submitter) = Submitter::spawn(&self.mgr, connection_count, &roots) else {
            // Admission gated: not enough flushed servers yet.
            warn!("client rejected: cluster not ready");
            return;
        };

        let (outbound_tx, outbound_rx) =
            Mailbox::<ClientMessage>::new(format!("client-{}", connection_count.as_u32()), 256);
        let mgr = self.mgr.clone();
        thread::Builder::new()
            .name(format!("client-{}", connection_count.as_u32()))
            .spawn(move || {
                let result = pump(&mut stream, &outbound_tx, outbound_rx, &submitter);
                if let Err(e) = result {
                    debug!(conn = conn_id, error = %e, "client session ended");
                }
                submitter.stop();
                mgr.client_lost(connection_count);
            })
            .expect("spawn client session");
    }
}

/// The session loop: reads submissions, writes outcomes, keeps the
/// heartbeat alive. Same two-window liveness rule as peer links.
fn pump(
    stream: &mut Box<dyn Duplex>,
    outbound_tx: &Mailbox<ClientMessage>,
    outbound_rx: MailboxReceiver<ClientMessage>,
    submitter: &crate::submitter::SubmitterHandle,
) -> Result<(), tessera_wire::FramingError> {
    let encoder: FrameEncoder<ClientMessage> = FrameEncoder::new();
    let mut decoder: FrameDecoder<ClientMessage> = FrameDecoder::new();
    let mut buf = [0u8; 16 * 1024];
    let mut last_received = Instant::now();
    let mut last_sent = Instant::now();

    loop {
        loop {
            match outbound_rx.try_recv() {
                TryRecv::Item(msg) => {
                    encoder.encode_to(&msg, stream)?;
                    last_sent = Instant::now();
                }
                TryRecv::Empty => break,
                TryRecv::Closed => return Ok(()),
            }
        }

        if last_sent.elapsed() >= HEARTBEAT_INTERVAL {
            encoder.encode_to(&ClientMessage::Heartbeat, stream)?;
            last_sent = Instant::now();
        }
        if last_received.elapsed() > 2 * HEARTBEAT_INTERVAL {
            return Err(tessera_wire::FramingError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "client heartbeat timeout",
            )));
        }

        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                last_received = Instant::now();
                decoder.extend(&buf[..n]);
                while let Some(msg) = decoder.decode()? {
                    match msg {
                        ClientMessage::Heartbeat => {}
                        ClientMessage::ClientTxnSubmission(client_txn) => {
                            let tx = outbound_tx.clone();
                            submitter.submit(
                                client_txn,
                                Box::new(move |outcome| {
                                    tx.send(ClientMessage::ClientTxnOutcome(outcome));
                                }),
                            );
                        }
                        ClientMessage::ClientTxnOutcome(_) => {
                            // Clients do not send outcomes.
                            return Err(tessera_wire::FramingError::Deserialize(
                                "unexpected outcome from client".to_string(),
                            ));
                        }
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
}
