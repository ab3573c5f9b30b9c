//! Peer connection actors.
//!
//! Each peer link runs on its own thread as a four-state machine:
//!
//! ```text
//! Delay → Dial → Handshake → Run
//!   ↑______________________________|   (recoverable failure)
//! ```
//!
//! Outbound dialers loop through the machine with a jittered restart
//! delay; incoming connections enter at Handshake and are never
//! restarted (the remote end redials). Fatal conditions — protocol
//! violations, identity conflicts, removal from the cluster — terminate
//! the machine outright.
//!
//! Inside Run the thread is the connection's single writer: mailbox
//! sends, heartbeats, and inbound dispatch are all serialized here, so
//! per-connection send order is preserved by construction.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustls::pki_types::ServerName;
use rustls::StreamOwned;
use tracing::{debug, info, warn};

use tessera_engine::{Mailbox, MailboxReceiver, RecvTimeout, TryRecv};
use tessera_types::RMId;
use tessera_wire::{FrameDecoder, FrameEncoder, Message};

use crate::handshake::{exchange_hello, exchange_server_hello, PeerIdentity};
use crate::manager::ConnectionManagerHandle;
use crate::tls::NodeTls;
use crate::{NetError, NetResult, RESTART_DELAY_MIN, RESTART_DELAY_RANGE_MS};

/// Heartbeat period; a connection is failed after two silent windows.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Socket read timeout inside Run: paces the mailbox drain.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Depth of a connection's outbound mailbox.
const MAILBOX_DEPTH: usize = 1024;

/// Any owned full-duplex byte stream.
pub trait Duplex: Read + Write + Send {}
impl<T: Read + Write + Send> Duplex for T {}

// ============================================================================
// Handle
// ============================================================================

/// The outside world's grip on a connection: enqueue sends, request
/// shutdown.
#[derive(Clone)]
pub struct ConnectionHandle {
    mailbox: Mailbox<Message>,
    pub conn_id: u64,
}

impl ConnectionHandle {
    pub fn shutdown(&self) {
        self.mailbox.close();
    }
}

impl tessera_paxos::PeerSender for ConnectionHandle {
    /// Rotate-and-continue: a full mailbox evicts its oldest queued
    /// message to admit this one; only a closed connection refuses.
    fn send(&self, msg: Message) -> bool {
        self.mailbox.send(msg)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One peer link's state machine. Owned by its thread.
pub struct Connection {
    conn_id: u64,
    remote_host: String,
    mgr: ConnectionManagerHandle,
    tls: Arc<NodeTls>,
    mailbox: MailboxReceiver<Message>,
    handle: ConnectionHandle,
    rng: StdRng,
}

impl Connection {
    /// Spawns an outbound dialer to `remote_host`. The machine restarts
    /// itself until shut down or fatally rejected.
    pub fn spawn_dialer(
        conn_id: u64,
        remote_host: String,
        mgr: ConnectionManagerHandle,
        tls: Arc<NodeTls>,
    ) -> ConnectionHandle {
        let (tx, mailbox) = Mailbox::new(format!("conn-{remote_host}"), MAILBOX_DEPTH);
        let handle = ConnectionHandle { mailbox: tx, conn_id };
        let thread_handle = handle.clone();
        let host = remote_host.clone();
        thread::Builder::new()
            .name(format!("conn-dial-{host}"))
            .spawn(move || {
                let mut conn = Connection {
                    conn_id,
                    remote_host,
                    mgr,
                    tls,
                    mailbox,
                    handle: thread_handle,
                    rng: StdRng::from_entropy(),
                };
                conn.dialer_machine();
            })
            .expect("spawn dialer thread");
        handle
    }

    /// Spawns the handler for one accepted server-peer stream (the
    /// hello has already been read and matched). Never restarted.
    pub fn spawn_incoming(
        conn_id: u64,
        stream: TcpStream,
        mgr: ConnectionManagerHandle,
        tls: Arc<NodeTls>,
    ) -> ConnectionHandle {
        let (tx, mailbox) = Mailbox::new(format!("conn-in-{conn_id}"), MAILBOX_DEPTH);
        let handle = ConnectionHandle { mailbox: tx, conn_id };
        let thread_handle = handle.clone();
        thread::Builder::new()
            .name("conn-incoming".to_string())
            .spawn(move || {
                let mut conn = Connection {
                    conn_id,
                    remote_host: String::new(),
                    mgr,
                    tls,
                    mailbox,
                    handle: thread_handle,
                    rng: StdRng::from_entropy(),
                };
                if let Err(e) = conn.run_incoming(stream) {
                    info!(error = %e, "incoming connection ended");
                }
            })
            .expect("spawn incoming thread");
        handle
    }

    // ------------------------------------------------------------------
    // Dialer machine
    // ------------------------------------------------------------------

    fn dialer_machine(&mut self) {
        let mut first = true;
        loop {
            // Delay
            if !first {
                let jitter = Duration::from_millis(self.rng.gen_range(0..RESTART_DELAY_RANGE_MS));
                let delay = RESTART_DELAY_MIN + jitter;
                debug!(host = %self.remote_host, ?delay, "delaying before redial");
                // Shutdown cuts the delay short; a message queued for
                // the dead link is discarded (its sender will repeat).
                match self.mailbox.recv_timeout(delay) {
                    RecvTimeout::Closed => return,
                    RecvTimeout::Item(_) | RecvTimeout::Timeout => {}
                }
            }
            first = false;

            match self.dial_and_run() {
                Ok(()) => return, // clean shutdown
                Err(e) if e.is_fatal() => {
                    warn!(host = %self.remote_host, error = %e, "connection fatally rejected");
                    return;
                }
                Err(e) => {
                    info!(host = %self.remote_host, error = %e, "connection lost; will redial");
                }
            }
        }
    }

    /// Dial → Handshake → Run for one attempt.
    fn dial_and_run(&mut self) -> NetResult<()> {
        // Dial
        let tcp = TcpStream::connect(&self.remote_host)?;
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        // Plaintext hello: servers never dial clients.
        let mut tcp = tcp;
        let theirs = exchange_hello(&mut tcp, false)?;
        if theirs.is_client {
            return Err(NetError::Protocol(
                "dialed peer presented itself as a client".to_string(),
            ));
        }

        // TLS (dial side).
        let server_name = self.server_name()?;
        let tls_conn = self.tls.client_connection(server_name)?;
        let mut stream = StreamOwned::new(tls_conn, tcp);

        // Identity exchange.
        let ours = self.mgr.server_hello(self.rng.gen::<u32>());
        let rms_removed = self.mgr.rms_removed();
        let identity =
            exchange_server_hello(&mut stream, &ours, |rm| rms_removed.contains(&rm))?;

        self.run_server_peer(Box::new(stream), identity, true)
    }

    fn server_name(&self) -> NetResult<ServerName<'static>> {
        let host = self
            .remote_host
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&self.remote_host);
        ServerName::try_from(host.to_string())
            .map_err(|e| NetError::Protocol(format!("bad dial host {host:?}: {e}")))
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    fn run_incoming(&mut self, tcp: TcpStream) -> NetResult<()> {
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let mut tcp = tcp;
        let theirs = exchange_hello(&mut tcp, false)?;

        let tls_conn = self.tls.server_connection()?;
        let mut stream = StreamOwned::new(tls_conn, tcp);

        if theirs.is_client {
            // Complete the TLS handshake so the client certificate is
            // available, then hand the session to the client layer.
            while stream.conn.is_handshaking() {
                stream.conn.complete_io(&mut stream.sock)?;
            }
            let fingerprint = stream
                .conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| crate::handshake::client_fingerprint(cert.as_ref()))
                .ok_or_else(|| {
                    NetError::Protocol("client presented no certificate".to_string())
                })?;
            self.mgr
                .accept_client(self.conn_id, Box::new(stream), fingerprint);
            return Ok(());
        }

        let ours = self.mgr.server_hello(self.rng.gen::<u32>());
        let rms_removed = self.mgr.rms_removed();
        let identity =
            exchange_server_hello(&mut stream, &ours, |rm| rms_removed.contains(&rm))?;
        self.run_server_peer(Box::new(stream), identity, false)
    }

    // ------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------

    fn run_server_peer(
        &mut self,
        mut stream: Box<dyn Duplex>,
        identity: PeerIdentity,
        dialed: bool,
    ) -> NetResult<()> {
        // Registration can reject us: a competing connection to the
        // same RM won the tiebreak.
        if !self
            .mgr
            .server_established(self.handle.clone(), identity.clone(), dialed)
        {
            debug!(peer = %identity.rm_id, "lost dial race; closing");
            return Err(NetError::Protocol("lost dial race".to_string()));
        }

        let result = self.pump(&mut stream, identity.rm_id);
        let restarting = match &result {
            Err(e) if e.is_fatal() => false,
            Err(_) => dialed,
            Ok(()) => false,
        };
        self.mgr
            .server_lost(self.conn_id, identity.rm_id, restarting);
        result
    }

    /// The Run loop: drain the mailbox, keep heartbeats flowing, decode
    /// inbound frames, dispatch.
    fn pump(&mut self, stream: &mut Box<dyn Duplex>, remote: RMId) -> NetResult<()> {
        let encoder: FrameEncoder<Message> = FrameEncoder::new();
        let mut decoder: FrameDecoder<Message> = FrameDecoder::new();
        let mut buf = [0u8; 16 * 1024];
        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();

        loop {
            // Outbound.
            loop {
                match self.mailbox.try_recv() {
                    TryRecv::Item(msg) => {
                        encoder.encode_to(&msg, stream)?;
                        last_sent = Instant::now();
                    }
                    TryRecv::Empty => break,
                    TryRecv::Closed => return Ok(()),
                }
            }

            // Heartbeats.
            if last_sent.elapsed() >= HEARTBEAT_INTERVAL {
                encoder.encode_to(&Message::Heartbeat, stream)?;
                last_sent = Instant::now();
            }
            if last_received.elapsed() > 2 * HEARTBEAT_INTERVAL {
                return Err(NetError::HeartbeatTimeout);
            }

            // Inbound.
            match stream.read(&mut buf) {
                Ok(0) => {
                    return Err(NetError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed",
                    )))
                }
                Ok(n) => {
                    last_received = Instant::now();
                    decoder.extend(&buf[..n]);
                    while let Some(msg) = decoder.decode()? {
                        match msg {
                            Message::Heartbeat => {}
                            Message::ConnectionError(e) => {
                                return Err(NetError::Protocol(e));
                            }
                            msg => self.mgr.dispatch_message(remote, msg),
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(NetError::Io(e)),
            }
        }
    }
}
