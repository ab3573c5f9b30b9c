//! The connection-manager registry.
//!
//! A process-wide actor owning the desired-peer set. It starts dialers
//! for missing peers, arbitrates dial races, keeps the `RMId →
//! connection` table, brokers topology and peer-availability
//! subscriptions, gates client admission on the flushed-server count,
//! and routes inbound wire messages to the proposer, acceptor, and
//! topology layers.
//!
//! The only cross-thread shared state is the snapshot behind a
//! reader/writer lock: local identity, the peer map (for the message
//! router), the client table, and the removed-RM set. Everything else
//! is owned by the actor thread.

use std::collections::{BTreeSet, HashMap};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, OnceLock, RwLock};
use std::thread;

use tracing::{debug, error, info, warn};

use tessera_engine::{Mailbox, MailboxReceiver};
use tessera_paxos::{
    AcceptorDispatcher, MessageRouter, PeerMap, PeerSender, ProposerDispatcher,
    ServerConnectionPublisher, ServerConnectionSubscriber, ServerPeer,
};
use tessera_types::{
    BootCount, ClusterUUId, Configuration, ConnectionCount, Fingerprint, Outcome, RMId, Topology,
    TopologyChangeSubscriberKind, Txn,
};
use tessera_wire::{HelloServerFromServer, Message, MigrationBatch};

use crate::connection::{Connection, ConnectionHandle, Duplex};
use crate::handshake::PeerIdentity;
use crate::tls::NodeTls;

/// Depth of the manager's mailbox.
const MAILBOX_DEPTH: usize = 1024;

// ============================================================================
// Collaborator traits
// ============================================================================

/// A registered client session (the client submitter implements this).
pub trait ClientConnection: Send + Sync {
    fn outcome_received(&self, sender: RMId, txn: Txn, outcome: Outcome);
    fn topology_changed(&self, topology: Topology);
    fn shutdown(&self);
}

/// Accepts a freshly handshaken client stream (the server wiring
/// implements this with the client submitter).
pub trait ClientAcceptor: Send + Sync {
    fn accept_client(&self, conn_id: u64, stream: Box<dyn Duplex>, fingerprint: Fingerprint);
}

/// Topology-layer messages (the transmogrifier implements this).
pub trait TopologyEventSink: Send + Sync {
    fn request_topology_change(&self, config: Configuration);
    fn migration_received(&self, sender: RMId, batch: MigrationBatch);
    fn migration_complete_received(&self, sender: RMId, version: u32);
}

/// A topology subscriber: acknowledges each installed topology.
pub trait TopologySubscriber: Send + Sync {
    fn topology_changed(&self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>);
}

/// Per-kind callbacks fired once every subscriber of that kind has
/// acknowledged a `set_topology`.
pub type TopologyCallbacks =
    HashMap<TopologyChangeSubscriberKind, Box<dyn FnOnce() + Send>>;

/// In-process counters standing in for the metrics sinks.
#[derive(Debug, Default)]
pub struct ClientTxnMetrics {
    pub submitted: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    pub resubmitted: AtomicU64,
}

// ============================================================================
// Shared snapshot
// ============================================================================

struct Shared {
    rm_id: RMId,
    boot_count: BootCount,
    local_host: RwLock<String>,
    cluster_id: RwLock<String>,
    cluster_uuid: RwLock<ClusterUUId>,
    rms_removed: RwLock<BTreeSet<RMId>>,
    peers: RwLock<PeerMap>,
    clients: RwLock<HashMap<u32, Arc<dyn ClientConnection>>>,
    client_metrics: Arc<ClientTxnMetrics>,

    proposers: OnceLock<Arc<ProposerDispatcher>>,
    acceptors: OnceLock<Arc<AcceptorDispatcher>>,
    topology_sink: OnceLock<Arc<dyn TopologyEventSink>>,
    client_acceptor: OnceLock<Arc<dyn ClientAcceptor>>,
}

// ============================================================================
// Handle
// ============================================================================

enum MgrEvent {
    SetTopology {
        topology: Topology,
        callbacks: TopologyCallbacks,
        local_host: String,
        remote_hosts: Vec<String>,
    },
    ServerEstablished {
        handle: ConnectionHandle,
        identity: PeerIdentity,
        dialed: bool,
        accepted: SyncSender<bool>,
    },
    ServerLost {
        conn_id: u64,
        rm_id: RMId,
        restarting: bool,
    },
    ServerFlushed(RMId),
    ClientEstablished {
        connection_count: ConnectionCount,
        conn: Arc<dyn ClientConnection>,
        reply: SyncSender<Option<(PeerMap, Arc<ClientTxnMetrics>)>>,
    },
    ClientLost {
        connection_count: ConnectionCount,
    },
    Dispatch {
        sender: RMId,
        msg: Message,
    },
    AddTopologySubscriber {
        kind: TopologyChangeSubscriberKind,
        sub: Arc<dyn TopologySubscriber>,
        reply: SyncSender<Option<Topology>>,
    },
    RemoveTopologySubscriber {
        kind: TopologyChangeSubscriberKind,
        sub: Arc<dyn TopologySubscriber>,
    },
    AddConnSubscriber(Arc<dyn ServerConnectionSubscriber>),
    RemoveConnSubscriber(Arc<dyn ServerConnectionSubscriber>),
    SubscriberAcked {
        kind: TopologyChangeSubscriberKind,
        version: u32,
    },
}

/// Cheap cloneable handle onto the manager actor. Also the process's
/// [`MessageRouter`] and [`ServerConnectionPublisher`].
#[derive(Clone)]
pub struct ConnectionManagerHandle {
    mailbox: Mailbox<MgrEvent>,
    shared: Arc<Shared>,
    next_conn_id: Arc<AtomicU64>,
}

impl ConnectionManagerHandle {
    pub fn rm_id(&self) -> RMId {
        self.shared.rm_id
    }

    pub fn boot_count(&self) -> BootCount {
        self.shared.boot_count
    }

    pub fn local_host(&self) -> String {
        self.shared.local_host.read().expect("lock").clone()
    }

    pub fn client_metrics(&self) -> Arc<ClientTxnMetrics> {
        self.shared.client_metrics.clone()
    }

    /// Snapshot of the established peers (loopback included).
    pub fn peers(&self) -> PeerMap {
        self.shared.peers.read().expect("lock").clone()
    }

    /// Late wiring of the dispatch targets, once they exist.
    pub fn install_dispatchers(
        &self,
        proposers: Arc<ProposerDispatcher>,
        acceptors: Arc<AcceptorDispatcher>,
    ) {
        let _ = self.shared.proposers.set(proposers);
        let _ = self.shared.acceptors.set(acceptors);
    }

    pub fn install_topology_sink(&self, sink: Arc<dyn TopologyEventSink>) {
        let _ = self.shared.topology_sink.set(sink);
    }

    pub fn install_client_acceptor(&self, acceptor: Arc<dyn ClientAcceptor>) {
        let _ = self.shared.client_acceptor.set(acceptor);
    }

    // ------------------------------------------------------------------
    // Used by connections
    // ------------------------------------------------------------------

    /// A fresh identity record for a handshake, with a per-attempt
    /// tiebreak nonce.
    pub fn server_hello(&self, tie_break: u32) -> HelloServerFromServer {
        HelloServerFromServer {
            local_host: self.local_host(),
            rm_id: self.shared.rm_id,
            boot_count: self.shared.boot_count,
            cluster_id: self.shared.cluster_id.read().expect("lock").clone(),
            cluster_uuid: *self.shared.cluster_uuid.read().expect("lock"),
            tie_break,
        }
    }

    pub fn rms_removed(&self) -> BTreeSet<RMId> {
        self.shared.rms_removed.read().expect("lock").clone()
    }

    /// Registers an established server peer; false means the connection
    /// lost the dial race and must close.
    pub fn server_established(
        &self,
        handle: ConnectionHandle,
        identity: PeerIdentity,
        dialed: bool,
    ) -> bool {
        let (tx, rx) = mpsc::sync_channel(1);
        if !self.mailbox.send(MgrEvent::ServerEstablished {
            handle,
            identity,
            dialed,
            accepted: tx,
        }) {
            return false;
        }
        // A rotated-out registration drops its reply sender; treat the
        // disconnect as a rejection and let the dialer retry.
        rx.recv().unwrap_or(false)
    }

    pub fn server_lost(&self, conn_id: u64, rm_id: RMId, restarting: bool) {
        self.mailbox.send(MgrEvent::ServerLost {
            conn_id,
            rm_id,
            restarting,
        });
    }

    /// Marks a peer as having flushed the current topology.
    pub fn server_flushed(&self, rm_id: RMId) {
        self.mailbox.send(MgrEvent::ServerFlushed(rm_id));
    }

    pub fn dispatch_message(&self, sender: RMId, msg: Message) {
        self.mailbox.send(MgrEvent::Dispatch { sender, msg });
    }

    pub fn accept_client(&self, conn_id: u64, stream: Box<dyn Duplex>, fingerprint: Fingerprint) {
        match self.shared.client_acceptor.get() {
            Some(acceptor) => acceptor.accept_client(conn_id, stream, fingerprint),
            None => warn!("client connected before the client layer was wired; dropping"),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Atomically replaces the topology; `callbacks[kind]` fires once
    /// the new topology has propagated to every subscriber of `kind`.
    pub fn set_topology(
        &self,
        topology: Topology,
        callbacks: TopologyCallbacks,
        local_host: String,
        remote_hosts: Vec<String>,
    ) {
        self.mailbox.send(MgrEvent::SetTopology {
            topology,
            callbacks,
            local_host,
            remote_hosts,
        });
    }

    /// Registers a client session, returning the current peer snapshot
    /// and metrics sinks, or `None` when admission is gated (not enough
    /// flushed servers yet).
    pub fn client_established(
        &self,
        connection_count: ConnectionCount,
        conn: Arc<dyn ClientConnection>,
    ) -> Option<(PeerMap, Arc<ClientTxnMetrics>)> {
        let (tx, rx) = mpsc::sync_channel(1);
        if !self.mailbox.send(MgrEvent::ClientEstablished {
            connection_count,
            conn,
            reply: tx,
        }) {
            return None;
        }
        rx.recv().ok().flatten()
    }

    pub fn client_lost(&self, connection_count: ConnectionCount) {
        self.mailbox.send(MgrEvent::ClientLost { connection_count });
    }

    /// Registers an in-process client (the local connection) outside
    /// the flushed-server admission gate: internal submitters must work
    /// before the cluster is reachable, or bootstrap cannot happen.
    pub fn register_internal_client(
        &self,
        connection_count: ConnectionCount,
        conn: Arc<dyn ClientConnection>,
    ) {
        self.shared
            .clients
            .write()
            .expect("lock")
            .insert(connection_count.as_u32(), conn);
    }

    /// Looks up the client that submitted a txn; boot-count zero is the
    /// wildcard for local submissions.
    pub fn get_client(
        &self,
        boot: BootCount,
        connection_count: ConnectionCount,
    ) -> Option<Arc<dyn ClientConnection>> {
        if !boot.is_zero() && boot != self.shared.boot_count {
            return None;
        }
        self.shared
            .clients
            .read()
            .expect("lock")
            .get(&connection_count.as_u32())
            .cloned()
    }

    pub fn add_topology_subscriber(
        &self,
        kind: TopologyChangeSubscriberKind,
        sub: Arc<dyn TopologySubscriber>,
    ) -> Option<Topology> {
        let (tx, rx) = mpsc::sync_channel(1);
        if !self.mailbox.send(MgrEvent::AddTopologySubscriber {
            kind,
            sub,
            reply: tx,
        }) {
            return None;
        }
        rx.recv().ok().flatten()
    }

    pub fn remove_topology_subscriber(
        &self,
        kind: TopologyChangeSubscriberKind,
        sub: Arc<dyn TopologySubscriber>,
    ) {
        self.mailbox
            .send(MgrEvent::RemoveTopologySubscriber { kind, sub });
    }

    pub fn shutdown(&self) {
        self.mailbox.close();
    }
}

impl MessageRouter for ConnectionManagerHandle {
    fn send(&self, to: RMId, msg: Message) {
        let peer = self.shared.peers.read().expect("lock").get(&to).cloned();
        match peer {
            Some(peer) => {
                peer.sender.send(msg);
            }
            None => debug!(%to, msg = msg.name(), "no connection; message dropped"),
        }
    }
}

impl ServerConnectionPublisher for ConnectionManagerHandle {
    fn add_subscriber(&self, sub: Arc<dyn ServerConnectionSubscriber>) {
        self.mailbox.send(MgrEvent::AddConnSubscriber(sub));
    }

    fn remove_subscriber(&self, sub: &Arc<dyn ServerConnectionSubscriber>) {
        self.mailbox.send(MgrEvent::RemoveConnSubscriber(sub.clone()));
    }
}

/// The local loopback: messages to ourselves re-enter the dispatch
/// path through the actor mailbox.
struct LoopbackSender {
    mailbox: Mailbox<MgrEvent>,
    rm_id: RMId,
}

impl PeerSender for LoopbackSender {
    fn send(&self, msg: Message) -> bool {
        self.mailbox.send(MgrEvent::Dispatch {
            sender: self.rm_id,
            msg,
        })
    }
}

// ============================================================================
// The actor
// ============================================================================

struct PendingCallbacks {
    version: u32,
    /// Outstanding subscriber acks per kind, plus the callback to fire
    /// at zero.
    counts: HashMap<TopologyChangeSubscriberKind, usize>,
    callbacks: TopologyCallbacks,
}

/// The registry actor state.
pub struct ConnectionManager {
    handle: ConnectionManagerHandle,
    mailbox: MailboxReceiver<MgrEvent>,
    tls: Arc<NodeTls>,

    topology: Option<Topology>,
    desired: HashMap<String, ConnectionHandle>,
    rm_to_server: HashMap<RMId, (ConnectionHandle, ServerPeer)>,
    flushed_servers: BTreeSet<RMId>,

    conn_subscribers: Vec<Arc<dyn ServerConnectionSubscriber>>,
    topology_subscribers:
        HashMap<TopologyChangeSubscriberKind, Vec<Arc<dyn TopologySubscriber>>>,
    pending_callbacks: Option<PendingCallbacks>,
}

impl ConnectionManager {
    /// Spawns the registry actor and (optionally) the listener.
    /// `local_host` is this node's advertised `host:port`, needed before
    /// any topology exists so the node can find itself in one.
    pub fn spawn(
        rm_id: RMId,
        boot_count: BootCount,
        local_host: String,
        tls: Arc<NodeTls>,
        listen_port: Option<u16>,
    ) -> ConnectionManagerHandle {
        let (tx, mailbox) = Mailbox::new("connection-manager", MAILBOX_DEPTH);
        let shared = Arc::new(Shared {
            rm_id,
            boot_count,
            local_host: RwLock::new(local_host),
            cluster_id: RwLock::new(String::new()),
            cluster_uuid: RwLock::new(ClusterUUId::UNSET),
            rms_removed: RwLock::new(BTreeSet::new()),
            peers: RwLock::new(PeerMap::new()),
            clients: RwLock::new(HashMap::new()),
            client_metrics: Arc::new(ClientTxnMetrics::default()),
            proposers: OnceLock::new(),
            acceptors: OnceLock::new(),
            topology_sink: OnceLock::new(),
            client_acceptor: OnceLock::new(),
        });
        let handle = ConnectionManagerHandle {
            mailbox: tx.clone(),
            shared: shared.clone(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };

        // Loopback for the local RM: always "connected".
        {
            let peer = ServerPeer {
                rm_id,
                boot_count,
                cluster_uuid: ClusterUUId::UNSET,
                sender: Arc::new(LoopbackSender { mailbox: tx, rm_id }),
            };
            shared
                .peers
                .write()
                .expect("lock")
                .insert(rm_id, peer);
        }

        if let Some(port) = listen_port {
            Self::spawn_listener(port, handle.clone(), tls.clone());
        }

        let mut actor = ConnectionManager {
            handle: handle.clone(),
            mailbox,
            tls,
            topology: None,
            desired: HashMap::new(),
            rm_to_server: HashMap::new(),
            flushed_servers: BTreeSet::new(),
            conn_subscribers: Vec::new(),
            topology_subscribers: TopologyChangeSubscriberKind::ALL
                .iter()
                .map(|&k| (k, Vec::new()))
                .collect(),
            pending_callbacks: None,
        };
        thread::Builder::new()
            .name("connection-manager".to_string())
            .spawn(move || actor.run())
            .expect("spawn connection manager");
        handle
    }

    fn spawn_listener(port: u16, handle: ConnectionManagerHandle, tls: Arc<NodeTls>) {
        thread::Builder::new()
            .name(format!("listener-{port}"))
            .spawn(move || {
                let listener = match TcpListener::bind(("0.0.0.0", port)) {
                    Ok(l) => l,
                    Err(e) => {
                        // A dead listener before any handshake is fatal
                        // to the process; escalate loudly.
                        error!(port, error = %e, "listen socket failed");
                        panic!("cannot listen on port {port}: {e}");
                    }
                };
                info!(port, "listening");
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let conn_id = handle.next_conn_id();
                            Connection::spawn_incoming(
                                conn_id,
                                stream,
                                handle.clone(),
                                tls.clone(),
                            );
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            })
            .expect("spawn listener");
    }

    fn run(&mut self) {
        while let Some(event) = self.mailbox.recv() {
            match event {
                MgrEvent::SetTopology {
                    topology,
                    callbacks,
                    local_host,
                    remote_hosts,
                } => self.set_topology(topology, callbacks, local_host, remote_hosts),
                MgrEvent::ServerEstablished {
                    handle,
                    identity,
                    dialed,
                    accepted,
                } => {
                    let ok = self.server_established(handle, identity, dialed);
                    let _ = accepted.send(ok);
                }
                MgrEvent::ServerLost {
                    conn_id,
                    rm_id,
                    restarting,
                } => self.server_lost(conn_id, rm_id, restarting),
                MgrEvent::ServerFlushed(rm_id) => {
                    self.flushed_servers.insert(rm_id);
                }
                MgrEvent::ClientEstablished {
                    connection_count,
                    conn,
                    reply,
                } => {
                    let _ = reply.send(self.client_established(connection_count, conn));
                }
                MgrEvent::ClientLost { connection_count } => {
                    self.handle
                        .shared
                        .clients
                        .write()
                        .expect("lock")
                        .remove(&connection_count.as_u32());
                }
                MgrEvent::Dispatch { sender, msg } => self.dispatch(sender, msg),
                MgrEvent::AddTopologySubscriber { kind, sub, reply } => {
                    self.topology_subscribers
                        .entry(kind)
                        .or_default()
                        .push(sub);
                    let _ = reply.send(self.topology.clone());
                }
                MgrEvent::RemoveTopologySubscriber { kind, sub } => {
                    if let Some(subs) = self.topology_subscribers.get_mut(&kind) {
                        subs.retain(|s| !Arc::ptr_eq(s, &sub));
                    }
                }
                MgrEvent::AddConnSubscriber(sub) => {
                    let peers = self.peer_snapshot();
                    sub.connected_rms(&peers);
                    self.conn_subscribers.push(sub);
                }
                MgrEvent::RemoveConnSubscriber(sub) => {
                    self.conn_subscribers.retain(|s| !Arc::ptr_eq(s, &sub));
                }
                MgrEvent::SubscriberAcked { kind, version } => {
                    self.subscriber_acked(kind, version);
                }
            }
        }
        for (_, handle) in self.desired.drain() {
            handle.shutdown();
        }
        debug!("connection manager stopped");
    }

    // ------------------------------------------------------------------
    // Topology installation
    // ------------------------------------------------------------------

    fn set_topology(
        &mut self,
        topology: Topology,
        callbacks: TopologyCallbacks,
        local_host: String,
        remote_hosts: Vec<String>,
    ) {
        info!(topology = %topology, %local_host, "installing topology");
        {
            let shared = &self.handle.shared;
            if !local_host.is_empty() {
                *shared.local_host.write().expect("lock") = local_host;
            }
            *shared.cluster_id.write().expect("lock") = topology.config.cluster_id.clone();
            *shared.cluster_uuid.write().expect("lock") = topology.config.cluster_uuid;
            *shared.rms_removed.write().expect("lock") = topology.config.rms_removed.clone();
        }
        self.topology = Some(topology.clone());

        // Reconcile dialers with the desired remote host set.
        let desired: BTreeSet<String> = remote_hosts.into_iter().collect();
        self.desired.retain(|host, handle| {
            if desired.contains(host) {
                true
            } else {
                debug!(%host, "peer no longer desired; closing dialer");
                handle.shutdown();
                false
            }
        });
        for host in desired {
            if !self.desired.contains_key(&host) {
                let conn_id = self.handle.next_conn_id();
                debug!(%host, "dialing new peer");
                let handle = Connection::spawn_dialer(
                    conn_id,
                    host.clone(),
                    self.handle.clone(),
                    self.tls.clone(),
                );
                self.desired.insert(host, handle);
            }
        }

        // Deliver to subscribers; per-kind callbacks fire when the last
        // subscriber of the kind acks.
        let version = topology.version();
        let mut counts = HashMap::new();
        for (&kind, subs) in &self.topology_subscribers {
            counts.insert(kind, subs.len());
        }
        self.pending_callbacks = Some(PendingCallbacks {
            version,
            counts,
            callbacks,
        });

        for (&kind, subs) in &self.topology_subscribers {
            if subs.is_empty() {
                // Acked trivially.
                self.handle.mailbox.send(MgrEvent::SubscriberAcked { kind, version });
                continue;
            }
            for sub in subs {
                let tx = self.handle.mailbox.clone();
                sub.topology_changed(
                    topology.clone(),
                    Box::new(move |_ok| {
                        tx.send(MgrEvent::SubscriberAcked { kind, version });
                    }),
                );
            }
        }

        // Drop stale flush state and re-announce to peers.
        self.flushed_servers.clear();
        self.flushed_servers.insert(self.handle.rm_id());
        for (_, (_, peer)) in self.rm_to_server.iter() {
            peer.sender.send(Message::Flushed);
        }

        // Clients observe every topology.
        let clients: Vec<Arc<dyn ClientConnection>> = self
            .handle
            .shared
            .clients
            .read()
            .expect("lock")
            .values()
            .cloned()
            .collect();
        for client in clients {
            client.topology_changed(topology.clone());
        }
    }

    fn subscriber_acked(&mut self, kind: TopologyChangeSubscriberKind, version: u32) {
        let Some(pending) = self.pending_callbacks.as_mut() else {
            return;
        };
        if pending.version != version {
            return; // superseded installation
        }
        let Some(count) = pending.counts.get_mut(&kind) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            if let Some(callback) = pending.callbacks.remove(&kind) {
                debug!(?kind, version, "topology propagated to all subscribers of kind");
                callback();
            }
        }
    }

    // ------------------------------------------------------------------
    // Server peers
    // ------------------------------------------------------------------

    fn server_established(
        &mut self,
        handle: ConnectionHandle,
        identity: PeerIdentity,
        dialed: bool,
    ) -> bool {
        // Dial-race arbitration: both ends agree on the surviving
        // direction, so the loser is dropped eagerly.
        if self.rm_to_server.contains_key(&identity.rm_id) {
            let ours_survives = crate::handshake::dial_survives(
                (self.handle.rm_id(), self.handle.boot_count()),
                (identity.rm_id, identity.boot_count),
                identity.combined_tie_break,
            );
            let keep_new = dialed == ours_survives;
            if !keep_new {
                debug!(peer = %identity.rm_id, "duplicate connection lost tiebreak");
                return false;
            }
            if let Some((old_handle, _)) = self.rm_to_server.remove(&identity.rm_id) {
                debug!(peer = %identity.rm_id, "replacing connection after tiebreak");
                old_handle.shutdown();
            }
        }

        let peer = ServerPeer {
            rm_id: identity.rm_id,
            boot_count: identity.boot_count,
            cluster_uuid: identity.cluster_uuid,
            sender: Arc::new(handle.clone()),
        };
        self.rm_to_server
            .insert(identity.rm_id, (handle.clone(), peer.clone()));
        self.publish_peers();
        info!(peer = %identity.rm_id, host = %identity.host, "server connection established");

        // Tell the newcomer our topology has been installed.
        if self.topology.is_some() {
            peer.sender.send(Message::Flushed);
        }

        let peers = self.peer_snapshot();
        for sub in self.conn_subscribers.clone() {
            sub.connection_established(&peer, &peers, Box::new(|| {}));
        }
        true
    }

    fn server_lost(&mut self, conn_id: u64, rm_id: RMId, restarting: bool) {
        match self.rm_to_server.get(&rm_id) {
            Some((registered, _)) if registered.conn_id == conn_id => {}
            _ => return, // a tiebreak loser or stale connection
        }
        self.rm_to_server.remove(&rm_id);
        self.flushed_servers.remove(&rm_id);
        self.publish_peers();
        info!(peer = %rm_id, restarting, "server connection lost");

        let peers = self.peer_snapshot();
        for sub in self.conn_subscribers.clone() {
            sub.connection_lost(rm_id, &peers);
        }
    }

    /// Rebuilds the shared peer snapshot (loopback included).
    fn publish_peers(&self) {
        let mut peers = PeerMap::new();
        for (rm, (_, peer)) in &self.rm_to_server {
            peers.insert(*rm, peer.clone());
        }
        let shared = &self.handle.shared;
        let mut guard = shared.peers.write().expect("lock");
        let loopback = guard
            .get(&shared.rm_id)
            .cloned()
            .expect("loopback always present");
        peers.insert(shared.rm_id, loopback);
        *guard = peers;
    }

    fn peer_snapshot(&self) -> PeerMap {
        self.handle.shared.peers.read().expect("lock").clone()
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Client admission is gated on enough peers having flushed the
    /// current topology: writes must not enter before the replica set
    /// is reachable.
    fn client_established(
        &mut self,
        connection_count: ConnectionCount,
        conn: Arc<dyn ClientConnection>,
    ) -> Option<(PeerMap, Arc<ClientTxnMetrics>)> {
        let topology = self.topology.as_ref()?;
        let needed = topology
            .config
            .hosts
            .len()
            .saturating_sub(usize::from(topology.config.f));
        if self.flushed_servers.len() < needed {
            warn!(
                flushed = self.flushed_servers.len(),
                needed, "client rejected: replica set not yet flushed"
            );
            return None;
        }
        self.handle
            .shared
            .clients
            .write()
            .expect("lock")
            .insert(connection_count.as_u32(), conn);
        Some((
            self.peer_snapshot(),
            self.handle.shared.client_metrics.clone(),
        ))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Routes one inbound wire message to its consumer.
    fn dispatch(&mut self, sender: RMId, msg: Message) {
        let shared = &self.handle.shared;
        match msg {
            Message::TxnSubmission(txn) => {
                if let Some(proposers) = shared.proposers.get() {
                    proposers.txn_received(sender, txn);
                }
            }
            Message::SubmissionOutcome { txn, outcome } => {
                let boot = txn.id.boot_count();
                let conn = txn.id.connection_count();
                match self.handle.get_client(boot, conn) {
                    Some(client) => client.outcome_received(sender, txn, outcome),
                    None => {
                        // Default for an unknown client: confirm so the
                        // acceptor can retire.
                        self.handle
                            .send(sender, Message::SubmissionComplete(txn.id));
                    }
                }
            }
            Message::SubmissionComplete(txn_id) => {
                if let Some(acceptors) = shared.acceptors.get() {
                    acceptors.tsc_received(sender, txn_id);
                }
            }
            Message::SubmissionAbort(txn_id) => {
                if let Some(proposers) = shared.proposers.get() {
                    proposers.tsa_received(sender, txn_id);
                }
            }
            Message::OneATxnVotes(votes) => {
                if let Some(acceptors) = shared.acceptors.get() {
                    acceptors.one_a_received(sender, votes);
                }
            }
            Message::OneBTxnVotes(votes) => {
                if let Some(proposers) = shared.proposers.get() {
                    proposers.one_b_received(sender, votes);
                }
            }
            Message::TwoATxnVotes(votes) => {
                if let Some(acceptors) = shared.acceptors.get() {
                    acceptors.two_a_received(sender, votes);
                }
            }
            Message::TwoBTxnVotes(votes) => {
                if let Some(proposers) = shared.proposers.get() {
                    proposers.two_b_received(sender, votes);
                }
            }
            Message::TxnLocallyComplete(txn_id) => {
                if let Some(acceptors) = shared.acceptors.get() {
                    acceptors.tlc_received(sender, txn_id);
                }
            }
            Message::TxnGloballyComplete(txn_id) => {
                if let Some(proposers) = shared.proposers.get() {
                    proposers.tgc_received(sender, txn_id);
                }
            }
            Message::TopologyChangeRequest(config) => {
                if let Some(sink) = shared.topology_sink.get() {
                    sink.request_topology_change(config);
                }
            }
            Message::Migration(batch) => {
                if let Some(sink) = shared.topology_sink.get() {
                    sink.migration_received(sender, batch);
                }
            }
            Message::MigrationComplete { version } => {
                if let Some(sink) = shared.topology_sink.get() {
                    sink.migration_complete_received(sender, version);
                }
            }
            Message::Flushed => {
                self.handle.server_flushed(sender);
            }
            Message::Heartbeat | Message::ConnectionError(_) => {
                panic!("connection-level message {} leaked into dispatch", msg.name());
            }
        }
    }
}
