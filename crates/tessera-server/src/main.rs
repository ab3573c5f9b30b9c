//! The tessera node binary.
//!
//! Wires the object graph — store, executors, coordination layers,
//! connection subsystem, transmogrifier — under a supervisor, then
//! loops on the latched signals until shutdown.

mod config;
mod signals;
mod supervisor;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tessera_client::{ClientSession, LocalConnection};
use tessera_engine::{LateVoteSink, VarDispatcher};
use tessera_net::{ConnectionManager, ConnectionManagerHandle, NodeTls, TopologySubscriber};
use tessera_paxos::{AcceptorDispatcher, ProposerDispatcher};
use tessera_store::{Db, Table};
use tessera_topology::{ShutdownSignaller, Transmogrifier};
use tessera_types::{BootCount, ConnectionCount, RMId, Topology};

use crate::config::ConfigFile;
use crate::supervisor::Supervisor;

const RM_ID_KEY: &[u8] = b"rm_id";
const BOOT_COUNT_KEY: &[u8] = b"boot_count";

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "A distributed, strongly-consistent, transactional object store", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the cluster configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Data directory.
    #[arg(short, long)]
    dir: PathBuf,

    /// Node certificate chain (PEM).
    #[arg(long)]
    cert: PathBuf,

    /// Node private key (PEM).
    #[arg(long)]
    key: PathBuf,

    /// Cluster root certificate (PEM).
    #[arg(long)]
    ca: PathBuf,

    /// Listen port for peer and client connections.
    #[arg(short, long, default_value = "7578")]
    port: u16,

    /// This node's advertised `host:port` as it appears in the
    /// configuration's host list.
    #[arg(long)]
    advertise: String,

    /// WebSocket port (introspection surface; accepted for config
    /// compatibility, not served).
    #[arg(long)]
    ws_port: Option<u16>,

    /// Prometheus port (accepted for config compatibility, not served).
    #[arg(long)]
    metrics_port: Option<u16>,
}

struct SignalShutdown;

impl ShutdownSignaller for SignalShutdown {
    fn signal_shutdown(&self) {
        signals::request_shutdown();
    }
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            eprintln!("fatal: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    signals::install();

    let config_file = ConfigFile::load(&cli.config)?;
    let cluster_config = config_file.to_configuration()?;
    if let Some(port) = cli.ws_port {
        info!(port, "websocket surface not served in this build");
    }
    if let Some(port) = cli.metrics_port {
        info!(port, "metrics surface not served in this build");
    }

    // Storage first: everything else is rebuilt from it.
    let (db, store_thread) = Db::open(&cli.dir).context("opening store")?;
    let (rm_id, boot_count) = load_identity(&db)?;
    info!(%rm_id, %boot_count, "node identity");

    let tls = Arc::new(
        NodeTls::load(&cli.cert, &cli.key, &cli.ca).context("loading TLS material")?,
    );

    let supervisor = Arc::new(Supervisor::new());
    let shard_count = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    // The registry actor; also the process's message router and
    // connection publisher.
    let mgr: ConnectionManagerHandle = ConnectionManager::spawn(
        rm_id,
        boot_count,
        cli.advertise.clone(),
        tls,
        Some(cli.port),
    );

    // The in-process client: topology txns and rolls go through it.
    let local = LocalConnection::spawn(mgr.clone(), db.clone());
    mgr.register_internal_client(
        ConnectionCount::new(0),
        Arc::new(LocalClientAdapter(local.clone())),
    );

    // Vars → (late-bound) proposers → acceptors.
    let vote_sink = LateVoteSink::new();
    let vars = Arc::new(VarDispatcher::spawn(
        shard_count,
        rm_id,
        db.clone(),
        vote_sink.clone(),
        local.clone(),
    ));
    let mut rng = StdRng::from_entropy();
    let proposers = Arc::new(ProposerDispatcher::spawn(
        shard_count,
        rm_id,
        boot_count,
        rng.gen::<u32>(),
        db.clone(),
        Arc::new(mgr.clone()),
        Arc::new(mgr.clone()),
        vars.clone(),
    ));
    vote_sink.bind(proposers.clone());
    let acceptors = Arc::new(AcceptorDispatcher::spawn(
        shard_count,
        rm_id,
        db.clone(),
        Arc::new(mgr.clone()),
        Arc::new(mgr.clone()),
    ));
    mgr.install_dispatchers(proposers.clone(), acceptors.clone());

    // Topology subscriptions: each layer acknowledges installs.
    use tessera_types::TopologyChangeSubscriberKind as Kind;
    let _ = mgr.add_topology_subscriber(Kind::Var, Arc::new(VarTopologySub(vars.clone())));
    let _ = mgr.add_topology_subscriber(
        Kind::Proposer,
        Arc::new(ProposerTopologySub(proposers.clone())),
    );
    let _ = mgr.add_topology_subscriber(
        Kind::Acceptor,
        Arc::new(AcceptorTopologySub(acceptors.clone())),
    );

    // Client sessions.
    let shared_topology: Arc<RwLock<Option<Topology>>> = Arc::new(RwLock::new(None));
    let sessions = ClientSession::factory(mgr.clone(), shared_topology.clone());
    mgr.install_client_acceptor(sessions);

    // The transmogrifier: restores the persisted topology and targets
    // the configuration file's content.
    let transmogrifier = Transmogrifier::spawn(
        mgr.clone(),
        local.clone(),
        db.clone(),
        Arc::new(SignalShutdown),
        shared_topology,
        cli.port,
        Some(cluster_config),
    );
    mgr.install_topology_sink(Arc::new(transmogrifier.clone()));

    // Teardown, newest first: consumers stop before providers.
    {
        let db = db.clone();
        supervisor.on_shutdown("store", move || db.shutdown());
    }
    {
        let mgr = mgr.clone();
        supervisor.on_shutdown("connection-manager", move || mgr.shutdown());
    }
    {
        let transmogrifier = transmogrifier.clone();
        supervisor.on_shutdown("transmogrifier", move || transmogrifier.shutdown());
    }

    info!(port = cli.port, "tessera started");
    supervise(&cli, &supervisor, &mgr, &transmogrifier);

    supervisor.run_shutdown();
    let _ = store_thread.join();
    info!("clean shutdown");
    Ok(())
}

/// The main loop: poll the latched signals.
fn supervise(
    cli: &Cli,
    supervisor: &Supervisor,
    _mgr: &ConnectionManagerHandle,
    transmogrifier: &tessera_topology::TransmogrifierHandle,
) {
    while !signals::shutdown_requested() {
        if signals::take_reload() {
            info!("SIGHUP: reloading configuration");
            match ConfigFile::load(&cli.config).and_then(|f| f.to_configuration()) {
                Ok(config) => transmogrifier.request_change(config),
                Err(e) => warn!(error = %format!("{e:#}"), "reload failed; keeping current topology"),
            }
        }
        if signals::take_status() {
            let mut report = supervisor.collect_status();
            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            transmogrifier.status(tx);
            if let Ok(topo) = rx.recv_timeout(Duration::from_secs(1)) {
                report.push_str("transmogrifier:\n");
                report.push_str(&topo);
            }
            eprintln!("=== tessera status ===\n{report}======================");
        }
        if signals::take_dump_stacks() {
            // Thread stacks are the platform's job; report what we own.
            eprintln!(
                "=== tessera threads ===\nmain: supervising\n(thread stacks: use an external profiler)\n======================="
            );
        }
        if signals::take_profile_toggle() {
            info!("SIGUSR2: profiling toggle requested (no profiler compiled in)");
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Reads (or mints) the node identity: a random RMId persisted on first
/// boot, and a boot count incremented on every start.
fn load_identity(db: &Db) -> Result<(RMId, BootCount)> {
    let stored = db
        .read(|txn| {
            (
                txn.get(Table::Meta, RM_ID_KEY),
                txn.get(Table::Meta, BOOT_COUNT_KEY),
            )
        })
        .wait()
        .context("reading identity")?;

    let rm_id = match stored.0 {
        Some(bytes) => RMId::new(u32::from_be_bytes(
            bytes.as_slice().try_into().context("rm_id bytes")?,
        )),
        None => RMId::generate(&mut StdRng::from_entropy()),
    };
    let boot_count = match stored.1 {
        Some(bytes) => BootCount::new(u32::from_be_bytes(
            bytes.as_slice().try_into().context("boot_count bytes")?,
        ))
        .next(),
        None => BootCount::new(1),
    };

    let rm_bytes = rm_id.as_u32().to_be_bytes();
    let boot_bytes = boot_count.as_u32().to_be_bytes();
    db.read_write(move |txn| {
        txn.put(Table::Meta, RM_ID_KEY, &rm_bytes);
        txn.put(Table::Meta, BOOT_COUNT_KEY, &boot_bytes);
    })
    .wait()
    .context("persisting identity")?;

    Ok((rm_id, boot_count))
}

// ============================================================================
// Adapter shims
// ============================================================================

/// Routes `SubmissionOutcome`s for connection-count zero to the local
/// connection.
struct LocalClientAdapter(Arc<LocalConnection>);

impl tessera_net::ClientConnection for LocalClientAdapter {
    fn outcome_received(
        &self,
        sender: RMId,
        txn: tessera_types::Txn,
        outcome: tessera_types::Outcome,
    ) {
        self.0.outcome_received(sender, txn, outcome);
    }

    fn topology_changed(&self, _topology: Topology) {}

    fn shutdown(&self) {}
}

struct VarTopologySub(Arc<VarDispatcher>);

impl TopologySubscriber for VarTopologySub {
    fn topology_changed(&self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>) {
        self.0.topology_changed(topology, done);
    }
}

struct ProposerTopologySub(Arc<ProposerDispatcher>);

impl TopologySubscriber for ProposerTopologySub {
    fn topology_changed(&self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>) {
        self.0.topology_changed(topology, done);
    }
}

struct AcceptorTopologySub(Arc<AcceptorDispatcher>);

impl TopologySubscriber for AcceptorTopologySub {
    fn topology_changed(&self, topology: Topology, done: Box<dyn FnOnce(bool) + Send>) {
        self.0.topology_changed(topology.clone());
        done(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn identity_survives_restart_and_boot_count_advances() {
        let dir = tempdir().expect("tempdir");

        let (db, worker) = Db::open(dir.path()).expect("open");
        let (rm1, boot1) = load_identity(&db).expect("first boot");
        assert!(!rm1.is_empty());
        assert_eq!(boot1, BootCount::new(1));
        db.shutdown();
        worker.join().expect("join");

        let (db, worker) = Db::open(dir.path()).expect("reopen");
        let (rm2, boot2) = load_identity(&db).expect("second boot");
        assert_eq!(rm1, rm2);
        assert_eq!(boot2, BootCount::new(2));
        db.shutdown();
        worker.join().expect("join");
    }
}
