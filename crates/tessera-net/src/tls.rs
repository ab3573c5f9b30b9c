//! TLS material.
//!
//! Every node holds one certificate/key pair signed by the cluster
//! root. Peer links are mutually authenticated: both directions verify
//! against the cluster root, and client certificates are additionally
//! matched by SHA-256 fingerprint against the topology's account list.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Errors raised while loading or building TLS state.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS configuration: {0}")]
    Config(String),
}

/// The node's TLS identity: its certificate chain, key, and the
/// cluster root.
pub struct NodeTls {
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

impl NodeTls {
    /// Loads PEM material and builds both directions' configs.
    ///
    /// `cert_path` holds the node certificate chain and
    /// `ca_path` the cluster root used to verify peers.
    pub fn load(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        let roots = load_root_store(ca_path)?;
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| TlsError::Config(e.to_string()))?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots.as_ref().clone())
            .with_client_auth_cert(certs, key)
            .map_err(|e| TlsError::Config(e.to_string()))?;

        Ok(Self {
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
        })
    }

    /// Accept-side TLS state for one incoming stream.
    pub fn server_connection(&self) -> Result<rustls::ServerConnection, TlsError> {
        rustls::ServerConnection::new(self.server_config.clone())
            .map_err(|e| TlsError::Config(e.to_string()))
    }

    /// Dial-side TLS state for one outgoing stream.
    pub fn client_connection(
        &self,
        server_name: ServerName<'static>,
    ) -> Result<rustls::ClientConnection, TlsError> {
        rustls::ClientConnection::new(self.client_config.clone(), server_name)
            .map_err(|e| TlsError::Config(e.to_string()))
    }
}

impl std::fmt::Debug for NodeTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTls").finish_non_exhaustive()
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect();
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key))
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key))
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key))
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                return Err(TlsError::Config(format!(
                    "failed to parse key file {}: {e}",
                    path.display()
                )))
            }
        }
    }
    Err(TlsError::NoPrivateKey(path.display().to_string()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let certs = load_certs(path)?;
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TlsError::Config(e.to_string()))?;
    }
    Ok(roots)
}
