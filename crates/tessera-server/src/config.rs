//! The cluster configuration file.
//!
//! A JSON document the operator edits; `SIGHUP` reloads it and requests
//! a topology change to the new content.
//!
//! ```json
//! {
//!     "cluster_id": "prod",
//!     "version": 1,
//!     "hosts": ["nodeA:7578", "nodeB:7578", "nodeC:7578"],
//!     "f": 1,
//!     "max_rm_count": 16,
//!     "client_certificate_fingerprints": {
//!         "6a3c…(64 hex chars)": ["root"]
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use tessera_types::{ClusterUUId, Configuration, Fingerprint};

/// The on-disk configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub cluster_id: String,
    pub version: u32,
    pub hosts: Vec<String>,
    pub f: u8,
    pub max_rm_count: u16,

    /// Client certificate SHA-256 fingerprints (hex) → names of the
    /// root vars each may reach.
    #[serde(default)]
    pub client_certificate_fingerprints: BTreeMap<String, Vec<String>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let config: ConfigFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            bail!("cluster_id must not be empty");
        }
        if self.hosts.is_empty() {
            bail!("hosts must not be empty");
        }
        let needed = 2 * usize::from(self.f) + 1;
        if self.hosts.len() < needed {
            bail!(
                "f={} needs at least {} hosts, got {}",
                self.f,
                needed,
                self.hosts.len()
            );
        }
        if usize::from(self.max_rm_count) < self.hosts.len() {
            bail!(
                "max_rm_count {} is below the host count {}",
                self.max_rm_count,
                self.hosts.len()
            );
        }
        for fingerprint in self.client_certificate_fingerprints.keys() {
            if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("malformed fingerprint {fingerprint:?} (need 64 hex chars)");
            }
        }
        Ok(())
    }

    /// Lowers the document into the runtime configuration. RM ids are
    /// runtime identities and stay empty here; each node records itself
    /// when it first proposes the target.
    pub fn to_configuration(&self) -> Result<Configuration> {
        let mut fingerprints = BTreeMap::new();
        for (hex, roots) in &self.client_certificate_fingerprints {
            let mut bytes = [0u8; 32];
            for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
                let s = std::str::from_utf8(chunk).context("fingerprint utf8")?;
                bytes[i] = u8::from_str_radix(s, 16).context("fingerprint hex")?;
            }
            fingerprints.insert(Fingerprint::from_bytes(bytes), roots.clone());
        }

        let mut roots: Vec<String> = self
            .client_certificate_fingerprints
            .values()
            .flatten()
            .cloned()
            .collect();
        roots.sort();
        roots.dedup();

        Ok(Configuration {
            cluster_id: self.cluster_id.clone(),
            cluster_uuid: ClusterUUId::UNSET,
            version: self.version,
            f: self.f,
            max_rm_count: self.max_rm_count,
            rms: Vec::new(),
            hosts: self.hosts.clone(),
            fingerprints,
            roots,
            rms_removed: Default::default(),
            next: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> serde_json::Value {
        serde_json::json!({
            "cluster_id": "test",
            "version": 1,
            "hosts": ["a:7578", "b:7578", "c:7578"],
            "f": 1,
            "max_rm_count": 8,
            "client_certificate_fingerprints": {
                "0101010101010101010101010101010101010101010101010101010101010101": ["root"]
            }
        })
    }

    fn write_config(dir: &tempfile::TempDir, value: &serde_json::Value) -> std::path::PathBuf {
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn loads_and_lowers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &doc());
        let file = ConfigFile::load(&path).expect("load");
        let config = file.to_configuration().expect("lower");

        assert_eq!(config.cluster_id, "test");
        assert_eq!(config.f, 1);
        assert_eq!(config.hosts.len(), 3);
        assert!(config.rms.is_empty());
        assert_eq!(config.roots, vec!["root".to_string()]);
        assert_eq!(config.fingerprints.len(), 1);
        let fp = config.fingerprints.keys().next().unwrap();
        assert_eq!(fp.as_bytes()[0], 0x01);
    }

    #[test]
    fn rejects_insufficient_hosts_for_f() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = doc();
        value["f"] = serde_json::json!(2);
        let path = write_config(&dir, &value);
        assert!(ConfigFile::load(&path).is_err());
    }

    #[test]
    fn rejects_malformed_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut value = doc();
        value["client_certificate_fingerprints"] =
            serde_json::json!({"zz": ["root"]});
        let path = write_config(&dir, &value);
        assert!(ConfigFile::load(&path).is_err());
    }
}
