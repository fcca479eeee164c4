//! Explicit configuration for each component.
//!
//! Nothing is read from the process environment here; the CLI layers flags
//! (and their `NODECERT_*` variables) over an optional JSON file and hands
//! each component its own section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::DEFAULT_KEY_BITS;

/// Default node tree.
pub const DEFAULT_NODE_DIR: &str = "nodes";
/// Default request queue.
pub const DEFAULT_QUEUE_DIR: &str = "requests";
/// Default CA state directory.
pub const DEFAULT_CA_DIR: &str = "ca";
/// Default parent of signed batches.
pub const DEFAULT_OUT_DIR: &str = "signed";
/// Default registry file.
pub const DEFAULT_REGISTRY: &str = "nodes.txt";
/// Default leaf validity.
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
/// Default CA validity.
pub const DEFAULT_CA_VALIDITY_DAYS: u32 = 3650;
/// Default expiry warning threshold.
pub const DEFAULT_WARN_DAYS: u32 = 30;

/// Complete configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCertConfig {
    /// Registry & request generator.
    pub request: RequestConfig,
    /// Certificate authority manager.
    pub ca: CaConfig,
    /// Bundle arranger.
    pub arrange: ArrangeConfig,
    /// Verification engine.
    pub verify: VerifyConfig,
}

impl NodeCertConfig {
    /// Loads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingInput`] if the file is absent and
    /// [`Error::Config`] if it is not valid configuration JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = crate::fsutil::read_required_text(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))
    }
}

/// Settings for key and CSR generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Base DN, e.g. `O=Acme,OU=Infra`. Required.
    pub dn_template: Option<String>,
    /// Suffix used to cluster-qualify SAN entries.
    pub cluster_suffix: Option<String>,
    /// Registry file.
    pub registry: PathBuf,
    /// Node tree root.
    pub node_dir: PathBuf,
    /// Where CSRs are queued for the CA.
    pub queue_dir: PathBuf,
    /// RSA key size.
    pub key_bits: usize,
    /// Worker pool size.
    pub workers: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            dn_template: None,
            cluster_suffix: None,
            registry: PathBuf::from(DEFAULT_REGISTRY),
            node_dir: PathBuf::from(DEFAULT_NODE_DIR),
            queue_dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            key_bits: DEFAULT_KEY_BITS,
            workers: default_workers(),
        }
    }
}

/// Settings for CA bootstrap and signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// CA state directory.
    pub ca_dir: PathBuf,
    /// Request queue to sign from.
    pub queue_dir: PathBuf,
    /// Parent directory of timestamped batches.
    pub out_dir: PathBuf,
    /// Base DN of the CA certificates.
    pub dn_template: String,
    /// Root CA common name.
    pub common_name: String,
    /// Issue leaves from an intermediate signed by the root.
    pub intermediate: bool,
    /// Intermediate CA common name.
    pub intermediate_common_name: String,
    /// CA key size.
    pub key_bits: usize,
    /// Leaf validity in days.
    pub validity_days: u32,
    /// CA certificate validity in days.
    pub ca_validity_days: u32,
    /// Re-sign requests the ledger already records.
    pub resign: bool,
    /// Seconds to wait for the ledger lock.
    pub lock_timeout_secs: u64,
}

impl CaConfig {
    /// Ledger lock timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            ca_dir: PathBuf::from(DEFAULT_CA_DIR),
            queue_dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            dn_template: "O=Clawbernetes".into(),
            common_name: "Clawbernetes Node Root CA".into(),
            intermediate: false,
            intermediate_common_name: "Clawbernetes Node Intermediate CA".into(),
            key_bits: DEFAULT_KEY_BITS,
            validity_days: DEFAULT_VALIDITY_DAYS,
            ca_validity_days: DEFAULT_CA_VALIDITY_DAYS,
            resign: false,
            lock_timeout_secs: 10,
        }
    }
}

/// Where the arranger takes private keys from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// Keys were generated locally and must already exist in the node tree.
    #[default]
    Local,
    /// Keys were generated by the CA operator and sit next to the certificates.
    Signed,
}

/// Settings for bundle assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrangeConfig {
    /// Signed batch directory (or the parent of several batches).
    pub signed_dir: PathBuf,
    /// Explicit trust anchor; discovered in the batch when absent.
    pub ca_cert: Option<PathBuf>,
    /// Node tree root.
    pub node_dir: PathBuf,
    /// Key provenance.
    pub key_source: KeySource,
}

impl Default for ArrangeConfig {
    fn default() -> Self {
        Self {
            signed_dir: PathBuf::from(DEFAULT_OUT_DIR),
            ca_cert: None,
            node_dir: PathBuf::from(DEFAULT_NODE_DIR),
            key_source: KeySource::Local,
        }
    }
}

/// Settings for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Node tree root.
    pub node_dir: PathBuf,
    /// Trust anchor; defaults to `<node_dir>/ca.crt`.
    pub ca_cert: Option<PathBuf>,
    /// Registry to check for drift.
    pub registry: Option<PathBuf>,
    /// Expiry warning threshold in days.
    pub warn_days: u32,
    /// Worker pool size.
    pub workers: usize,
}

impl VerifyConfig {
    /// Effective trust anchor path.
    #[must_use]
    pub fn anchor_path(&self) -> PathBuf {
        self.ca_cert
            .clone()
            .unwrap_or_else(|| self.node_dir.join(crate::arrange::SHARED_ANCHOR))
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            node_dir: PathBuf::from(DEFAULT_NODE_DIR),
            ca_cert: None,
            registry: None,
            warn_days: DEFAULT_WARN_DAYS,
            workers: default_workers(),
        }
    }
}

/// Available parallelism, or 1 when it cannot be determined.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = NodeCertConfig::default();
        assert_eq!(cfg.request.key_bits, 4096);
        assert_eq!(cfg.ca.validity_days, 365);
        assert_eq!(cfg.verify.warn_days, 30);
        assert_eq!(cfg.arrange.key_source, KeySource::Local);
        assert!(cfg.request.workers >= 1);
        assert_eq!(cfg.verify.anchor_path(), PathBuf::from("nodes/ca.crt"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodecert.json");
        std::fs::write(
            &path,
            r#"{ "request": { "dn_template": "O=Acme", "key_bits": 2048 },
                 "ca": { "intermediate": true },
                 "arrange": { "key_source": "signed" } }"#,
        )
        .unwrap();

        let cfg = NodeCertConfig::load(&path).unwrap();
        assert_eq!(cfg.request.dn_template.as_deref(), Some("O=Acme"));
        assert_eq!(cfg.request.key_bits, 2048);
        assert_eq!(cfg.request.node_dir, PathBuf::from(DEFAULT_NODE_DIR));
        assert!(cfg.ca.intermediate);
        assert_eq!(cfg.arrange.key_source, KeySource::Signed);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(NodeCertConfig::load(&path), Err(Error::Config(_))));
    }
}
