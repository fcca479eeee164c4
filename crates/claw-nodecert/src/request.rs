//! Per-node key and certificate request generation.
//!
//! For every registry node this writes `options.cnf`, `node.key` and
//! `node.csr` under `<node_dir>/<dir_name>/` and mirrors the request into the
//! CA queue as `<queue_dir>/<dir_name>.csr`. Existing keys and requests are
//! never replaced.

use std::fmt::Write as _;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, KeyUsagePurpose};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::config::RequestConfig;
use crate::der;
use crate::dn::{DnTemplate, SubjectName};
use crate::error::{Error, Result};
use crate::fsutil::{self, WriteOutcome};
use crate::keys::{self, PrivateKey, PublicKeyFingerprint, MAX_KEY_BITS, MIN_KEY_BITS};
use crate::pem;
use crate::pool;
use crate::registry::{NodeIdentity, Registry};
use crate::san::{self, SubjectAltName};

/// OpenSSL request configuration written next to each key.
pub const OPTIONS_FILE: &str = "options.cnf";
/// Node private key.
pub const KEY_FILE: &str = "node.key";
/// Node certificate request.
pub const CSR_FILE: &str = "node.csr";
/// Extension of queued requests.
pub const QUEUE_EXTENSION: &str = "csr";

/// Everything needed to request a certificate for one node.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    node: NodeIdentity,
    subject: SubjectName,
    sans: Vec<SubjectAltName>,
}

impl NodeRequest {
    /// Derives the subject and SAN list of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DistinguishedName`] if the subject cannot be built.
    pub fn new(node: NodeIdentity, template: &DnTemplate, cluster_suffix: Option<&str>) -> Result<Self> {
        let subject = template.subject_for(node.common_name())?;
        let sans = san::for_node(&node, cluster_suffix);
        Ok(Self { node, subject, sans })
    }

    /// The node this request is for.
    #[must_use]
    pub const fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// Requested subject.
    #[must_use]
    pub const fn subject(&self) -> &SubjectName {
        &self.subject
    }

    /// Requested SANs in order.
    #[must_use]
    pub fn sans(&self) -> &[SubjectAltName] {
        &self.sans
    }

    /// Renders the OpenSSL `req` configuration describing this request.
    #[must_use]
    pub fn options_cnf(&self, key_bits: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.node.name());
        let _ = writeln!(out, "[ req ]");
        let _ = writeln!(out, "default_bits = {key_bits}");
        let _ = writeln!(out, "prompt = no");
        let _ = writeln!(out, "default_md = sha256");
        let _ = writeln!(out, "distinguished_name = dn");
        let _ = writeln!(out, "req_extensions = ext");
        let _ = writeln!(out);
        let _ = writeln!(out, "[ dn ]");
        for attr in self.subject.attributes() {
            let _ = writeln!(out, "{} = {}", attr.config_key(), attr.value);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "[ ext ]");
        let _ = writeln!(out, "basicConstraints = CA:FALSE");
        let _ = writeln!(out, "keyUsage = critical, digitalSignature, keyEncipherment");
        let _ = writeln!(out, "extendedKeyUsage = serverAuth, clientAuth");
        let _ = writeln!(out, "subjectAltName = @alt_names");
        let _ = writeln!(out);
        let _ = writeln!(out, "[ alt_names ]");
        for (key, value) in san::numbered_entries(&self.sans) {
            let _ = writeln!(out, "{key} = {value}");
        }
        out
    }

    /// Builds the PEM certificate request signed by `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::San`], [`Error::Parse`] or [`Error::Generation`].
    pub fn build_csr(&self, key: &PrivateKey) -> Result<String> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.subject_alt_names = self
            .sans
            .iter()
            .map(SubjectAltName::to_rcgen)
            .collect::<Result<_>>()?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key_pair = key.to_key_pair()?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Generation(format!("failed to build request for {}: {e}", self.node.name())))?;
        let der = der::replace_request_subject(csr.der().as_ref(), &self.subject.to_der(), key)?;
        Ok(pem::encode(pem::CERTIFICATE_REQUEST, &der))
    }
}

/// Key-usage bits relevant to node certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBits {
    /// `digitalSignature`.
    pub digital_signature: bool,
    /// `keyEncipherment`.
    pub key_encipherment: bool,
    /// EKU `serverAuth`.
    pub server_auth: bool,
    /// EKU `clientAuth`.
    pub client_auth: bool,
    /// A key-usage extension was present.
    pub has_key_usage: bool,
    /// An extended-key-usage extension was present.
    pub has_extended_key_usage: bool,
}

/// A parsed and signature-checked PKCS#10 request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Requested subject.
    pub subject: SubjectName,
    /// The subject exactly as encoded in the request.
    pub subject_der: Vec<u8>,
    /// Requested SANs in order.
    pub sans: Vec<SubjectAltName>,
    /// Requested usages.
    pub usage: UsageBits,
    /// Fingerprint of the requested public key.
    pub public_key: PublicKeyFingerprint,
    /// SHA-256 of the request DER.
    pub fingerprint: String,
}

impl RequestInfo {
    /// Parses a PEM request and checks its self-signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pem`] or [`Error::Parse`] for malformed requests and
    /// [`Error::DistinguishedName`] for unsupported subjects.
    pub fn from_pem(text: &str) -> Result<Self> {
        let blocks = pem::parse(text)?;
        let block = match blocks.as_slice() {
            [only] if only.label == pem::CERTIFICATE_REQUEST => only,
            _ => return Err(Error::Pem("expected exactly one CERTIFICATE REQUEST block".into())),
        };
        Self::from_der(&block.der)
    }

    /// Parses a DER request and checks its self-signature.
    ///
    /// # Errors
    ///
    /// As [`Self::from_pem`].
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, csr) = X509CertificationRequest::from_der(der)
            .map_err(|e| Error::Parse(format!("invalid certificate request: {e}")))?;
        csr.verify_signature()
            .map_err(|e| Error::Parse(format!("request signature does not verify: {e}")))?;

        let info = &csr.certification_request_info;
        let subject = SubjectName::from_x509(&info.subject)?;
        let mut sans = Vec::new();
        let mut usage = UsageBits::default();

        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                match ext {
                    ParsedExtension::SubjectAlternativeName(san) => {
                        sans.extend(san.general_names.iter().filter_map(general_name_to_san));
                    }
                    ParsedExtension::KeyUsage(ku) => {
                        usage.has_key_usage = true;
                        usage.digital_signature = ku.digital_signature();
                        usage.key_encipherment = ku.key_encipherment();
                    }
                    ParsedExtension::ExtendedKeyUsage(eku) => {
                        usage.has_extended_key_usage = true;
                        usage.server_auth = eku.server_auth;
                        usage.client_auth = eku.client_auth;
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            subject,
            subject_der: info.subject.as_raw().to_vec(),
            sans,
            usage,
            public_key: PublicKeyFingerprint::from_spki(&info.subject_pki),
            fingerprint: keys::sha256_hex(der),
        })
    }
}

/// Converts the SAN forms node certificates use; others are ignored.
pub(crate) fn general_name_to_san(name: &GeneralName<'_>) -> Option<SubjectAltName> {
    match name {
        GeneralName::DNSName(dns) => Some(SubjectAltName::Dns((*dns).to_string())),
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => {
                let octets: [u8; 4] = (*bytes).try_into().ok()?;
                Some(SubjectAltName::Ip(IpAddr::V4(Ipv4Addr::from(octets))))
            }
            16 => {
                let octets: [u8; 16] = (*bytes).try_into().ok()?;
                Some(SubjectAltName::Ip(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            _ => None,
        },
        _ => None,
    }
}

/// What happened to one node during a generation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequestOutcome {
    /// Registry name.
    pub node: String,
    /// Directory under the node tree.
    pub dir_name: String,
    /// A new key was generated.
    pub key_generated: bool,
    /// A new request was generated.
    pub csr_generated: bool,
}

/// Result of a generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    /// Per-node outcomes in registry order.
    pub nodes: Vec<NodeRequestOutcome>,
}

impl RequestSummary {
    /// Nodes that received a new key or request.
    #[must_use]
    pub fn generated(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.key_generated || n.csr_generated)
            .count()
    }
}

/// Paths and parameters shared by every per-node job.
#[derive(Debug, Clone)]
struct JobSettings {
    node_dir: PathBuf,
    queue_dir: PathBuf,
    key_bits: usize,
}

/// Generates (or reuses) the key, request and queue entry of one node.
///
/// # Errors
///
/// Returns the first key, request or I/O error for this node.
pub fn generate_node(
    request: &NodeRequest,
    node_dir: &Path,
    queue_dir: &Path,
    key_bits: usize,
) -> Result<NodeRequestOutcome> {
    let node = request.node();
    let dir = node_dir.join(node.dir_name());
    fs::create_dir_all(&dir).map_err(Error::io(&dir))?;

    fsutil::write_if_absent(
        &dir.join(OPTIONS_FILE),
        request.options_cnf(key_bits).as_bytes(),
        fsutil::PUBLIC_MODE,
    )?;

    let key_path = dir.join(KEY_FILE);
    let (key, key_generated) = if key_path.exists() {
        debug!(node = %node.name(), "reusing existing key");
        (PrivateKey::load(&key_path)?, false)
    } else {
        let key = PrivateKey::generate_rsa(key_bits)?;
        fsutil::write_if_absent(&key_path, key.pem().as_bytes(), fsutil::PRIVATE_MODE)?;
        (key, true)
    };

    let csr_path = dir.join(CSR_FILE);
    let (csr_pem, csr_generated) = if csr_path.exists() {
        debug!(node = %node.name(), "reusing existing request");
        (fsutil::read_required_text(&csr_path)?, false)
    } else {
        let csr = request.build_csr(&key)?;
        fsutil::write_if_absent(&csr_path, csr.as_bytes(), fsutil::PUBLIC_MODE)?;
        (csr, true)
    };

    let queued = queue_dir.join(format!("{}.{QUEUE_EXTENSION}", node.dir_name()));
    if fsutil::write_if_changed(&queued, csr_pem.as_bytes(), fsutil::PUBLIC_MODE)? == WriteOutcome::Written {
        debug!(node = %node.name(), path = %queued.display(), "queued request");
    }

    Ok(NodeRequestOutcome {
        node: node.name().to_string(),
        dir_name: node.dir_name().to_string(),
        key_generated,
        csr_generated,
    })
}

/// Generates keys and requests for every registry node.
///
/// Inputs are validated before anything is written: a missing template,
/// registry or unsupported key size leaves the filesystem untouched.
///
/// # Errors
///
/// Returns configuration errors up front, [`Error::EmptyBatch`] if the
/// registry lists no nodes, or the first per-node failure once every node
/// has been attempted.
pub async fn generate_all(cfg: &RequestConfig) -> Result<RequestSummary> {
    let template_text = cfg
        .dn_template
        .as_deref()
        .ok_or_else(|| Error::Config("a DN template is required".into()))?;
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&cfg.key_bits) {
        return Err(Error::Config(format!(
            "key size must be between {MIN_KEY_BITS} and {MAX_KEY_BITS} bits, got {}",
            cfg.key_bits
        )));
    }
    let registry = Registry::load(&cfg.registry)?;
    let template = DnTemplate::parse(template_text)?;
    if registry.is_empty() {
        warn!(path = %cfg.registry.display(), "registry lists no nodes");
        return Err(Error::EmptyBatch(format!(
            "registry {} lists no nodes",
            cfg.registry.display()
        )));
    }

    let requests = registry
        .into_iter()
        .map(|node| NodeRequest::new(node, &template, cfg.cluster_suffix.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    fs::create_dir_all(&cfg.node_dir).map_err(Error::io(&cfg.node_dir))?;
    fs::create_dir_all(&cfg.queue_dir).map_err(Error::io(&cfg.queue_dir))?;

    info!(
        nodes = requests.len(),
        workers = cfg.workers,
        node_dir = %cfg.node_dir.display(),
        "generating node requests"
    );

    let settings = Arc::new(JobSettings {
        node_dir: cfg.node_dir.clone(),
        queue_dir: cfg.queue_dir.clone(),
        key_bits: cfg.key_bits,
    });
    let results = pool::run_bounded(requests, cfg.workers, move |request: NodeRequest| {
        generate_node(&request, &settings.node_dir, &settings.queue_dir, settings.key_bits)
            .inspect_err(|e| warn!(node = %request.node().name(), error = %e, "request generation failed"))
    })
    .await;

    let mut summary = RequestSummary::default();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(outcome) => summary.nodes.push(outcome),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    info!(
        nodes = summary.nodes.len(),
        generated = summary.generated(),
        "node requests ready"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db1() -> NodeRequest {
        let node = NodeIdentity::new("db1.example.com", Vec::new()).unwrap();
        let template = DnTemplate::parse("O=Acme,OU=Infra,OU=SRE").unwrap();
        NodeRequest::new(node, &template, None).unwrap()
    }

    #[test]
    fn options_cnf_numbers_repeats_and_sans() {
        let cnf = db1().options_cnf(4096);
        let dn = cnf.split("[ dn ]").nth(1).unwrap().split("[ ext ]").next().unwrap();
        let dn_lines: Vec<_> = dn.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(dn_lines, ["O = Acme", "OU = Infra", "1.OU = SRE", "CN = db1"]);

        let alt = cnf.split("[ alt_names ]").nth(1).unwrap();
        let alt_lines: Vec<_> = alt.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(
            alt_lines,
            ["DNS.1 = db1", "DNS.2 = db1.example.com", "IP.1 = 127.0.0.1"]
        );
        assert!(cnf.contains("extendedKeyUsage = serverAuth, clientAuth"));
    }

    #[test]
    fn built_request_parses_back() {
        let request = db1();
        let ec = rcgen::KeyPair::generate().unwrap();
        let key = PrivateKey::from_pem(&ec.serialize_pem()).unwrap();
        let csr = request.build_csr(&key).unwrap();

        let info = RequestInfo::from_pem(&csr).unwrap();
        assert_eq!(info.subject.to_string(), "O=Acme, OU=Infra, OU=SRE, CN=db1");
        assert_eq!(info.sans, request.sans());
        assert!(info.usage.server_auth && info.usage.client_auth);
        assert!(info.usage.digital_signature && info.usage.key_encipherment);
        assert_eq!(info.public_key, key.public_fingerprint().unwrap());
        assert_eq!(info.fingerprint.len(), 64);
    }

    #[test]
    fn request_info_rejects_non_request_pem() {
        let cert = pem::encode(pem::CERTIFICATE, b"junk");
        assert!(matches!(RequestInfo::from_pem(&cert), Err(Error::Pem(_))));
        let junk = pem::encode(pem::CERTIFICATE_REQUEST, b"junk");
        assert!(matches!(RequestInfo::from_pem(&junk), Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn missing_registry_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RequestConfig {
            dn_template: Some("O=Acme".into()),
            registry: dir.path().join("absent.txt"),
            node_dir: dir.path().join("nodes"),
            queue_dir: dir.path().join("requests"),
            key_bits: MIN_KEY_BITS,
            ..RequestConfig::default()
        };
        assert!(matches!(generate_all(&cfg).await, Err(Error::MissingInput(_))));
        assert!(!cfg.node_dir.exists());
        assert!(!cfg.queue_dir.exists());
    }

    #[tokio::test]
    async fn registry_without_nodes_is_an_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("nodes.txt");
        fs::write(&registry, "\n# nothing\n\n").unwrap();
        let cfg = RequestConfig {
            dn_template: Some("O=Acme".into()),
            registry,
            node_dir: dir.path().join("nodes"),
            queue_dir: dir.path().join("requests"),
            key_bits: MIN_KEY_BITS,
            ..RequestConfig::default()
        };
        assert!(matches!(generate_all(&cfg).await, Err(Error::EmptyBatch(_))));
        assert!(!cfg.queue_dir.exists());
    }

    #[tokio::test]
    async fn missing_template_is_config_error() {
        let cfg = RequestConfig::default();
        assert!(matches!(generate_all(&cfg).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn generation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("nodes.txt");
        fs::write(&registry, "web*1.example.com\n").unwrap();
        let cfg = RequestConfig {
            dn_template: Some("O=Acme".into()),
            registry,
            node_dir: dir.path().join("nodes"),
            queue_dir: dir.path().join("requests"),
            key_bits: MIN_KEY_BITS,
            workers: 2,
            ..RequestConfig::default()
        };

        let first = generate_all(&cfg).await.unwrap();
        assert_eq!(first.generated(), 1);
        let node_dir = cfg.node_dir.join("web_1.example.com");
        let key_before = fs::read(node_dir.join(KEY_FILE)).unwrap();
        let csr_mtime = fs::metadata(node_dir.join(CSR_FILE)).unwrap().modified().unwrap();
        assert!(cfg.queue_dir.join("web_1.example.com.csr").exists());

        let second = generate_all(&cfg).await.unwrap();
        assert_eq!(second.generated(), 0);
        assert_eq!(fs::read(node_dir.join(KEY_FILE)).unwrap(), key_before);
        assert_eq!(
            fs::metadata(node_dir.join(CSR_FILE)).unwrap().modified().unwrap(),
            csr_mtime
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(node_dir.join(KEY_FILE)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, fsutil::PRIVATE_MODE);
        }
    }
}
