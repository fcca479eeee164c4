//! Certificate Authority management.
//!
//! A CA is a root level and, in two-tier mode, an intermediate level signed
//! by the root. Each level lives in its own directory:
//!
//! ```text
//! <ca_dir>/ca.key  ca.crt  ca.json  serial  index.txt
//! <ca_dir>/intermediate/ca.key  ca.csr  ca.crt  ca.json  serial  index.txt
//! <ca_dir>/chain.crt                      (intermediate, then root)
//! ```
//!
//! Every piece is created only when absent, so opening an existing CA never
//! changes it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x509_parser::parse_x509_certificate;

use crate::config::CaConfig;
use crate::der;
use crate::dn::{DnTemplate, SubjectName};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::keys::{PrivateKey, PublicKeyFingerprint};
use crate::ledger::{FileLedger, IssuanceLedger, LedgerEntry};
use crate::naming;
use crate::pem;
use crate::policy::SigningPolicy;
use crate::request::{RequestInfo, QUEUE_EXTENSION};

/// CA private key file.
pub const CA_KEY_FILE: &str = "ca.key";
/// CA certificate file; also the name of the anchor copied into batches.
pub const CA_CERT_FILE: &str = "ca.crt";
/// Persisted level configuration.
pub const CA_CONFIG_FILE: &str = "ca.json";
/// Intermediate request file.
pub const CA_CSR_FILE: &str = "ca.csr";
/// Intermediate level directory under the CA directory.
pub const INTERMEDIATE_DIR: &str = "intermediate";
/// Intermediate-then-root chain file.
pub const CHAIN_FILE: &str = "chain.crt";
/// Prefix of signed batch directories.
pub const BATCH_PREFIX: &str = "signed-";

const BATCH_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const SELF_SIGNED: &str = "-";
const INTERMEDIATE_NODE: &str = "intermediate CA";

/// Configuration persisted in each level's `ca.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Subject of the level's certificate.
    pub subject: String,
    /// Validity of the level's own certificate, in days.
    pub ca_validity_days: u32,
    /// Policy applied to node requests.
    pub policy: SigningPolicy,
    /// Policy applied when this level signs a subordinate CA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subordinate_policy: Option<SigningPolicy>,
}

/// A freshly signed certificate.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM encoding.
    pub pem: String,
    /// Serial from the issuing level's counter.
    pub serial: u64,
    /// Subject as recorded in the ledger.
    pub subject: String,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

/// One CA level: key, certificate, ledger and policy.
pub struct CaLevel {
    dir: PathBuf,
    key: PrivateKey,
    cert_pem: String,
    subject: SubjectName,
    subject_der: Vec<u8>,
    ledger: FileLedger,
    config: LevelConfig,
}

impl CaLevel {
    /// Opens the root level in `dir`, creating whatever is missing.
    ///
    /// # Errors
    ///
    /// Returns configuration, key generation, signing or ledger errors.
    pub fn bootstrap_root(dir: &Path, subject: &SubjectName, cfg: &CaConfig) -> Result<Self> {
        fs::create_dir_all(dir).map_err(Error::io(dir))?;
        let key = load_or_generate_key(dir, cfg.key_bits)?;
        let ledger = FileLedger::open(dir)?.with_lock_timeout(cfg.lock_timeout());
        let config = load_or_write_config(
            dir,
            LevelConfig {
                subject: subject.to_string(),
                ca_validity_days: cfg.ca_validity_days,
                policy: SigningPolicy::leaf(),
                subordinate_policy: Some(SigningPolicy::intermediate()),
            },
        )?;

        let cert_path = dir.join(CA_CERT_FILE);
        if !cert_path.exists() {
            let issued = self_sign(&key, subject, cfg.ca_validity_days, &ledger)?;
            fsutil::write_if_absent(&cert_path, issued.pem.as_bytes(), fsutil::PUBLIC_MODE)?;
            info!(serial = issued.serial, subject = %issued.subject, "created root CA certificate");
        }
        Self::load(dir.to_path_buf(), key, ledger, config)
    }

    /// Opens the intermediate level in `dir`, creating its key, request and
    /// certificate (signed by `root`) when missing.
    ///
    /// # Errors
    ///
    /// Returns configuration, key generation, policy, signing or ledger errors.
    pub fn bootstrap_intermediate(
        dir: &Path,
        subject: &SubjectName,
        root: &Self,
        cfg: &CaConfig,
    ) -> Result<Self> {
        fs::create_dir_all(dir).map_err(Error::io(dir))?;
        let key = load_or_generate_key(dir, cfg.key_bits)?;
        let ledger = FileLedger::open(dir)?.with_lock_timeout(cfg.lock_timeout());
        let config = load_or_write_config(
            dir,
            LevelConfig {
                subject: subject.to_string(),
                ca_validity_days: cfg.ca_validity_days,
                policy: SigningPolicy::leaf(),
                subordinate_policy: None,
            },
        )?;

        let csr_path = dir.join(CA_CSR_FILE);
        if !csr_path.exists() {
            let mut params = CertificateParams::default();
            // Basic constraints are applied by the root when it signs.
            params.distinguished_name = DistinguishedName::new();
            let csr = params
                .serialize_request(&key.to_key_pair()?)
                .map_err(|e| Error::Generation(format!("failed to build intermediate request: {e}")))?;
            let csr = der::replace_request_subject(csr.der().as_ref(), &subject.to_der(), &key)?;
            let csr = pem::encode(pem::CERTIFICATE_REQUEST, &csr);
            fsutil::write_if_absent(&csr_path, csr.as_bytes(), fsutil::PUBLIC_MODE)?;
            debug!(path = %csr_path.display(), "wrote intermediate request");
        }

        let cert_path = dir.join(CA_CERT_FILE);
        if !cert_path.exists() {
            let csr_pem = fsutil::read_required_text(&csr_path)?;
            let issued = root.sign_subordinate(&csr_pem, cfg.ca_validity_days)?;
            fsutil::write_if_absent(&cert_path, issued.pem.as_bytes(), fsutil::PUBLIC_MODE)?;
            info!(serial = issued.serial, subject = %issued.subject, "created intermediate CA certificate");
        }
        Self::load(dir.to_path_buf(), key, ledger, config)
    }

    fn load(dir: PathBuf, key: PrivateKey, ledger: FileLedger, config: LevelConfig) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let cert_pem = fsutil::read_required_text(&cert_path)?;
        let der = first_certificate(&cert_pem)?;
        let (_, cert) = parse_x509_certificate(&der)
            .map_err(|e| Error::Parse(format!("invalid CA certificate {}: {e}", cert_path.display())))?;

        if PublicKeyFingerprint::from_spki(cert.public_key()) != key.public_fingerprint()? {
            return Err(Error::Config(format!(
                "{} does not match {}",
                dir.join(CA_KEY_FILE).display(),
                cert_path.display()
            )));
        }
        let subject = SubjectName::from_x509(cert.subject())?;
        let subject_der = cert.subject().as_raw().to_vec();
        Ok(Self {
            dir,
            key,
            cert_pem,
            subject,
            subject_der,
            ledger,
            config,
        })
    }

    /// Level directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// PEM certificate of this level.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Subject of this level's certificate.
    #[must_use]
    pub const fn subject(&self) -> &SubjectName {
        &self.subject
    }

    /// Issuance ledger.
    #[must_use]
    pub const fn ledger(&self) -> &FileLedger {
        &self.ledger
    }

    /// Persisted level configuration.
    #[must_use]
    pub const fn config(&self) -> &LevelConfig {
        &self.config
    }

    /// Signs a node request, copying its subject and requested extensions
    /// unchanged. Only basic constraints, serial, validity and the issuer's
    /// key identifier are set by the CA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] if the subject violates this level's policy
    /// and [`Error::Signing`] (naming `node`) for any other failure,
    /// including a requested extension that cannot be copied.
    pub fn sign_request(
        &self,
        csr_pem: &str,
        info: &RequestInfo,
        node: &str,
        validity_days: u32,
    ) -> Result<IssuedCertificate> {
        self.config.policy.check(&info.subject).map_err(|reason| Error::Policy {
            node: node.to_string(),
            reason,
        })?;
        let signing_error = |reason: String| Error::Signing {
            node: node.to_string(),
            reason,
        };

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| signing_error(format!("unsupported or unreadable request: {e}")))?;
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.use_authority_key_identifier_extension = true;

        let (issuer, issuer_key) = self.issuer()?;
        let subject = info.subject.to_string();
        let fingerprint = info.fingerprint.clone();

        self.ledger.issue(|serial| {
            let (not_before, not_after) = validity_window(validity_days)?;
            csr.params.serial_number = Some(SerialNumber::from(serial));
            csr.params.not_before = to_rcgen_time(not_before)?;
            csr.params.not_after = to_rcgen_time(not_after)?;

            let cert = csr
                .signed_by(&issuer, &issuer_key)
                .map_err(|e| signing_error(e.to_string()))?;
            let der = der::replace_certificate_names(
                cert.der().as_ref(),
                &self.subject_der,
                &info.subject_der,
                &self.key,
            )
            .map_err(|e| signing_error(e.to_string()))?;
            let issued = IssuedCertificate {
                pem: pem::encode(pem::CERTIFICATE, &der),
                serial,
                subject: subject.clone(),
                not_after,
            };
            let entry = LedgerEntry {
                serial,
                not_after,
                request_fingerprint: fingerprint,
                subject,
            };
            Ok((issued, entry))
        })
    }

    /// Signs a subordinate CA request with path length 0.
    fn sign_subordinate(&self, csr_pem: &str, validity_days: u32) -> Result<IssuedCertificate> {
        let info = RequestInfo::from_pem(csr_pem)?;
        let policy = self
            .config
            .subordinate_policy
            .clone()
            .unwrap_or_else(SigningPolicy::intermediate);
        policy.check(&info.subject).map_err(|reason| Error::Policy {
            node: INTERMEDIATE_NODE.to_string(),
            reason,
        })?;

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::Parse(format!("unreadable intermediate request: {e}")))?;
        csr.params.subject_alt_names = Vec::new();
        csr.params.extended_key_usages = Vec::new();
        csr.params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        csr.params.key_usages = ca_key_usages();
        csr.params.use_authority_key_identifier_extension = true;

        let (issuer, issuer_key) = self.issuer()?;
        let subject = info.subject.to_string();
        self.ledger.issue(|serial| {
            let (not_before, not_after) = validity_window(validity_days)?;
            csr.params.serial_number = Some(SerialNumber::from(serial));
            csr.params.not_before = to_rcgen_time(not_before)?;
            csr.params.not_after = to_rcgen_time(not_after)?;
            let cert = csr
                .signed_by(&issuer, &issuer_key)
                .map_err(|e| Error::Generation(format!("failed to sign intermediate: {e}")))?;
            let der = der::replace_certificate_names(
                cert.der().as_ref(),
                &self.subject_der,
                &info.subject_der,
                &self.key,
            )?;
            Ok((
                IssuedCertificate {
                    pem: pem::encode(pem::CERTIFICATE, &der),
                    serial,
                    subject: subject.clone(),
                    not_after,
                },
                LedgerEntry {
                    serial,
                    not_after,
                    request_fingerprint: info.fingerprint.clone(),
                    subject,
                },
            ))
        })
    }

    /// Rebuilds the rcgen issuer from the stored certificate.
    ///
    /// Its name is lossy; signed output gets the stored subject bytes.
    fn issuer(&self) -> Result<(rcgen::Certificate, KeyPair)> {
        let key_pair = self.key.to_key_pair()?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| Error::Parse(format!("failed to load CA certificate: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Generation(format!("failed to create issuer cert: {e}")))?;
        Ok((cert, key_pair))
    }
}

impl std::fmt::Debug for CaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaLevel")
            .field("dir", &self.dir)
            .field("subject", &self.subject.to_string())
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Certificate Authority: a root and an optional intermediate.
#[derive(Debug)]
pub struct CertificateAuthority {
    ca_dir: PathBuf,
    root: CaLevel,
    intermediate: Option<CaLevel>,
}

impl CertificateAuthority {
    /// Establishes or reuses the CA described by `cfg`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for a bad DN template or key size, and
    /// any bootstrap failure.
    pub fn open(cfg: &CaConfig) -> Result<Self> {
        let template = DnTemplate::parse(&cfg.dn_template)?;
        let root_subject = template.subject_for(&cfg.common_name)?;
        let root = CaLevel::bootstrap_root(&cfg.ca_dir, &root_subject, cfg)?;

        let intermediate = if cfg.intermediate {
            let subject = template.subject_for(&cfg.intermediate_common_name)?;
            let level =
                CaLevel::bootstrap_intermediate(&cfg.ca_dir.join(INTERMEDIATE_DIR), &subject, &root, cfg)?;
            let chain = format!("{}{}", level.cert_pem(), root.cert_pem());
            fsutil::write_if_changed(&cfg.ca_dir.join(CHAIN_FILE), chain.as_bytes(), fsutil::PUBLIC_MODE)?;
            Some(level)
        } else {
            None
        };

        Ok(Self {
            ca_dir: cfg.ca_dir.clone(),
            root,
            intermediate,
        })
    }

    /// CA state directory.
    #[must_use]
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Root level.
    #[must_use]
    pub const fn root(&self) -> &CaLevel {
        &self.root
    }

    /// Intermediate level, in two-tier mode.
    #[must_use]
    pub const fn intermediate(&self) -> Option<&CaLevel> {
        self.intermediate.as_ref()
    }

    /// Level that signs node requests.
    #[must_use]
    pub fn signing_level(&self) -> &CaLevel {
        self.intermediate.as_ref().unwrap_or(&self.root)
    }

    /// Effective trust anchor: the root, or the intermediate followed by the root.
    #[must_use]
    pub fn anchor_pem(&self) -> String {
        match &self.intermediate {
            Some(level) => format!("{}{}", level.cert_pem(), self.root.cert_pem()),
            None => self.root.cert_pem().to_string(),
        }
    }
}

/// One certificate written into a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    /// Node directory name (request file stem).
    pub node: String,
    /// Assigned serial.
    pub serial: u64,
    /// Certificate subject.
    pub subject: String,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

/// Result of a signing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignSummary {
    /// New batch directory.
    pub batch_dir: PathBuf,
    /// Certificates in the batch, in request order.
    pub signed: Vec<SignedEntry>,
}

struct PendingRequest {
    node: String,
    pem: String,
    info: RequestInfo,
}

/// Signs every pending request in the queue into a new batch directory.
///
/// All requests are parsed and checked against the signing policy before
/// the first one is signed, so an invalid request never leaves a partial
/// batch behind.
///
/// # Errors
///
/// Returns [`Error::MissingInput`] if the queue does not exist,
/// [`Error::EmptyBatch`] if nothing is pending, [`Error::Policy`] or
/// [`Error::Signing`] naming the offending node, or CA errors.
pub fn sign_pending(cfg: &CaConfig) -> Result<SignSummary> {
    if !cfg.queue_dir.is_dir() {
        return Err(Error::MissingInput(cfg.queue_dir.clone()));
    }
    let ca = CertificateAuthority::open(cfg)?;
    let level = ca.signing_level();

    let signed: HashSet<String> = level
        .ledger()
        .entries()?
        .into_iter()
        .map(|e| e.request_fingerprint)
        .collect();

    let mut pending = Vec::new();
    for (node, path) in queued_requests(&cfg.queue_dir)? {
        let pem = fsutil::read_required_text(&path)?;
        let info = RequestInfo::from_pem(&pem).map_err(|e| Error::Signing {
            node: node.clone(),
            reason: e.to_string(),
        })?;
        level.config().policy.check(&info.subject).map_err(|reason| Error::Policy {
            node: node.clone(),
            reason,
        })?;
        if !cfg.resign && signed.contains(&info.fingerprint) {
            debug!(node = %node, "request already signed");
            continue;
        }
        pending.push(PendingRequest { node, pem, info });
    }

    if pending.is_empty() {
        warn!(queue = %cfg.queue_dir.display(), "no pending certificate requests");
        return Err(Error::EmptyBatch(format!(
            "no pending requests in {}",
            cfg.queue_dir.display()
        )));
    }

    let batch_dir = create_batch_dir(&cfg.out_dir, Utc::now())?;
    fsutil::write_if_absent(
        &batch_dir.join(CA_CERT_FILE),
        ca.anchor_pem().as_bytes(),
        fsutil::PUBLIC_MODE,
    )?;

    let mut summary = SignSummary {
        batch_dir: batch_dir.clone(),
        signed: Vec::with_capacity(pending.len()),
    };
    for request in pending {
        let issued = level.sign_request(&request.pem, &request.info, &request.node, cfg.validity_days)?;
        let out = batch_dir.join(format!("{}.crt", request.node));
        fsutil::write_if_absent(&out, issued.pem.as_bytes(), fsutil::PUBLIC_MODE)?;
        info!(node = %request.node, serial = issued.serial, "signed certificate");
        summary.signed.push(SignedEntry {
            node: request.node,
            serial: issued.serial,
            subject: issued.subject,
            not_after: issued.not_after,
        });
    }

    info!(
        batch = %batch_dir.display(),
        certificates = summary.signed.len(),
        "signing batch complete"
    );
    Ok(summary)
}

/// Queued `*.csr` files as `(stem, path)`, sorted by stem.
fn queued_requests(queue_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(queue_dir).map_err(Error::io(queue_dir))? {
        let path = entry.map_err(Error::io(queue_dir))?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(QUEUE_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !naming::is_usable_dir_name(stem) || naming::sanitize(stem) != stem {
            warn!(path = %path.display(), "skipping request with an unsafe node name");
            continue;
        }
        out.push((stem.to_string(), path));
    }
    out.sort();
    Ok(out)
}

/// Creates `<out_dir>/signed-<timestamp>`, adding `-n` if that already exists.
fn create_batch_dir(out_dir: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).map_err(Error::io(out_dir))?;
    let base = format!("{BATCH_PREFIX}{}", now.format(BATCH_TIME_FORMAT));
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        let path = out_dir.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(Error::io(&path)(e)),
        }
    }
}

fn load_or_generate_key(dir: &Path, bits: usize) -> Result<PrivateKey> {
    let path = dir.join(CA_KEY_FILE);
    if path.exists() {
        return PrivateKey::load(&path);
    }
    let key = PrivateKey::generate_rsa(bits)?;
    fsutil::write_if_absent(&path, key.pem().as_bytes(), fsutil::PRIVATE_MODE)?;
    info!(path = %path.display(), bits, "generated CA key");
    Ok(key)
}

fn load_or_write_config(dir: &Path, fresh: LevelConfig) -> Result<LevelConfig> {
    let path = dir.join(CA_CONFIG_FILE);
    if path.exists() {
        let text = fsutil::read_required_text(&path)?;
        return serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid {}: {e}", path.display())));
    }
    let json = serde_json::to_string_pretty(&fresh)?;
    fsutil::write_if_absent(&path, json.as_bytes(), fsutil::PUBLIC_MODE)?;
    Ok(fresh)
}

fn self_sign(
    key: &PrivateKey,
    subject: &SubjectName,
    validity_days: u32,
    ledger: &FileLedger,
) -> Result<IssuedCertificate> {
    let key_pair = key.to_key_pair()?;
    let name = subject.to_der();
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = ca_key_usages();

    ledger.issue(|serial| {
        let (not_before, not_after) = validity_window(validity_days)?;
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = to_rcgen_time(not_before)?;
        params.not_after = to_rcgen_time(not_after)?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Generation(format!("failed to generate root certificate: {e}")))?;
        let der = der::replace_certificate_names(cert.der().as_ref(), &name, &name, key)?;
        Ok((
            IssuedCertificate {
                pem: pem::encode(pem::CERTIFICATE, &der),
                serial,
                subject: subject.to_string(),
                not_after,
            },
            LedgerEntry {
                serial,
                not_after,
                request_fingerprint: SELF_SIGNED.to_string(),
                subject: subject.to_string(),
            },
        ))
    })
}

fn ca_key_usages() -> Vec<KeyUsagePurpose> {
    vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ]
}

fn first_certificate(text: &str) -> Result<Vec<u8>> {
    pem::certificates(text)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Pem("no certificate found".into()))
}

/// `[now, now + days]`, truncated to whole seconds.
fn validity_window(days: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let now = DateTime::from_timestamp(Utc::now().timestamp(), 0)
        .ok_or_else(|| Error::Generation("clock out of range".into()))?;
    Ok((now, now + Duration::days(i64::from(days))))
}

/// Converts a chrono `DateTime` to rcgen `OffsetDateTime`.
fn to_rcgen_time(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Generation(format!("invalid timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MIN_KEY_BITS;
    use crate::registry::NodeIdentity;
    use crate::request::NodeRequest;
    use rcgen::{CustomExtension, DnType, ExtendedKeyUsagePurpose, SanType};
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::X509Certificate;

    fn config(root: &Path) -> CaConfig {
        CaConfig {
            ca_dir: root.join("ca"),
            queue_dir: root.join("requests"),
            out_dir: root.join("signed"),
            key_bits: MIN_KEY_BITS,
            ..CaConfig::default()
        }
    }

    fn node_csr(name: &str, template: &str) -> String {
        let node = NodeIdentity::new(name, Vec::new()).unwrap();
        let request = NodeRequest::new(node, &DnTemplate::parse(template).unwrap(), None).unwrap();
        let key = PrivateKey::from_pem(&rcgen::KeyPair::generate().unwrap().serialize_pem()).unwrap();
        request.build_csr(&key).unwrap()
    }

    fn queue(cfg: &CaConfig, stem: &str, csr: &str) {
        fs::create_dir_all(&cfg.queue_dir).unwrap();
        fs::write(cfg.queue_dir.join(format!("{stem}.csr")), csr).unwrap();
    }

    fn with_cert<R>(pem_text: &str, f: impl FnOnce(&X509Certificate<'_>) -> R) -> R {
        let der = first_certificate(pem_text).unwrap();
        let (_, cert) = parse_x509_certificate(&der).unwrap();
        f(&cert)
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let first = CertificateAuthority::open(&cfg).unwrap();
        let cert_before = fs::read(cfg.ca_dir.join(CA_CERT_FILE)).unwrap();
        let serial_before = first.root().ledger().next_serial().unwrap();
        assert_eq!(serial_before, 2);
        assert!(cfg.ca_dir.join(CA_CONFIG_FILE).exists());

        let second = CertificateAuthority::open(&cfg).unwrap();
        assert_eq!(fs::read(cfg.ca_dir.join(CA_CERT_FILE)).unwrap(), cert_before);
        assert_eq!(second.root().ledger().next_serial().unwrap(), serial_before);
        assert_eq!(second.root().subject().to_string(), "O=Clawbernetes, CN=Clawbernetes Node Root CA");

        with_cert(second.root().cert_pem(), |cert| {
            assert_eq!(cert.subject().as_raw(), cert.issuer().as_raw());
            assert!(cert.basic_constraints().unwrap().unwrap().value.ca);
        });
    }

    #[test]
    fn signs_with_copied_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let ca = CertificateAuthority::open(&cfg).unwrap();

        let csr = node_csr("db1.example.com", "O=Acme,OU=Infra,OU=SRE");
        let info = RequestInfo::from_pem(&csr).unwrap();
        let issued = ca.root().sign_request(&csr, &info, "db1.example.com", 30).unwrap();
        assert_eq!(issued.serial, 2);
        assert_eq!(issued.subject, "O=Acme, OU=Infra, OU=SRE, CN=db1");

        with_cert(&issued.pem, |cert| {
            assert_eq!(cert.issuer().as_raw(), with_cert(ca.root().cert_pem(), |ca| ca.subject().as_raw().to_vec()).as_slice());
            let eku = cert.extended_key_usage().unwrap().unwrap().value;
            assert!(eku.server_auth && eku.client_auth);
            let ku = cert.key_usage().unwrap().unwrap().value;
            assert!(ku.digital_signature() && ku.key_encipherment());
            assert!(!cert.basic_constraints().unwrap().is_some_and(|bc| bc.value.ca));
            assert_eq!(SubjectName::from_x509(cert.subject()).unwrap(), info.subject);
        });
        assert!(ca.root().ledger().has_signed(&info.fingerprint).unwrap());
    }

    fn custom_csr(sans: Vec<String>, edit: impl FnOnce(&mut CertificateParams)) -> String {
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::OrganizationName, "Acme");
        params.distinguished_name.push(DnType::CommonName, "n1");
        edit(&mut params);
        let key = rcgen::KeyPair::generate().unwrap();
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn requested_extensions_are_copied_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(&config(dir.path())).unwrap();

        let csr = custom_csr(vec!["n1".to_string()], |params| {
            params
                .subject_alt_names
                .push(SanType::URI("spiffe://c/n1".try_into().unwrap()));
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyAgreement];
            params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::CodeSigning,
            ];
        });
        let info = RequestInfo::from_pem(&csr).unwrap();
        let issued = ca.root().sign_request(&csr, &info, "n1", 30).unwrap();

        with_cert(&issued.pem, |cert| {
            let san = cert.subject_alternative_name().unwrap().unwrap().value;
            assert!(matches!(
                san.general_names.as_slice(),
                [GeneralName::DNSName("n1"), GeneralName::URI("spiffe://c/n1")]
            ));
            let ku = cert.key_usage().unwrap().unwrap().value;
            assert!(ku.digital_signature() && ku.key_agreement());
            assert!(!ku.key_encipherment());
            let eku = cert.extended_key_usage().unwrap().unwrap().value;
            assert!(eku.server_auth && eku.client_auth && eku.code_signing);
            assert!(!eku.email_protection);
        });
    }

    #[test]
    fn uncopyable_extension_fails_naming_node() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(&config(dir.path())).unwrap();

        let csr = custom_csr(vec!["n1".to_string()], |params| {
            params.custom_extensions = vec![CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 99999, 1],
                vec![0x05, 0x00],
            )];
        });
        let info = RequestInfo::from_pem(&csr).unwrap();
        match ca.root().sign_request(&csr, &info, "n1", 30) {
            Err(Error::Signing { node, .. }) => assert_eq!(node, "n1"),
            other => panic!("expected signing error, got {other:?}"),
        }
        assert_eq!(ca.root().ledger().next_serial().unwrap(), 2);
    }

    #[test]
    fn repeated_attributes_survive_signing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaConfig {
            dn_template: "O=Acme,OU=Infra,OU=SRE,OU=Oncall".into(),
            intermediate: true,
            ..config(dir.path())
        };
        let ca = CertificateAuthority::open(&cfg).unwrap();
        let level = ca.signing_level();
        assert_eq!(
            level.subject().to_string(),
            format!("O=Acme, OU=Infra, OU=SRE, OU=Oncall, CN={}", cfg.intermediate_common_name)
        );

        let csr = node_csr("db1.example.com", "O=Acme,OU=Infra,OU=SRE,OU=Oncall");
        let info = RequestInfo::from_pem(&csr).unwrap();
        assert_eq!(info.subject.to_string(), "O=Acme, OU=Infra, OU=SRE, OU=Oncall, CN=db1");
        let issued = level.sign_request(&csr, &info, "db1.example.com", 30).unwrap();

        with_cert(&issued.pem, |cert| {
            assert_eq!(SubjectName::from_x509(cert.subject()).unwrap(), info.subject);
            assert_eq!(cert.subject().as_raw(), info.subject_der.as_slice());
            with_cert(level.cert_pem(), |issuer| {
                assert_eq!(cert.issuer().as_raw(), issuer.subject().as_raw());
                assert!(cert.verify_signature(Some(issuer.public_key())).is_ok());
            });
        });
        with_cert(level.cert_pem(), |intermediate| {
            with_cert(ca.root().cert_pem(), |root| {
                assert_eq!(intermediate.issuer().as_raw(), root.subject().as_raw());
                assert!(intermediate.verify_signature(Some(root.public_key())).is_ok());
                assert!(root.verify_signature(None).is_ok());
            });
        });
    }

    #[test]
    fn policy_violation_names_node() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let ca = CertificateAuthority::open(&cfg).unwrap();

        let csr = node_csr("n1.example.com", "OU=NoOrg");
        let info = RequestInfo::from_pem(&csr).unwrap();
        match ca.root().sign_request(&csr, &info, "n1.example.com", 30) {
            Err(Error::Policy { node, .. }) => assert_eq!(node, "n1.example.com"),
            other => panic!("expected policy error, got {other:?}"),
        }
        assert_eq!(ca.root().ledger().next_serial().unwrap(), 2);
    }

    #[test]
    fn intermediate_signs_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaConfig {
            intermediate: true,
            ..config(dir.path())
        };
        let ca = CertificateAuthority::open(&cfg).unwrap();
        let intermediate = ca.intermediate().unwrap();
        assert_eq!(ca.signing_level().dir(), intermediate.dir());
        assert!(cfg.ca_dir.join(INTERMEDIATE_DIR).join(CA_CSR_FILE).exists());

        with_cert(intermediate.cert_pem(), |cert| {
            let bc = cert.basic_constraints().unwrap().unwrap().value;
            assert!(bc.ca);
            assert_eq!(bc.path_len_constraint, Some(0));
            assert_eq!(cert.issuer().to_string(), with_cert(ca.root().cert_pem(), |r| r.subject().to_string()));
        });

        let chain = fs::read_to_string(cfg.ca_dir.join(CHAIN_FILE)).unwrap();
        assert_eq!(chain, ca.anchor_pem());
        assert_eq!(pem::certificates(&chain).unwrap().len(), 2);

        // Root ledger holds its own certificate and the intermediate.
        assert_eq!(ca.root().ledger().entries().unwrap().len(), 2);

        let reopened = CertificateAuthority::open(&cfg).unwrap();
        assert_eq!(reopened.intermediate().unwrap().cert_pem(), intermediate.cert_pem());
    }

    #[test]
    fn sign_pending_requires_queue() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        assert!(matches!(sign_pending(&cfg), Err(Error::MissingInput(_))));
        assert!(!cfg.ca_dir.exists());
    }

    #[test]
    fn sign_pending_writes_batch_then_reports_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        queue(&cfg, "a.example.com", &node_csr("a.example.com", "O=Acme"));
        queue(&cfg, "b.example.com", &node_csr("b.example.com", "O=Acme"));

        let summary = sign_pending(&cfg).unwrap();
        let serials: Vec<_> = summary.signed.iter().map(|s| s.serial).collect();
        assert_eq!(serials, [2, 3]);
        assert!(summary.batch_dir.join(CA_CERT_FILE).exists());
        assert!(summary.batch_dir.join("a.example.com.crt").exists());
        assert!(summary
            .batch_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(BATCH_PREFIX));

        assert!(matches!(sign_pending(&cfg), Err(Error::EmptyBatch(_))));

        let resigned = sign_pending(&CaConfig { resign: true, ..cfg.clone() }).unwrap();
        assert_ne!(resigned.batch_dir, summary.batch_dir);
        let serials: Vec<_> = resigned.signed.iter().map(|s| s.serial).collect();
        assert_eq!(serials, [4, 5]);
    }

    #[test]
    fn invalid_request_aborts_before_signing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        queue(&cfg, "good.example.com", &node_csr("good.example.com", "O=Acme"));
        queue(&cfg, "bad.example.com", &node_csr("bad.example.com", "L=Nowhere"));

        match sign_pending(&cfg) {
            Err(Error::Policy { node, .. }) => assert_eq!(node, "bad.example.com"),
            other => panic!("expected policy error, got {other:?}"),
        }
        assert!(!cfg.out_dir.exists());
        let ledger = FileLedger::open(&cfg.ca_dir).unwrap();
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }

    #[test]
    fn batch_dirs_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let a = create_batch_dir(dir.path(), now).unwrap();
        let b = create_batch_dir(dir.path(), now).unwrap();
        assert_ne!(a, b);
        assert!(b.to_string_lossy().ends_with("-1"));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        CertificateAuthority::open(&cfg).unwrap();
        let other = PrivateKey::generate_rsa(MIN_KEY_BITS).unwrap();
        fs::write(cfg.ca_dir.join(CA_KEY_FILE), other.pem()).unwrap();
        assert!(matches!(CertificateAuthority::open(&cfg), Err(Error::Config(_))));
    }
}
