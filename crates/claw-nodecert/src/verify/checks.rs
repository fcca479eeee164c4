//! Per-node checks.
//!
//! Each check takes the node's artifacts as loaded text and returns a
//! [`CheckResult`]; nothing here returns an error. A check whose input is
//! missing fails with a message saying so.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use super::chain::{self, TrustAnchor};
use super::report::{CheckResult, CheckStatus};
use crate::arrange::{BUNDLE_FILE, CERT_FILE};
use crate::keys::{self, PrivateKey, PublicKeyFingerprint};
use crate::naming;
use crate::pem::{self, PemBlock, PemScan};
use crate::request::{RequestInfo, CSR_FILE, KEY_FILE};

/// Required artifacts are present.
pub const ARTIFACTS: &str = "artifacts";
/// Private key matches the leaf certificate.
pub const KEY_MATCHES_CERT: &str = "key-matches-cert";
/// Request (if kept) matches the private key.
pub const CSR_MATCHES_KEY: &str = "csr-matches-key";
/// Leaf chains to the anchor.
pub const CHAIN: &str = "chain";
/// Bundle is one key followed by certificates.
pub const BUNDLE_STRUCTURE: &str = "bundle-structure";
/// Key usage and extended key usage.
pub const USAGE: &str = "usage";
/// Validity windows.
pub const VALIDITY: &str = "validity";
/// Every bundle certificate chains to the anchor.
pub const BUNDLE_CHAIN: &str = "bundle-chain";
/// Subject alternative names.
pub const SAN: &str = "san";
/// PEM markers and certificate encodings.
pub const PEM_STRUCTURE: &str = "pem-structure";
/// No certificate appears twice in the bundle.
pub const DUPLICATES: &str = "duplicates";

/// Artifacts of one node directory, read once.
#[derive(Debug, Clone, Default)]
pub struct NodeArtifacts {
    /// Node directory name.
    pub dir_name: String,
    /// Registry name; `None` when no registry resolves the directory.
    pub node_name: Option<String>,
    /// `node.key` text.
    pub key: Option<String>,
    /// `node.crt` text.
    pub cert: Option<String>,
    /// `node.csr` text.
    pub csr: Option<String>,
    /// `web.pem` text.
    pub bundle: Option<String>,
    /// Files that exist but could not be read.
    pub unreadable: Vec<String>,
}

impl NodeArtifacts {
    /// Reads whatever artifacts exist in `dir`.
    #[must_use]
    pub fn load(dir: &Path, dir_name: &str, node_name: Option<&str>) -> Self {
        let mut unreadable = Vec::new();
        let mut read = |file: &str| match fs::read_to_string(dir.join(file)) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                unreadable.push(format!("{file}: {e}"));
                None
            }
        };
        let key = read(KEY_FILE);
        let cert = read(CERT_FILE);
        let csr = read(CSR_FILE);
        let bundle = read(BUNDLE_FILE);
        Self {
            dir_name: dir_name.to_string(),
            node_name: node_name.map(str::to_string),
            key,
            cert,
            csr,
            bundle,
            unreadable,
        }
    }

    /// DER of the first certificate in `node.crt`.
    fn leaf(&self) -> Result<Vec<u8>, String> {
        let text = self.cert.as_deref().ok_or_else(|| missing(CERT_FILE))?;
        pem::scan(text)
            .certificates()
            .next()
            .map(|b| b.der.clone())
            .ok_or_else(|| format!("{CERT_FILE} holds no certificate"))
    }

    fn key_fingerprint(&self) -> Result<PublicKeyFingerprint, String> {
        let text = self.key.as_deref().ok_or_else(|| missing(KEY_FILE))?;
        PrivateKey::from_pem(text)
            .and_then(|k| k.public_fingerprint())
            .map_err(|e| format!("{KEY_FILE}: {e}"))
    }
}

fn missing(file: &str) -> String {
    format!("not checked: {file} is missing")
}

/// Check 0: `node.key`, `node.crt` and `web.pem` exist.
#[must_use]
pub fn artifacts(a: &NodeArtifacts) -> CheckResult {
    let mut absent: Vec<&str> = Vec::new();
    if a.key.is_none() {
        absent.push(KEY_FILE);
    }
    if a.cert.is_none() {
        absent.push(CERT_FILE);
    }
    if a.bundle.is_none() {
        absent.push(BUNDLE_FILE);
    }
    if !a.unreadable.is_empty() {
        return CheckResult::fail(ARTIFACTS, format!("unreadable: {}", a.unreadable.join("; ")));
    }
    if absent.is_empty() {
        CheckResult::pass(ARTIFACTS, "all artifacts present")
    } else {
        CheckResult::fail(ARTIFACTS, format!("missing {}", absent.join(", ")))
    }
}

/// Check 1: the private key belongs to the leaf certificate.
#[must_use]
pub fn key_matches_cert(a: &NodeArtifacts) -> CheckResult {
    match key_and_cert_fingerprints(a) {
        Ok((key, cert)) if key == cert => {
            CheckResult::pass(KEY_MATCHES_CERT, format!("public key {}", key.short()))
        }
        Ok((key, cert)) => CheckResult::fail(
            KEY_MATCHES_CERT,
            format!("key {} does not match certificate {}", key.short(), cert.short()),
        ),
        Err(msg) => CheckResult::fail(KEY_MATCHES_CERT, msg),
    }
}

fn key_and_cert_fingerprints(
    a: &NodeArtifacts,
) -> Result<(PublicKeyFingerprint, PublicKeyFingerprint), String> {
    let key = a.key_fingerprint()?;
    let leaf = a.leaf()?;
    let (_, cert) = parse_x509_certificate(&leaf).map_err(|e| format!("{CERT_FILE}: {e}"))?;
    Ok((key, PublicKeyFingerprint::from_spki(cert.public_key())))
}

/// Check 2: a kept request matches the private key.
#[must_use]
pub fn csr_matches_key(a: &NodeArtifacts) -> CheckResult {
    let Some(csr) = a.csr.as_deref() else {
        return CheckResult::pass(CSR_MATCHES_KEY, format!("no {CSR_FILE} kept"));
    };
    let key = match a.key_fingerprint() {
        Ok(fp) => fp,
        Err(msg) => return CheckResult::fail(CSR_MATCHES_KEY, msg),
    };
    match RequestInfo::from_pem(csr) {
        Ok(info) if info.public_key == key => CheckResult::pass(CSR_MATCHES_KEY, "request matches key"),
        Ok(info) => CheckResult::fail(
            CSR_MATCHES_KEY,
            format!("request key {} does not match {}", info.public_key.short(), key.short()),
        ),
        Err(e) => CheckResult::fail(CSR_MATCHES_KEY, format!("{CSR_FILE}: {e}")),
    }
}

/// Check 3: the leaf chains to the anchor.
#[must_use]
pub fn leaf_chain(a: &NodeArtifacts, anchor: &TrustAnchor) -> CheckResult {
    match a.leaf().and_then(|der| chain::chain_to_anchor(&der, anchor)) {
        Ok(depth) => CheckResult::pass(CHAIN, format!("chains to anchor in {depth} link(s)")),
        Err(msg) => CheckResult::fail(CHAIN, msg),
    }
}

/// Check 4: the bundle is exactly one private key followed by certificates.
#[must_use]
pub fn bundle_structure(a: &NodeArtifacts) -> CheckResult {
    let Some(text) = a.bundle.as_deref() else {
        return CheckResult::fail(BUNDLE_STRUCTURE, missing(BUNDLE_FILE));
    };
    let scanned = pem::scan(text);
    if let Some(problem) = scanned.problems.first() {
        return CheckResult::fail(BUNDLE_STRUCTURE, problem.to_string());
    }
    match scanned.blocks.split_first() {
        None => CheckResult::fail(BUNDLE_STRUCTURE, "bundle is empty"),
        Some((first, _)) if !first.is_private_key() => CheckResult::fail(
            BUNDLE_STRUCTURE,
            format!("first block is {} (line {}), expected a private key", first.label, first.line),
        ),
        Some((_, [])) => CheckResult::fail(BUNDLE_STRUCTURE, "bundle holds no certificate"),
        Some((_, rest)) => match rest.iter().find(|b| !b.is_certificate()) {
            Some(stray) => CheckResult::fail(
                BUNDLE_STRUCTURE,
                format!("unexpected {} block at line {}", stray.label, stray.line),
            ),
            None => CheckResult::pass(
                BUNDLE_STRUCTURE,
                format!("key followed by {} certificate(s)", rest.len()),
            ),
        },
    }
}

/// Check 5: serverAuth and clientAuth are required; digitalSignature and
/// keyEncipherment only warn when absent.
#[must_use]
pub fn usage(a: &NodeArtifacts) -> CheckResult {
    let leaf = match a.leaf() {
        Ok(der) => der,
        Err(msg) => return CheckResult::fail(USAGE, msg),
    };
    let cert = match parse_x509_certificate(&leaf) {
        Ok((_, cert)) => cert,
        Err(e) => return CheckResult::fail(USAGE, format!("{CERT_FILE}: {e}")),
    };

    let (server, client) = match cert.extended_key_usage() {
        Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
        Ok(None) => return CheckResult::fail(USAGE, "no extended key usage extension"),
        Err(e) => return CheckResult::fail(USAGE, format!("invalid extended key usage: {e}")),
    };
    let mut absent_eku = Vec::new();
    if !server {
        absent_eku.push("serverAuth");
    }
    if !client {
        absent_eku.push("clientAuth");
    }
    if !absent_eku.is_empty() {
        return CheckResult::fail(USAGE, format!("extended key usage lacks {}", absent_eku.join(", ")));
    }

    let mut absent_ku = Vec::new();
    match cert.key_usage() {
        Ok(Some(ku)) => {
            if !ku.value.digital_signature() {
                absent_ku.push("digitalSignature");
            }
            if !ku.value.key_encipherment() {
                absent_ku.push("keyEncipherment");
            }
        }
        Ok(None) => absent_ku.extend(["digitalSignature", "keyEncipherment"]),
        Err(e) => return CheckResult::warn(USAGE, format!("invalid key usage: {e}")),
    }
    if absent_ku.is_empty() {
        CheckResult::pass(USAGE, "serverAuth, clientAuth, digitalSignature, keyEncipherment")
    } else {
        CheckResult::warn(USAGE, format!("key usage lacks {}", absent_ku.join(", ")))
    }
}

/// Where a certificate sits relative to its validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// `notBefore` is in the future.
    NotYetValid,
    /// `notAfter` has passed.
    Expired,
    /// Valid, but expires within the warning threshold.
    ExpiresSoon {
        /// Whole days left.
        days_left: i64,
    },
    /// Valid beyond the warning threshold.
    Valid {
        /// Whole days left.
        days_left: i64,
    },
}

impl Validity {
    /// Check status for this state.
    #[must_use]
    pub const fn status(self) -> CheckStatus {
        match self {
            Self::NotYetValid | Self::Expired => CheckStatus::Fail,
            Self::ExpiresSoon { .. } => CheckStatus::Warn,
            Self::Valid { .. } => CheckStatus::Pass,
        }
    }
}

/// Classifies a validity window at `now`.
#[must_use]
pub fn evaluate_validity(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    warn_days: u32,
) -> Validity {
    if now < not_before {
        return Validity::NotYetValid;
    }
    if now > not_after {
        return Validity::Expired;
    }
    let left = not_after - now;
    let days_left = left.num_days();
    if left <= Duration::days(i64::from(warn_days)) {
        Validity::ExpiresSoon { days_left }
    } else {
        Validity::Valid { days_left }
    }
}

/// Check 6: validity of every certificate in `node.crt` and `web.pem`.
#[must_use]
pub fn validity(a: &NodeArtifacts, now: DateTime<Utc>, warn_days: u32) -> CheckResult {
    let mut worst = CheckStatus::Pass;
    let mut notes = Vec::new();
    let mut checked = 0usize;

    for (file, text) in [(CERT_FILE, &a.cert), (BUNDLE_FILE, &a.bundle)] {
        let Some(text) = text.as_deref() else { continue };
        for (idx, block) in pem::scan(text).certificates().enumerate() {
            let label = format!("{file}#{}", idx + 1);
            let Ok((_, cert)) = parse_x509_certificate(&block.der) else {
                worst = worst.max(CheckStatus::Fail);
                notes.push(format!("{label} does not parse"));
                continue;
            };
            checked += 1;
            let window = cert.validity();
            let (Some(nb), Some(na)) = (
                DateTime::from_timestamp(window.not_before.timestamp(), 0),
                DateTime::from_timestamp(window.not_after.timestamp(), 0),
            ) else {
                worst = worst.max(CheckStatus::Fail);
                notes.push(format!("{label} has an unrepresentable validity window"));
                continue;
            };
            let state = evaluate_validity(nb, na, now, warn_days);
            worst = worst.max(state.status());
            match state {
                Validity::NotYetValid => notes.push(format!("{label} is not valid before {nb}")),
                Validity::Expired => notes.push(format!("{label} expired at {na}")),
                Validity::ExpiresSoon { days_left } => {
                    notes.push(format!("{label} expires in {days_left} day(s)"));
                }
                Validity::Valid { .. } => {}
            }
        }
    }

    if checked == 0 && notes.is_empty() {
        return CheckResult::fail(VALIDITY, "no certificates to check");
    }
    let message = if notes.is_empty() {
        format!("{checked} certificate(s) valid beyond {warn_days} days")
    } else {
        notes.join("; ")
    };
    CheckResult::new(VALIDITY, worst, message)
}

/// Check 7: every certificate in the bundle chains to the anchor.
#[must_use]
pub fn bundle_chain(a: &NodeArtifacts, anchor: &TrustAnchor) -> CheckResult {
    let Some(text) = a.bundle.as_deref() else {
        return CheckResult::fail(BUNDLE_CHAIN, missing(BUNDLE_FILE));
    };
    let scanned = pem::scan(text);
    let failures: Vec<String> = scanned
        .certificates()
        .enumerate()
        .filter_map(|(idx, block)| {
            chain::chain_to_anchor(&block.der, anchor)
                .err()
                .map(|e| format!("{BUNDLE_FILE}#{}: {e}", idx + 1))
        })
        .collect();
    let total = scanned.certificates().count();
    if total == 0 {
        CheckResult::fail(BUNDLE_CHAIN, "bundle holds no certificate")
    } else if failures.is_empty() {
        CheckResult::pass(BUNDLE_CHAIN, format!("{total} certificate(s) chain to anchor"))
    } else {
        CheckResult::fail(BUNDLE_CHAIN, failures.join("; "))
    }
}

/// Check 8: the leaf carries SANs including the node's name.
#[must_use]
pub fn san(a: &NodeArtifacts) -> CheckResult {
    let leaf = match a.leaf() {
        Ok(der) => der,
        Err(msg) => return CheckResult::fail(SAN, msg),
    };
    let cert = match parse_x509_certificate(&leaf) {
        Ok((_, cert)) => cert,
        Err(e) => return CheckResult::fail(SAN, format!("{CERT_FILE}: {e}")),
    };
    let names: Vec<&str> = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(dns) => Some(*dns),
                _ => None,
            })
            .collect(),
        Ok(None) => return CheckResult::warn(SAN, "certificate has no subjectAltName"),
        Err(e) => return CheckResult::warn(SAN, format!("invalid subjectAltName: {e}")),
    };
    match &a.node_name {
        Some(name) if names.iter().any(|n| n.eq_ignore_ascii_case(name)) => {
            CheckResult::pass(SAN, format!("{} DNS name(s) including {name}", names.len()))
        }
        Some(name) => CheckResult::warn(SAN, format!("DNS names do not include {name}")),
        // Without a registry only the sanitized directory name is known.
        None if names.iter().any(|n| naming::sanitize(n).eq_ignore_ascii_case(&a.dir_name)) => {
            CheckResult::pass(
                SAN,
                format!("{} DNS name(s), one matching directory {}", names.len(), a.dir_name),
            )
        }
        None => CheckResult::warn(
            SAN,
            format!(
                "no DNS name matches directory {} (node name unresolved without a registry)",
                a.dir_name
            ),
        ),
    }
}

/// Check 9: PEM markers balance and every certificate block parses, in
/// `node.crt`, `web.pem` and the anchor.
#[must_use]
pub fn pem_structure(a: &NodeArtifacts, anchor: &TrustAnchor) -> CheckResult {
    let mut problems: Vec<String> = Vec::new();
    for (file, text) in [(CERT_FILE, &a.cert), (BUNDLE_FILE, &a.bundle)] {
        let Some(text) = text.as_deref() else { continue };
        let scanned = pem::scan(text);
        problems.extend(scanned.problems.iter().map(|p| format!("{file} {p}")));
        problems.extend(unparseable(&scanned).map(|b| format!("{file} line {}: certificate does not parse", b.line)));
    }
    let anchor_name = anchor.path().display();
    problems.extend(anchor.problems().iter().map(|p| format!("{anchor_name} {p}")));

    if problems.is_empty() {
        CheckResult::pass(PEM_STRUCTURE, "well-formed")
    } else {
        CheckResult::fail(PEM_STRUCTURE, problems.join("; "))
    }
}

fn unparseable(scanned: &PemScan) -> impl Iterator<Item = &PemBlock> {
    scanned
        .certificates()
        .filter(|b| parse_x509_certificate(&b.der).is_err())
}

/// Check 10: no certificate appears twice in the bundle.
#[must_use]
pub fn duplicates(a: &NodeArtifacts) -> CheckResult {
    let Some(text) = a.bundle.as_deref() else {
        return CheckResult::fail(DUPLICATES, missing(BUNDLE_FILE));
    };
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut repeats = Vec::new();
    for (idx, block) in pem::scan(text).certificates().enumerate() {
        let digest = keys::sha256_hex(&block.der);
        if let Some(first) = seen.get(&digest) {
            repeats.push(format!("#{} repeats #{}", idx + 1, first + 1));
        } else {
            seen.insert(digest, idx);
        }
    }
    if repeats.is_empty() {
        CheckResult::pass(DUPLICATES, "no duplicate certificates")
    } else {
        CheckResult::fail(DUPLICATES, format!("{BUNDLE_FILE}: {}", repeats.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn at(days: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000, 0).unwrap() + Duration::days(days)
    }

    #[test_case(-400, -1, CheckStatus::Fail ; "expired yesterday")]
    #[test_case(-355, 10, CheckStatus::Warn ; "ten days left")]
    #[test_case(-1, 364, CheckStatus::Pass ; "far off")]
    #[test_case(1, 365, CheckStatus::Fail ; "not yet valid")]
    #[test_case(-335, 30, CheckStatus::Warn ; "exactly at threshold")]
    fn classifies_validity(start: i64, end: i64, expected: CheckStatus) {
        assert_eq!(evaluate_validity(at(start), at(end), at(0), 30).status(), expected);
    }

    #[test]
    fn reports_days_left() {
        assert_eq!(
            evaluate_validity(at(-1), at(10), at(0), 30),
            Validity::ExpiresSoon { days_left: 10 }
        );
    }

    fn artifacts_with_bundle(bundle: &str) -> NodeArtifacts {
        NodeArtifacts {
            dir_name: "n1".into(),
            node_name: Some("n1".into()),
            bundle: Some(bundle.into()),
            ..NodeArtifacts::default()
        }
    }

    #[test]
    fn bundle_must_start_with_key() {
        let key = pem::encode("PRIVATE KEY", b"k");
        let cert = pem::encode(pem::CERTIFICATE, b"c");

        let ordered = artifacts_with_bundle(&format!("{key}{cert}"));
        assert_eq!(bundle_structure(&ordered).status, CheckStatus::Pass);

        let reordered = artifacts_with_bundle(&format!("{cert}{key}"));
        let result = bundle_structure(&reordered);
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains("expected a private key"));

        let two_keys = artifacts_with_bundle(&format!("{key}{key}{cert}"));
        assert_eq!(bundle_structure(&two_keys).status, CheckStatus::Fail);

        let key_only = artifacts_with_bundle(&key);
        assert_eq!(bundle_structure(&key_only).status, CheckStatus::Fail);
    }

    #[test]
    fn duplicate_certificates_fail() {
        let key = pem::encode("PRIVATE KEY", b"k");
        let a = pem::encode(pem::CERTIFICATE, b"a");
        let b = pem::encode(pem::CERTIFICATE, b"b");
        assert_eq!(duplicates(&artifacts_with_bundle(&format!("{key}{a}{b}"))).status, CheckStatus::Pass);
        let dup = duplicates(&artifacts_with_bundle(&format!("{key}{a}{b}{a}")));
        assert_eq!(dup.status, CheckStatus::Fail);
        assert!(dup.message.contains("#3 repeats #1"));
    }

    #[test]
    fn unresolved_node_name_matches_sanitized_directory() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["web*1.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let mut a = NodeArtifacts {
            dir_name: "web_1.example.com".into(),
            node_name: None,
            cert: Some(cert.pem()),
            ..NodeArtifacts::default()
        };
        assert_eq!(san(&a).status, CheckStatus::Pass);

        a.dir_name = "db1.example.com".into();
        let result = san(&a);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.message.contains("unresolved"));

        a.node_name = Some("web*1.example.com".into());
        assert_eq!(san(&a).status, CheckStatus::Pass);
    }

    #[test]
    fn missing_artifacts_fail() {
        let result = artifacts(&artifacts_with_bundle("x"));
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains(KEY_FILE) && result.message.contains(CERT_FILE));
        assert_eq!(key_matches_cert(&NodeArtifacts::default()).status, CheckStatus::Fail);
        assert_eq!(csr_matches_key(&NodeArtifacts::default()).status, CheckStatus::Pass);
    }
}
