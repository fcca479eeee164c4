//! Chain-of-trust validation against a trust anchor.

use std::path::{Path, PathBuf};

use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::pem::{self, PemProblem};

/// Longest issuer path that is followed before giving up.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Certificates a node is verified against: the root, or an intermediate
/// followed by the root.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    path: PathBuf,
    certs: Vec<Vec<u8>>,
    problems: Vec<PemProblem>,
}

impl TrustAnchor {
    /// Loads an anchor file.
    ///
    /// Structural PEM problems are kept for reporting as long as at least
    /// one certificate parses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingInput`] if the file is absent and
    /// [`Error::Config`] if it holds no usable certificate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fsutil::read_required_text(path)?;
        Self::from_pem(path, &text)
    }

    /// Builds an anchor from PEM text; `path` is used for messages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text holds no usable certificate.
    pub fn from_pem(path: &Path, text: &str) -> Result<Self> {
        let scanned = pem::scan(text);
        let mut problems = scanned.problems.clone();
        let mut certs = Vec::new();
        for block in scanned.certificates() {
            match parse_x509_certificate(&block.der) {
                Ok(_) => certs.push(block.der.clone()),
                Err(e) => problems.push(PemProblem {
                    line: block.line,
                    message: format!("certificate does not parse: {e}"),
                }),
            }
        }
        if certs.is_empty() {
            return Err(Error::Config(format!(
                "trust anchor {} holds no parseable certificate",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            certs,
            problems,
        })
    }

    /// Anchor file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// DER certificates in file order.
    #[must_use]
    pub fn certs(&self) -> &[Vec<u8>] {
        &self.certs
    }

    /// Structural problems found while loading.
    #[must_use]
    pub fn problems(&self) -> &[PemProblem] {
        &self.problems
    }

    fn contains(&self, der: &[u8]) -> bool {
        self.certs.iter().any(|c| c.as_slice() == der)
    }
}

/// Returns true if two names are the same, byte for byte or attribute for attribute.
#[must_use]
pub fn names_match(a: &X509Name<'_>, b: &X509Name<'_>) -> bool {
    a.as_raw() == b.as_raw() || a.to_string() == b.to_string()
}

/// Returns true if `cert` names itself as issuer and its signature verifies
/// with its own key.
#[must_use]
pub fn is_self_signed(cert: &X509Certificate<'_>) -> bool {
    names_match(cert.subject(), cert.issuer()) && cert.verify_signature(None).is_ok()
}

/// Follows issuers from `der` through the anchor until a self-signed anchor
/// certificate is reached.
///
/// Only anchor certificates are considered as issuers. Every issuer must be
/// a CA and its path-length constraint must allow the CAs below it.
///
/// # Errors
///
/// Returns a description of the first broken link.
pub fn chain_to_anchor(der: &[u8], anchor: &TrustAnchor) -> std::result::Result<usize, String> {
    let mut current = der.to_vec();

    for depth in 0..MAX_CHAIN_DEPTH {
        let (_, cert) = parse_x509_certificate(&current)
            .map_err(|e| format!("certificate does not parse: {e}"))?;

        if is_self_signed(&cert) {
            return if anchor.contains(&current) {
                Ok(depth)
            } else {
                Err(format!(
                    "self-signed certificate '{}' is not in the trust anchor",
                    cert.subject()
                ))
            };
        }

        let issuer = find_issuer(&cert, anchor).ok_or_else(|| {
            format!(
                "no issuer '{}' for '{}' in {}",
                cert.issuer(),
                cert.subject(),
                anchor.path().display()
            )
        })?;
        let (_, issuer_cert) = parse_x509_certificate(issuer)
            .map_err(|e| format!("anchor certificate does not parse: {e}"))?;
        // Every certificate above the starting one is a CA below `issuer`.
        check_issuer_is_ca(&issuer_cert, depth)?;
        current = issuer.to_vec();
    }
    Err(format!("no self-signed anchor within {MAX_CHAIN_DEPTH} links"))
}

fn find_issuer<'a>(cert: &X509Certificate<'_>, anchor: &'a TrustAnchor) -> Option<&'a [u8]> {
    anchor.certs().iter().map(Vec::as_slice).find(|candidate| {
        parse_x509_certificate(candidate).is_ok_and(|(_, issuer)| {
            names_match(cert.issuer(), issuer.subject())
                && cert.verify_signature(Some(issuer.public_key())).is_ok()
        })
    })
}

fn check_issuer_is_ca(issuer: &X509Certificate<'_>, cas_below: usize) -> std::result::Result<(), String> {
    let constraints = issuer
        .basic_constraints()
        .map_err(|e| format!("issuer '{}' has invalid basic constraints: {e}", issuer.subject()))?;
    let Some(bc) = constraints.filter(|bc| bc.value.ca) else {
        return Err(format!("issuer '{}' is not a CA", issuer.subject()));
    };
    if let Some(limit) = bc.value.path_len_constraint {
        if cas_below > limit as usize {
            return Err(format!(
                "issuer '{}' allows {limit} intermediate(s) below it, found {cas_below}",
                issuer.subject()
            ));
        }
    }
    Ok(())
}
