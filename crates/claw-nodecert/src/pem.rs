//! Sequential PEM block scanner.
//!
//! Chain files, bundles and anchors are all decomposed here. [`scan`] never
//! fails: it returns every well-formed block plus a list of structural
//! problems, so the verification engine can report all of them at once.
//! [`parse`] is the strict variant used when producing material.

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label of certificate blocks.
pub const CERTIFICATE: &str = "CERTIFICATE";

/// Label of PKCS#10 request blocks.
pub const CERTIFICATE_REQUEST: &str = "CERTIFICATE REQUEST";

const BEGIN: &str = "-----BEGIN ";
const END: &str = "-----END ";
const DASHES: &str = "-----";

/// One decoded PEM block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    /// Text between `BEGIN ` and the closing dashes.
    pub label: String,
    /// Decoded payload.
    pub der: Vec<u8>,
    /// 1-based line of the BEGIN marker.
    pub line: usize,
}

impl PemBlock {
    /// Returns true for certificate blocks.
    #[must_use]
    pub fn is_certificate(&self) -> bool {
        self.label == CERTIFICATE
    }

    /// Returns true for any private key block (PKCS#8, PKCS#1, SEC1, encrypted).
    #[must_use]
    pub fn is_private_key(&self) -> bool {
        self.label.ends_with("PRIVATE KEY")
    }
}

/// A structural defect found while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PemProblem {
    /// 1-based line where the defect was detected.
    pub line: usize,
    /// Description.
    pub message: String,
}

impl fmt::Display for PemProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Result of scanning a PEM document.
#[derive(Debug, Clone, Default)]
pub struct PemScan {
    /// Successfully decoded blocks, in file order.
    pub blocks: Vec<PemBlock>,
    /// Structural problems, in file order.
    pub problems: Vec<PemProblem>,
}

impl PemScan {
    /// Returns true if no structural problem was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    /// Certificate blocks in file order.
    pub fn certificates(&self) -> impl Iterator<Item = &PemBlock> {
        self.blocks.iter().filter(|b| b.is_certificate())
    }
}

struct OpenBlock {
    label: String,
    line: usize,
    body: String,
}

/// Scans `text` block by block.
#[must_use]
pub fn scan(text: &str) -> PemScan {
    let mut out = PemScan::default();
    let mut open: Option<OpenBlock> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if let Some(label) = marker_label(line, BEGIN) {
            if let Some(prev) = open.take() {
                out.problems.push(PemProblem {
                    line: line_no,
                    message: format!(
                        "BEGIN {label} while {} from line {} is still open",
                        prev.label, prev.line
                    ),
                });
            }
            open = Some(OpenBlock {
                label: label.to_string(),
                line: line_no,
                body: String::new(),
            });
        } else if let Some(label) = marker_label(line, END) {
            match open.take() {
                None => out.problems.push(PemProblem {
                    line: line_no,
                    message: format!("END {label} without matching BEGIN"),
                }),
                Some(block) if block.label != label => out.problems.push(PemProblem {
                    line: line_no,
                    message: format!(
                        "END {label} does not match BEGIN {} on line {}",
                        block.label, block.line
                    ),
                }),
                Some(block) => match decode_body(&block.body) {
                    Ok(der) if !der.is_empty() => out.blocks.push(PemBlock {
                        label: block.label,
                        der,
                        line: block.line,
                    }),
                    Ok(_) => out.problems.push(PemProblem {
                        line: block.line,
                        message: format!("{} block is empty", block.label),
                    }),
                    Err(e) => out.problems.push(PemProblem {
                        line: block.line,
                        message: format!("{} block is not valid base64: {e}", block.label),
                    }),
                },
            }
        } else if let Some(block) = open.as_mut() {
            // RFC 1421 headers (e.g. Proc-Type) are not part of the payload.
            if !line.contains(':') {
                block.body.push_str(line);
            }
        }
    }

    if let Some(block) = open {
        out.problems.push(PemProblem {
            line: block.line,
            message: format!("BEGIN {} is never closed", block.label),
        });
    }
    out
}

/// Strict parse: any structural problem is an error.
///
/// # Errors
///
/// Returns [`Error::Pem`] describing the first problem, or if no block was
/// found at all.
pub fn parse(text: &str) -> Result<Vec<PemBlock>> {
    let scanned = scan(text);
    if let Some(problem) = scanned.problems.first() {
        return Err(Error::Pem(problem.to_string()));
    }
    if scanned.blocks.is_empty() {
        return Err(Error::Pem("no PEM blocks found".into()));
    }
    Ok(scanned.blocks)
}

/// Returns the DER of every certificate block, strictly parsed.
///
/// # Errors
///
/// Returns [`Error::Pem`] if the text is malformed or has no certificates.
pub fn certificates(text: &str) -> Result<Vec<Vec<u8>>> {
    let ders: Vec<_> = parse(text)?
        .into_iter()
        .filter(PemBlock::is_certificate)
        .map(|b| b.der)
        .collect();
    if ders.is_empty() {
        return Err(Error::Pem("no CERTIFICATE blocks found".into()));
    }
    Ok(ders)
}

/// Encodes `der` as a PEM block with 64-column lines.
#[must_use]
pub fn encode(label: &str, der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("{BEGIN}{label}{DASHES}\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("{END}{label}{DASHES}\n"));
    out
}

fn marker_label<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_suffix(DASHES)
}

fn decode_body(body: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(body)
}
