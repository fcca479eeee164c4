//! Bundle arranger.
//!
//! Places signed certificates from a batch directory into the node tree and
//! assembles each node's `web.pem` (key, certificate, anchor).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ca::{BATCH_PREFIX, CA_CERT_FILE};
use crate::config::{ArrangeConfig, KeySource};
use crate::error::{Error, Result};
use crate::fsutil::{self, WriteOutcome};
use crate::keys::PrivateKey;
use crate::naming;
use crate::pem;
use crate::request::KEY_FILE;

/// Shared anchor file at the root of the node tree.
pub const SHARED_ANCHOR: &str = "ca.crt";
/// Signed leaf certificate inside a node directory.
pub const CERT_FILE: &str = "node.crt";
/// Key, certificate and anchor bundle inside a node directory.
pub const BUNDLE_FILE: &str = "web.pem";

const CERT_EXTENSION: &str = "crt";
const KEY_EXTENSION: &str = "key";

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrangedNode {
    /// Node directory name.
    pub node: String,
    /// `node.crt` was created or replaced.
    pub cert_written: bool,
    /// `web.pem` was created or replaced.
    pub bundle_written: bool,
    /// The key was copied from the batch.
    pub key_copied: bool,
}

/// Result of an arrange run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrangeSummary {
    /// Batch directory the certificates came from.
    pub batch_dir: PathBuf,
    /// Shared anchor written into the node tree, if one was known.
    pub anchor: Option<PathBuf>,
    /// Arranged nodes, sorted by name.
    pub arranged: Vec<ArrangedNode>,
    /// Nodes skipped for lack of a key.
    pub skipped: Vec<String>,
}

/// Arranges every certificate of a signed batch into the node tree.
///
/// # Errors
///
/// Returns [`Error::MissingInput`] if the batch or an explicit anchor is
/// absent, [`Error::Pem`] for unusable certificate, key or anchor files, and
/// [`Error::EmptyBatch`] if no node could be arranged.
pub fn arrange(cfg: &ArrangeConfig) -> Result<ArrangeSummary> {
    if !cfg.signed_dir.is_dir() {
        return Err(Error::MissingInput(cfg.signed_dir.clone()));
    }
    let batch_dir = resolve_batch(&cfg.signed_dir)?;
    let certs = signed_certificates(&batch_dir)?;
    info!(
        batch = %batch_dir.display(),
        certificates = certs.len(),
        "arranging signed certificates"
    );

    let anchor_pem = load_anchor(cfg, &batch_dir)?;
    let anchor = match &anchor_pem {
        Some(text) => {
            let shared = cfg.node_dir.join(SHARED_ANCHOR);
            if fsutil::write_if_changed(&shared, text.as_bytes(), fsutil::PUBLIC_MODE)? == WriteOutcome::Written {
                info!(path = %shared.display(), "installed trust anchor");
            }
            Some(shared)
        }
        None => {
            warn!(batch = %batch_dir.display(), "no trust anchor known; bundles will not include one");
            None
        }
    };

    let mut summary = ArrangeSummary {
        batch_dir: batch_dir.clone(),
        anchor,
        arranged: Vec::new(),
        skipped: Vec::new(),
    };
    for (node, cert_path) in certs {
        match arrange_node(cfg, &batch_dir, &node, &cert_path, anchor_pem.as_deref())? {
            Some(arranged) => summary.arranged.push(arranged),
            None => summary.skipped.push(node),
        }
    }

    if summary.arranged.is_empty() {
        return Err(Error::EmptyBatch(format!(
            "no node could be arranged from {}",
            batch_dir.display()
        )));
    }
    info!(
        arranged = summary.arranged.len(),
        skipped = summary.skipped.len(),
        "bundles arranged"
    );
    Ok(summary)
}

/// Places one node's certificate and bundle. Returns `None` if the node has
/// no key to bundle.
fn arrange_node(
    cfg: &ArrangeConfig,
    batch_dir: &Path,
    node: &str,
    cert_path: &Path,
    anchor_pem: Option<&str>,
) -> Result<Option<ArrangedNode>> {
    let cert_pem = fsutil::read_required_text(cert_path)?;
    pem::certificates(&cert_pem).map_err(|e| Error::Pem(format!("{}: {e}", cert_path.display())))?;

    let dir = cfg.node_dir.join(node);
    let local_key = dir.join(KEY_FILE);
    let (key, key_copied) = match cfg.key_source {
        KeySource::Local => {
            if !local_key.is_file() {
                warn!(node, path = %local_key.display(), "no local key; skipping node");
                return Ok(None);
            }
            (PrivateKey::load(&local_key)?, false)
        }
        KeySource::Signed => {
            let signed_key = batch_dir.join(format!("{node}.{KEY_EXTENSION}"));
            if !signed_key.is_file() {
                warn!(node, path = %signed_key.display(), "no signed key; skipping node");
                return Ok(None);
            }
            let key = PrivateKey::load(&signed_key)?;
            fs::create_dir_all(&dir).map_err(Error::io(&dir))?;
            let copied = fsutil::write_if_changed(&local_key, key.pem().as_bytes(), fsutil::PRIVATE_MODE)?;
            (key, copied == WriteOutcome::Written)
        }
    };

    let cert_written =
        fsutil::write_if_changed(&dir.join(CERT_FILE), cert_pem.as_bytes(), fsutil::PUBLIC_MODE)?;
    let bundle = bundle_text(key.pem(), &cert_pem, anchor_pem);
    let bundle_written =
        fsutil::write_if_changed(&dir.join(BUNDLE_FILE), bundle.as_bytes(), fsutil::PRIVATE_MODE)?;
    debug!(node, ?cert_written, ?bundle_written, "arranged node");

    Ok(Some(ArrangedNode {
        node: node.to_string(),
        cert_written: cert_written == WriteOutcome::Written,
        bundle_written: bundle_written == WriteOutcome::Written,
        key_copied,
    }))
}

/// Concatenates key, certificate and anchor, each ending in a newline.
#[must_use]
pub fn bundle_text(key_pem: &str, cert_pem: &str, anchor_pem: Option<&str>) -> String {
    let mut out = String::new();
    for part in [Some(key_pem), Some(cert_pem), anchor_pem].into_iter().flatten() {
        out.push_str(part);
        if !part.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn load_anchor(cfg: &ArrangeConfig, batch_dir: &Path) -> Result<Option<String>> {
    let path = match &cfg.ca_cert {
        Some(explicit) => explicit.clone(),
        None => {
            let discovered = batch_dir.join(CA_CERT_FILE);
            if !discovered.is_file() {
                return Ok(None);
            }
            discovered
        }
    };
    let text = fsutil::read_required_text(&path)?;
    pem::certificates(&text).map_err(|e| Error::Pem(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), "using trust anchor");
    Ok(Some(text))
}

/// The directory holding the certificates: `dir` itself, or its newest
/// `signed-*` batch if `dir` holds none.
fn resolve_batch(dir: &Path) -> Result<PathBuf> {
    if !signed_certificates(dir)?.is_empty() {
        return Ok(dir.to_path_buf());
    }
    let mut batches = Vec::new();
    for entry in fs::read_dir(dir).map_err(Error::io(dir))? {
        let path = entry.map_err(Error::io(dir))?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_dir() && name.starts_with(BATCH_PREFIX) {
            batches.push((batch_order(name), path));
        }
    }
    batches.sort();
    match batches.pop() {
        Some((_, newest)) => {
            debug!(batch = %newest.display(), "using newest batch");
            Ok(newest)
        }
        None => Err(Error::EmptyBatch(format!(
            "no signed certificates in {}",
            dir.display()
        ))),
    }
}

/// Sort key of a batch name: its timestamp, then its numeric `-n` suffix.
fn batch_order(name: &str) -> (String, u32) {
    let stamp = name.trim_start_matches(BATCH_PREFIX);
    match stamp.split_once('-') {
        Some((ts, n)) => (ts.to_string(), n.parse().unwrap_or(0)),
        None => (stamp.to_string(), 0),
    }
}

/// `<node>.crt` files in `dir` as `(node, path)`, sorted, excluding the anchor.
fn signed_certificates(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(Error::io(dir))? {
        let path = entry.map_err(Error::io(dir))?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(CERT_EXTENSION) {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(CA_CERT_FILE) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !naming::is_usable_dir_name(stem) || naming::sanitize(stem) != stem {
            warn!(path = %path.display(), "skipping certificate with an unsafe node name");
            continue;
        }
        out.push((stem.to_string(), path));
    }
    out.sort();
    Ok(out)
}
