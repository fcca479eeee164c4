//! Verification engine.
//!
//! Audits every node directory under the node tree against a trust anchor
//! and reports per-node check results. Check outcomes are data; only
//! configuration problems (missing tree, unusable anchor, bad registry) are
//! errors.

pub mod chain;
pub mod checks;
pub mod report;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub use chain::TrustAnchor;
pub use checks::{evaluate_validity, NodeArtifacts, Validity};
pub use report::{CheckResult, CheckStatus, NodeReport, RegistryFinding, Summary, VerificationReport};

use crate::arrange::CERT_FILE;
use crate::config::VerifyConfig;
use crate::error::{Error, Result};
use crate::pool;
use crate::registry::Registry;

/// Runs every check for one node directory.
#[must_use]
pub fn verify_node(
    dir: &Path,
    dir_name: &str,
    node_name: Option<&str>,
    anchor: &TrustAnchor,
    warn_days: u32,
    now: DateTime<Utc>,
) -> NodeReport {
    let a = NodeArtifacts::load(dir, dir_name, node_name);
    let report = NodeReport {
        node: dir_name.to_string(),
        checks: vec![
            checks::artifacts(&a),
            checks::key_matches_cert(&a),
            checks::csr_matches_key(&a),
            checks::leaf_chain(&a, anchor),
            checks::bundle_structure(&a),
            checks::usage(&a),
            checks::validity(&a, now, warn_days),
            checks::bundle_chain(&a, anchor),
            checks::san(&a),
            checks::pem_structure(&a, anchor),
            checks::duplicates(&a),
        ],
    };
    for check in report.checks.iter().filter(|c| c.status != CheckStatus::Pass) {
        debug!(node = dir_name, check = %check.name, status = %check.status, "{}", check.message);
    }
    report
}

/// Verifies every node directory under `cfg.node_dir`.
///
/// # Errors
///
/// Returns [`Error::MissingInput`] if the node tree or anchor is absent,
/// [`Error::Config`] if the anchor holds no usable certificate, and registry
/// errors if a registry was given and cannot be loaded.
pub async fn verify_all(cfg: &VerifyConfig) -> Result<VerificationReport> {
    if !cfg.node_dir.is_dir() {
        return Err(Error::MissingInput(cfg.node_dir.clone()));
    }
    let anchor_path = cfg.anchor_path();
    let anchor = Arc::new(TrustAnchor::load(&anchor_path)?);
    let registry = cfg.registry.as_deref().map(Registry::load).transpose()?;

    let dirs = node_dirs(&cfg.node_dir)?;
    info!(
        nodes = dirs.len(),
        anchor = %anchor_path.display(),
        "verifying node tree"
    );

    let now = Utc::now();
    let warn_days = cfg.warn_days;
    let items: Vec<(std::path::PathBuf, String, Option<String>)> = dirs
        .iter()
        .map(|dir_name| {
            let node_name = registry
                .as_ref()
                .and_then(|r| r.by_dir_name(dir_name))
                .map(|n| n.name().to_string());
            (cfg.node_dir.join(dir_name), dir_name.clone(), node_name)
        })
        .collect();

    let job_anchor = Arc::clone(&anchor);
    let results = pool::run_bounded(items, cfg.workers, move |(dir, dir_name, node_name)| {
        Ok(verify_node(&dir, &dir_name, node_name.as_deref(), &job_anchor, warn_days, now))
    })
    .await;

    let mut nodes = Vec::with_capacity(results.len());
    for (dir_name, result) in dirs.iter().zip(results) {
        match result {
            Ok(report) => nodes.push(report),
            Err(e) => nodes.push(NodeReport {
                node: dir_name.clone(),
                checks: vec![CheckResult::fail("worker", e.to_string())],
            }),
        }
    }

    let findings = registry
        .as_ref()
        .map(|r| registry_findings(r, &cfg.node_dir, &dirs))
        .unwrap_or_default();
    for finding in &findings {
        warn!(node = %finding.node, "{}", finding.message);
    }

    let report = VerificationReport::new(anchor_path, nodes, findings);
    info!(
        total = report.summary.total,
        passed = report.summary.passed,
        failed = report.summary.failed,
        warned = report.summary.warned,
        "verification complete"
    );
    Ok(report)
}

/// Sorted names of the node directories under `node_dir`.
fn node_dirs(node_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(node_dir).map_err(Error::io(node_dir))? {
        let entry = entry.map_err(Error::io(node_dir))?;
        if !entry.file_type().map_err(Error::io(entry.path()))?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => warn!(name = ?raw, "skipping directory with a non UTF-8 name"),
        }
    }
    names.sort();
    Ok(names)
}

/// Drift between the registry and the node tree.
#[must_use]
pub fn registry_findings(registry: &Registry, node_dir: &Path, dirs: &[String]) -> Vec<RegistryFinding> {
    let mut findings = Vec::new();
    for node in registry.nodes() {
        if !node_dir.join(node.dir_name()).join(CERT_FILE).is_file() {
            findings.push(RegistryFinding {
                node: node.name().to_string(),
                status: CheckStatus::Warn,
                message: format!("registered node has no signed {CERT_FILE}"),
            });
        }
    }
    let registered: HashSet<&str> = registry.nodes().iter().map(|n| n.dir_name()).collect();
    for dir in dirs.iter().filter(|d| !registered.contains(d.as_str())) {
        findings.push(RegistryFinding {
            node: dir.clone(),
            status: CheckStatus::Warn,
            message: "node directory is not in the registry".into(),
        });
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_drift_is_reported_both_ways() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::parse("a.example.com\nb.example.com\n").unwrap();
        fs::create_dir_all(tmp.path().join("a.example.com")).unwrap();
        fs::write(tmp.path().join("a.example.com").join(CERT_FILE), "x").unwrap();
        fs::create_dir_all(tmp.path().join("stray")).unwrap();

        let dirs = node_dirs(tmp.path()).unwrap();
        assert_eq!(dirs, ["a.example.com", "stray"]);

        let findings = registry_findings(&registry, tmp.path(), &dirs);
        let nodes: Vec<_> = findings.iter().map(|f| f.node.as_str()).collect();
        assert_eq!(nodes, ["b.example.com", "stray"]);
        assert!(findings.iter().all(|f| f.status == CheckStatus::Warn));
    }

    #[tokio::test]
    async fn missing_tree_and_anchor_are_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = VerifyConfig {
            node_dir: tmp.path().join("absent"),
            ..VerifyConfig::default()
        };
        assert!(matches!(verify_all(&cfg).await, Err(Error::MissingInput(_))));

        let cfg = VerifyConfig {
            node_dir: tmp.path().to_path_buf(),
            ..VerifyConfig::default()
        };
        assert!(matches!(verify_all(&cfg).await, Err(Error::MissingInput(_))));
    }

    #[test]
    fn empty_node_directory_fails_every_dependent_check() {
        let tmp = tempfile::tempdir().unwrap();
        let root = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&root).unwrap();
        let anchor = TrustAnchor::from_pem(Path::new("ca.crt"), &cert.pem()).unwrap();

        let report = verify_node(tmp.path(), "n1", Some("n1"), &anchor, 30, Utc::now());
        assert_eq!(report.checks.len(), 11);
        assert!(report.has_failures());
        assert_eq!(report.check(checks::ARTIFACTS).unwrap().status, CheckStatus::Fail);
        assert!(report.check(checks::CHAIN).unwrap().message.contains("is missing"));
        assert_eq!(report.check(checks::PEM_STRUCTURE).unwrap().status, CheckStatus::Pass);
    }
}
