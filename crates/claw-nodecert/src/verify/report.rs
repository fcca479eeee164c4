//! Verification report types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The check passed.
    Pass,
    /// The check passed with a caveat.
    Warn,
    /// The check failed.
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        })
    }
}

/// One named check and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name.
    pub name: String,
    /// Outcome.
    pub status: CheckStatus,
    /// Human-readable detail.
    pub message: String,
}

impl CheckResult {
    /// Creates a result.
    #[must_use]
    pub fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }

    /// Passing result.
    #[must_use]
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    /// Warning result.
    #[must_use]
    pub fn warn(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    /// Failing result.
    #[must_use]
    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }
}

/// Every check run for one node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node directory name.
    pub node: String,
    /// Check results in check order.
    pub checks: Vec<CheckResult>,
}

impl NodeReport {
    /// Worst status among the checks.
    #[must_use]
    pub fn status(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Pass)
    }

    /// Returns true if any check failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.status() == CheckStatus::Fail
    }

    /// Looks up a check by name.
    #[must_use]
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Drift between the registry and the node tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFinding {
    /// Node name or directory.
    pub node: String,
    /// Always a warning.
    pub status: CheckStatus,
    /// What is inconsistent.
    pub message: String,
}

/// Node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Nodes verified.
    pub total: usize,
    /// Nodes without failing checks.
    pub passed: usize,
    /// Nodes with at least one failing check.
    pub failed: usize,
    /// Passing nodes that carry warnings.
    pub warned: usize,
}

/// Result of a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Trust anchor the nodes were verified against.
    pub anchor: PathBuf,
    /// Per-node reports, sorted by directory name.
    pub nodes: Vec<NodeReport>,
    /// Registry consistency findings.
    pub registry: Vec<RegistryFinding>,
    /// Counts.
    pub summary: Summary,
}

impl VerificationReport {
    /// Builds a report and its summary.
    #[must_use]
    pub fn new(anchor: PathBuf, nodes: Vec<NodeReport>, registry: Vec<RegistryFinding>) -> Self {
        let failed = nodes.iter().filter(|n| n.has_failures()).count();
        let warned = nodes.iter().filter(|n| n.status() == CheckStatus::Warn).count();
        let summary = Summary {
            total: nodes.len(),
            passed: nodes.len() - failed,
            failed,
            warned,
        };
        Self {
            anchor,
            nodes,
            registry,
            summary,
        }
    }

    /// Returns true if any node has a failing check.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    /// Report for one node directory.
    #[must_use]
    pub fn node(&self, dir_name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node == dir_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, statuses: &[CheckStatus]) -> NodeReport {
        NodeReport {
            node: name.into(),
            checks: statuses
                .iter()
                .enumerate()
                .map(|(i, s)| CheckResult::new(&format!("c{i}"), *s, ""))
                .collect(),
        }
    }

    #[test]
    fn node_status_is_worst_check() {
        assert_eq!(node("a", &[]).status(), CheckStatus::Pass);
        assert_eq!(node("a", &[CheckStatus::Pass, CheckStatus::Warn]).status(), CheckStatus::Warn);
        assert!(node("a", &[CheckStatus::Fail, CheckStatus::Warn]).has_failures());
    }

    #[test]
    fn summary_counts_nodes() {
        let report = VerificationReport::new(
            PathBuf::from("nodes/ca.crt"),
            vec![
                node("a", &[CheckStatus::Pass]),
                node("b", &[CheckStatus::Warn]),
                node("c", &[CheckStatus::Fail]),
            ],
            Vec::new(),
        );
        assert_eq!(
            report.summary,
            Summary {
                total: 3,
                passed: 2,
                failed: 1,
                warned: 1
            }
        );
        assert!(report.has_failures());
        assert!(report.node("b").is_some());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&CheckResult::warn("san", "x")).unwrap();
        assert!(json.contains("\"status\":\"warn\""));
    }
}
