//! Node registry parsing.
//!
//! The registry is a line-oriented file; each non-empty line is
//! `<fqdn> [extra-alt-name ...]`. Blank lines and `#` comments are ignored.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::naming;

/// Identity of one cluster node, as declared in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    name: String,
    common_name: String,
    extra_alt_names: Vec<String>,
    dir_name: String,
}

impl NodeIdentity {
    /// Creates an identity, deriving the common name and directory name.
    ///
    /// Returns `None` when `name` has nothing that can identify a node.
    #[must_use]
    pub fn new(name: impl Into<String>, extra_alt_names: Vec<String>) -> Option<Self> {
        let name = name.into();
        let common_name = name.split('.').next().unwrap_or_default().to_string();
        let dir_name = naming::sanitize(&name);
        if common_name.is_empty() || !naming::is_usable_dir_name(&dir_name) {
            return None;
        }
        Some(Self {
            name,
            common_name,
            extra_alt_names,
            dir_name,
        })
    }

    /// Fully-qualified node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First label of the node name.
    #[must_use]
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Additional hostnames listed alongside the node.
    #[must_use]
    pub fn extra_alt_names(&self) -> &[String] {
        &self.extra_alt_names
    }

    /// Sanitized name used for every path derived from this node.
    #[must_use]
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }
}

/// Ordered set of node identities with unique directory names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    nodes: Vec<NodeIdentity>,
}

impl Registry {
    /// Reads and parses a registry file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingInput`] if the file does not exist, and
    /// [`Error::NameCollision`] if two entries share a directory name.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::MissingInput(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(Error::io(path))?;
        let registry = Self::parse(&text)?;
        debug!(path = %path.display(), nodes = registry.len(), "loaded node registry");
        Ok(registry)
    }

    /// Parses registry text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NameCollision`] if two entries sanitize to the same
    /// directory name (exact duplicates included).
    pub fn parse(text: &str) -> Result<Self> {
        let mut nodes: Vec<NodeIdentity> = Vec::new();
        let mut claimed: HashMap<String, usize> = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else { continue };
            let alts = fields.map(String::from).collect();

            let Some(node) = NodeIdentity::new(name, alts) else {
                warn!(line = idx + 1, entry = %line, "skipping registry line without a usable node name");
                continue;
            };

            if let Some(&prev) = claimed.get(node.dir_name()) {
                return Err(Error::NameCollision {
                    first: nodes[prev].name().to_string(),
                    second: node.name().to_string(),
                    dir_name: node.dir_name().to_string(),
                });
            }
            claimed.insert(node.dir_name().to_string(), nodes.len());
            nodes.push(node);
        }

        Ok(Self { nodes })
    }

    /// Nodes in registry order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeIdentity] {
        &self.nodes
    }

    /// Looks a node up by its sanitized directory name.
    #[must_use]
    pub fn by_dir_name(&self, dir_name: &str) -> Option<&NodeIdentity> {
        self.nodes.iter().find(|n| n.dir_name() == dir_name)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the registry lists no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl IntoIterator for Registry {
    type Item = NodeIdentity;
    type IntoIter = std::vec::IntoIter<NodeIdentity>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_alt_names() {
        let reg = Registry::parse("db1.example.com db.example.com\nweb1.example.com\n\n").unwrap();
        assert_eq!(reg.len(), 2);

        let db = &reg.nodes()[0];
        assert_eq!(db.name(), "db1.example.com");
        assert_eq!(db.common_name(), "db1");
        assert_eq!(db.extra_alt_names(), ["db.example.com".to_string()]);
        assert_eq!(db.dir_name(), "db1.example.com");

        assert!(reg.nodes()[1].extra_alt_names().is_empty());
    }

    #[test]
    fn tolerates_blank_lines_comments_and_padding() {
        let reg = Registry::parse("\n  # fleet\n   node-a.lan   alias  \n\t\nnode-b\n\n").unwrap();
        let names: Vec<_> = reg.nodes().iter().map(NodeIdentity::name).collect();
        assert_eq!(names, ["node-a.lan", "node-b"]);
    }

    #[test]
    fn skips_lines_without_identifiable_name() {
        let reg = Registry::parse(".hidden\n..\nok.example.com\n").unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.nodes()[0].name(), "ok.example.com");
    }

    #[test]
    fn single_label_name_is_its_own_common_name() {
        let node = NodeIdentity::new("standalone", vec![]).unwrap();
        assert_eq!(node.common_name(), "standalone");
    }

    #[test]
    fn unsafe_names_get_sanitized_dir_names() {
        let reg = Registry::parse("*.edge.example.com\nrack/7.example.com\n").unwrap();
        assert_eq!(reg.nodes()[0].dir_name(), "_.edge.example.com");
        assert_eq!(reg.nodes()[1].dir_name(), "rack_7.example.com");
        assert!(reg.by_dir_name("rack_7.example.com").is_some());
    }

    #[test]
    fn sanitization_collision_is_rejected() {
        let err = Registry::parse("a*b.example.com\na$b.example.com\n").unwrap_err();
        match err {
            Error::NameCollision { first, second, dir_name } => {
                assert_eq!(first, "a*b.example.com");
                assert_eq!(second, "a$b.example.com");
                assert_eq!(dir_name, "a_b.example.com");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exact_duplicate_is_rejected() {
        assert!(matches!(
            Registry::parse("n1.lan\nn1.lan extra\n"),
            Err(Error::NameCollision { .. })
        ));
    }

    #[test]
    fn missing_file_is_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = Registry::load(&dir.path().join("nodes.txt")).unwrap_err();
        assert!(matches!(err, Error::MissingInput(_)));
    }
}
