//! Signing policies applied to requests before a CA level signs them.

use serde::{Deserialize, Serialize};

use crate::dn::{AttributeKind, SubjectName};

/// Requirement on one subject attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldRule {
    /// The request must carry a non-empty value.
    Supplied,
    /// The attribute may be absent.
    Optional,
}

/// Signing policy of a CA level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPolicy {
    /// Per-attribute rules; attributes not listed are optional.
    pub fields: Vec<(AttributeKind, FieldRule)>,
}

impl SigningPolicy {
    /// Policy for node certificates: organization required, common name optional.
    #[must_use]
    pub fn leaf() -> Self {
        Self {
            fields: vec![
                (AttributeKind::Organization, FieldRule::Supplied),
                (AttributeKind::CommonName, FieldRule::Optional),
            ],
        }
    }

    /// Policy the root applies when issuing an intermediate.
    #[must_use]
    pub fn intermediate() -> Self {
        Self {
            fields: vec![
                (AttributeKind::Organization, FieldRule::Supplied),
                (AttributeKind::CommonName, FieldRule::Supplied),
            ],
        }
    }

    /// Checks a request subject.
    ///
    /// # Errors
    ///
    /// Returns the reason for the first violated rule.
    pub fn check(&self, subject: &SubjectName) -> Result<(), String> {
        for (kind, rule) in &self.fields {
            if *rule == FieldRule::Supplied
                && subject.first(*kind).is_none_or(|v| v.trim().is_empty())
            {
                return Err(format!("{} ({kind}) must be supplied", kind.long_name()));
            }
        }
        Ok(())
    }
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self::leaf()
    }
}
