//! Error types for node certificate provisioning.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for node certificate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error variants.
///
/// Verification findings are never errors; they are reported as
/// [`CheckResult`](crate::verify::CheckResult) values instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A required parameter is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required input file or directory does not exist.
    #[error("required input not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// The node registry could not be parsed.
    #[error("registry line {line}: {reason}")]
    Registry {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },

    /// Two node names map to the same on-disk directory.
    #[error("node '{second}' collides with '{first}' (both map to directory '{dir_name}')")]
    NameCollision {
        /// The node that claimed the directory first.
        first: String,
        /// The node that collided with it.
        second: String,
        /// The shared sanitized directory name.
        dir_name: String,
    },

    /// A distinguished name template or subject is invalid.
    #[error("distinguished name error: {0}")]
    DistinguishedName(String),

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate or CSR generation failed.
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Certificate, CSR or key parsing failed.
    #[error("parsing failed: {0}")]
    Parse(String),

    /// PEM data is structurally invalid.
    #[error("PEM error: {0}")]
    Pem(String),

    /// Subject Alternative Name error.
    #[error("SAN error: {0}")]
    San(String),

    /// A request violates the CA signing policy.
    #[error("request for node '{node}' violates signing policy: {reason}")]
    Policy {
        /// Node whose request was rejected.
        node: String,
        /// The violated rule.
        reason: String,
    },

    /// Signing a request failed.
    #[error("failed to sign request for node '{node}': {reason}")]
    Signing {
        /// Node whose request failed.
        node: String,
        /// Underlying failure.
        reason: String,
    },

    /// The issuance ledger or serial counter is unreadable or corrupt.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// The CA lock could not be acquired in time.
    #[error("timed out waiting for lock {}", .0.display())]
    LockTimeout(PathBuf),

    /// A batch produced nothing.
    #[error("empty batch: {0}")]
    EmptyBatch(String),

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Task(String),

    /// Filesystem error with the path that caused it.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Builds a closure mapping an [`std::io::Error`] to [`Error::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    /// Returns true for errors caused by operator input rather than by a
    /// failing operation.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::MissingInput(_)
                | Self::Registry { .. }
                | Self::NameCollision { .. }
                | Self::DistinguishedName(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_helper_keeps_path() {
        let err = Error::io("/tmp/x")(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("/tmp/x"));
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn collision_message_names_both_nodes() {
        let err = Error::NameCollision {
            first: "a*b".into(),
            second: "a$b".into(),
            dir_name: "a_b".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("a*b") && msg.contains("a$b") && msg.contains("a_b"));
        assert!(err.is_configuration());
    }

    #[test]
    fn empty_batch_is_not_configuration() {
        assert!(!Error::EmptyBatch("nothing".into()).is_configuration());
    }
}
