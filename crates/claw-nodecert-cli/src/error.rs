//! CLI error types.

use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// A pipeline stage failed.
    #[error(transparent)]
    NodeCert(#[from] claw_nodecert::Error),

    /// Some node failed verification.
    #[error("verification failed for {0} node(s)")]
    VerificationFailed(usize),

    /// Command execution failed.
    #[error("command error: {0}")]
    Command(String),

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_errors_pass_through() {
        let err = CliError::from(claw_nodecert::Error::EmptyBatch("nothing to sign".into()));
        assert!(err.to_string().contains("nothing to sign"));
    }

    #[test]
    fn verification_failure_counts_nodes() {
        assert_eq!(
            CliError::VerificationFailed(2).to_string(),
            "verification failed for 2 node(s)"
        );
    }

    #[test]
    fn cli_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert!(matches!(CliError::from(io_err), CliError::Io(_)));
    }
}
