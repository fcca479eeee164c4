//! Verify command implementation.

use std::io::Write;

use claw_nodecert::config::VerifyConfig;
use claw_nodecert::verify;

use crate::error::CliError;
use crate::output::OutputFormat;

/// Verify command executor.
pub struct VerifyCommand {
    config: VerifyConfig,
}

impl VerifyCommand {
    /// Create a new verify command.
    #[must_use]
    pub const fn new(config: VerifyConfig) -> Self {
        Self { config }
    }

    /// Verify the node tree and print the report.
    ///
    /// The report is written in full before a failure is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::VerificationFailed`] if any node has a failing
    /// check, or an error if the tree or anchor cannot be used.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let report = verify::verify_all(&self.config).await?;
        format.write(writer, &report)?;
        if report.has_failures() {
            return Err(CliError::VerificationFailed(report.summary.failed));
        }
        Ok(())
    }
}
