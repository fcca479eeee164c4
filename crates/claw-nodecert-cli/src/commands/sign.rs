//! Sign command implementation.

use std::io::Write;

use claw_nodecert::ca;
use claw_nodecert::config::CaConfig;

use crate::error::CliError;
use crate::output::OutputFormat;

/// Sign command executor.
pub struct SignCommand {
    config: CaConfig,
}

impl SignCommand {
    /// Create a new sign command.
    #[must_use]
    pub const fn new(config: CaConfig) -> Self {
        Self { config }
    }

    /// Sign every pending request into a new batch.
    ///
    /// Signing holds the ledger lock and may generate CA keys, so it runs on
    /// the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails, nothing is pending, or output fails.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let config = self.config.clone();
        let summary = tokio::task::spawn_blocking(move || ca::sign_pending(&config))
            .await
            .map_err(|e| CliError::Command(format!("signing task failed: {e}")))??;
        format.write(writer, &summary)?;
        Ok(())
    }
}
