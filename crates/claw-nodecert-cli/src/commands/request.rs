//! Request command implementation.

use std::io::Write;

use claw_nodecert::config::RequestConfig;
use claw_nodecert::request;

use crate::error::CliError;
use crate::output::OutputFormat;

/// Request command executor.
pub struct RequestCommand {
    config: RequestConfig,
}

impl RequestCommand {
    /// Create a new request command.
    #[must_use]
    pub const fn new(config: RequestConfig) -> Self {
        Self { config }
    }

    /// Generate keys and requests for every registry node.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails for any node or output fails.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let summary = request::generate_all(&self.config).await?;
        format.write(writer, &summary)?;
        Ok(())
    }
}
