//! Arrange command implementation.

use std::io::Write;

use claw_nodecert::arrange;
use claw_nodecert::config::ArrangeConfig;

use crate::error::CliError;
use crate::output::OutputFormat;

/// Arrange command executor.
pub struct ArrangeCommand {
    config: ArrangeConfig,
}

impl ArrangeCommand {
    /// Create a new arrange command.
    #[must_use]
    pub const fn new(config: ArrangeConfig) -> Self {
        Self { config }
    }

    /// Place signed certificates into the node tree.
    ///
    /// # Errors
    ///
    /// Returns an error if no node could be arranged or output fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let summary = arrange::arrange(&self.config)?;
        format.write(writer, &summary)?;
        Ok(())
    }
}
