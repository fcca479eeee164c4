//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use serde::Serialize;

use claw_nodecert::verify::{CheckStatus, VerificationReport};
use claw_nodecert::{ArrangeSummary, RequestSummary, SignSummary};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

const fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

const fn status_mark(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "✓",
        CheckStatus::Warn => "!",
        CheckStatus::Fail => "✗",
    }
}

impl TableDisplay for RequestSummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.nodes.is_empty() {
            writeln!(writer, "No nodes in registry")?;
            return Ok(());
        }
        writeln!(writer, "{:<40}  {:<32}  {:>7}  {:>7}", "NODE", "DIRECTORY", "NEW KEY", "NEW CSR")?;
        writeln!(writer, "{}", "─".repeat(92))?;
        for node in &self.nodes {
            writeln!(
                writer,
                "{:<40}  {:<32}  {:>7}  {:>7}",
                truncate(&node.node, 40),
                truncate(&node.dir_name, 32),
                yes_no(node.key_generated),
                yes_no(node.csr_generated)
            )?;
        }
        writeln!(writer)?;
        writeln!(
            writer,
            "Total: {} node(s), {} with new material",
            self.nodes.len(),
            self.generated()
        )?;
        Ok(())
    }
}

impl TableDisplay for SignSummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Batch: {}", self.batch_dir.display())?;
        writeln!(writer)?;
        writeln!(writer, "{:>8}  {:<32}  {:<20}  SUBJECT", "SERIAL", "NODE", "NOT AFTER")?;
        writeln!(writer, "{}", "─".repeat(96))?;
        for entry in &self.signed {
            writeln!(
                writer,
                "{:>8}  {:<32}  {:<20}  {}",
                entry.serial,
                truncate(&entry.node, 32),
                entry.not_after.format("%Y-%m-%d %H:%M:%S"),
                entry.subject
            )?;
        }
        writeln!(writer)?;
        writeln!(writer, "Signed: {} certificate(s)", self.signed.len())?;
        Ok(())
    }
}

impl TableDisplay for ArrangeSummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Batch:  {}", self.batch_dir.display())?;
        match &self.anchor {
            Some(anchor) => writeln!(writer, "Anchor: {}", anchor.display())?,
            None => writeln!(writer, "Anchor: none")?,
        }
        writeln!(writer)?;
        writeln!(writer, "{:<40}  {:>7}  {:>7}  {:>8}", "NODE", "CERT", "BUNDLE", "KEY COPY")?;
        writeln!(writer, "{}", "─".repeat(68))?;
        for node in &self.arranged {
            writeln!(
                writer,
                "{:<40}  {:>7}  {:>7}  {:>8}",
                truncate(&node.node, 40),
                if node.cert_written { "written" } else { "same" },
                if node.bundle_written { "written" } else { "same" },
                yes_no(node.key_copied)
            )?;
        }
        for node in &self.skipped {
            writeln!(writer, "{:<40}  skipped: no key", truncate(node, 40))?;
        }
        writeln!(writer)?;
        writeln!(
            writer,
            "Arranged: {}  Skipped: {}",
            self.arranged.len(),
            self.skipped.len()
        )?;
        Ok(())
    }
}

impl TableDisplay for VerificationReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Verification against {}", self.anchor.display())?;
        writeln!(writer, "══════════════════════════════════")?;
        for node in &self.nodes {
            writeln!(writer)?;
            writeln!(writer, "{} {}", status_mark(node.status()), node.node)?;
            for check in &node.checks {
                writeln!(
                    writer,
                    "  {} {:<18} {}",
                    status_mark(check.status),
                    check.name,
                    check.message
                )?;
            }
        }
        if !self.registry.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "Registry")?;
            for finding in &self.registry {
                writeln!(writer, "  {} {:<32} {}", status_mark(finding.status), finding.node, finding.message)?;
            }
        }
        writeln!(writer)?;
        writeln!(
            writer,
            "Nodes: {}  Passed: {}  Failed: {}  Warnings: {}",
            self.summary.total, self.summary.passed, self.summary.failed, self.summary.warned
        )?;
        Ok(())
    }
}

/// Truncate a string to a maximum length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    } else {
        s.chars().take(max_len).collect()
    }
}
