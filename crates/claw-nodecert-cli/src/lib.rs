//! # claw-nodecert-cli
//!
//! Command-line front end for node certificate provisioning.
//!
//! Provides commands for:
//! - Generating node keys and signing requests from the registry
//! - Signing pending requests with the cluster CA
//! - Arranging signed certificates into deployable bundles
//! - Verifying the node tree against the trust anchor
//!
//! Each command starts from the defaults (or a `--config` JSON file) and
//! overlays its flags before calling into `claw-nodecert`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format};
pub use error::CliError;
pub use output::OutputFormat;
