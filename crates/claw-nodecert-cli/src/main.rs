//! Node certificate CLI binary entrypoint.
//!
//! This is the main entry point for the `nodecert` command-line tool.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use claw_nodecert::NodeCertConfig;
use claw_nodecert_cli::cli::{Cli, Commands};
use claw_nodecert_cli::commands::{ArrangeCommand, RequestCommand, SignCommand, VerifyCommand};
use claw_nodecert_cli::output::OutputFormat;

fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<(), claw_nodecert_cli::CliError> {
    let format = OutputFormat::new(cli.format);
    let mut config = match &cli.config {
        Some(path) => NodeCertConfig::load(path)?,
        None => NodeCertConfig::default(),
    };
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Request(args) => {
            args.apply(&mut config.request);
            let cmd = RequestCommand::new(config.request);
            cmd.execute(&mut stdout, &format).await?;
        }
        Commands::Sign(args) => {
            args.apply(&mut config.ca);
            let cmd = SignCommand::new(config.ca);
            cmd.execute(&mut stdout, &format).await?;
        }
        Commands::Arrange(args) => {
            args.apply(&mut config.arrange);
            let cmd = ArrangeCommand::new(config.arrange);
            cmd.execute(&mut stdout, &format)?;
        }
        Commands::Verify(args) => {
            args.apply(&mut config.verify);
            let cmd = VerifyCommand::new(config.verify);
            cmd.execute(&mut stdout, &format).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sign() {
        let cli = Cli::parse_from(["nodecert", "sign"]);
        assert!(matches!(cli.command, Commands::Sign(_)));
    }

    #[tokio::test]
    async fn missing_config_file_fails() {
        let cli = Cli::parse_from(["nodecert", "--config", "/nonexistent/nodecert.json", "verify"]);
        assert!(run(cli).await.is_err());
    }

    #[tokio::test]
    async fn request_without_template_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = tmp.path().join("nodes.txt");
        std::fs::write(&registry, "db1.example.com\n").unwrap();
        let cli = Cli::parse_from(["nodecert", "request", "--registry", registry.to_str().unwrap()]);
        let Commands::Request(mut args) = cli.command.clone() else {
            panic!("expected request command");
        };
        args.dn_template = None;
        let cli = Cli {
            command: Commands::Request(args),
            ..cli
        };
        assert!(run(cli).await.is_err());
    }
}
