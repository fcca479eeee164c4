//! Command-line argument parsing with clap.
//!
//! Every flag is optional and overrides the matching field of the config
//! section it belongs to; anything left unset keeps the file (or built-in)
//! value.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use claw_nodecert::config::{ArrangeConfig, CaConfig, KeySource, RequestConfig, VerifyConfig};

/// Clawbernetes node certificate provisioning.
#[derive(Parser, Debug, Clone)]
#[command(name = "nodecert")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file.
    #[arg(short, long, env = "NODECERT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table, global = true)]
    pub format: Format,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[derive(Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate keys and signing requests for every registry node.
    Request(RequestArgs),

    /// Sign pending requests with the cluster CA.
    Sign(SignArgs),

    /// Place signed certificates into the node tree and build bundles.
    Arrange(ArrangeArgs),

    /// Verify every node directory against the trust anchor.
    Verify(VerifyArgs),
}

/// Arguments for the request command.
#[derive(Args, Debug, Clone, Default)]
pub struct RequestArgs {
    /// Node registry file.
    #[arg(short, long, env = "NODECERT_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Base distinguished name, e.g. `O=Acme,OU=Infra`.
    #[arg(short, long, env = "NODECERT_DN_TEMPLATE")]
    pub dn_template: Option<String>,

    /// Suffix for cluster-qualified alternative names.
    #[arg(long, env = "NODECERT_CLUSTER_SUFFIX")]
    pub cluster_suffix: Option<String>,

    /// Node tree root.
    #[arg(short, long, env = "NODECERT_NODE_DIR")]
    pub node_dir: Option<PathBuf>,

    /// Request queue directory.
    #[arg(short, long, env = "NODECERT_QUEUE_DIR")]
    pub queue_dir: Option<PathBuf>,

    /// RSA key size in bits.
    #[arg(long)]
    pub key_bits: Option<usize>,

    /// Concurrent workers.
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl RequestArgs {
    /// Overlays these flags onto `cfg`.
    pub fn apply(&self, cfg: &mut RequestConfig) {
        if let Some(v) = &self.registry {
            cfg.registry.clone_from(v);
        }
        if let Some(v) = &self.dn_template {
            cfg.dn_template = Some(v.clone());
        }
        if let Some(v) = &self.cluster_suffix {
            cfg.cluster_suffix = Some(v.clone());
        }
        if let Some(v) = &self.node_dir {
            cfg.node_dir.clone_from(v);
        }
        if let Some(v) = &self.queue_dir {
            cfg.queue_dir.clone_from(v);
        }
        if let Some(v) = self.key_bits {
            cfg.key_bits = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
    }
}

/// Arguments for the sign command.
#[derive(Args, Debug, Clone, Default)]
pub struct SignArgs {
    /// CA state directory.
    #[arg(long, env = "NODECERT_CA_DIR")]
    pub ca_dir: Option<PathBuf>,

    /// Request queue directory.
    #[arg(short, long, env = "NODECERT_QUEUE_DIR")]
    pub queue_dir: Option<PathBuf>,

    /// Parent directory of signed batches.
    #[arg(short, long, env = "NODECERT_OUT_DIR")]
    pub out_dir: Option<PathBuf>,

    /// Base distinguished name of the CA certificates.
    #[arg(short, long)]
    pub dn_template: Option<String>,

    /// Root CA common name.
    #[arg(long)]
    pub common_name: Option<String>,

    /// Issue leaves from an intermediate CA.
    #[arg(long)]
    pub intermediate: bool,

    /// Leaf validity in days.
    #[arg(long)]
    pub validity_days: Option<u32>,

    /// CA certificate validity in days.
    #[arg(long)]
    pub ca_validity_days: Option<u32>,

    /// CA key size in bits.
    #[arg(long)]
    pub key_bits: Option<usize>,

    /// Sign requests again even if the ledger already records them.
    #[arg(long)]
    pub resign: bool,

    /// Seconds to wait for the ledger lock.
    #[arg(long)]
    pub lock_timeout: Option<u64>,
}

impl SignArgs {
    /// Overlays these flags onto `cfg`.
    pub fn apply(&self, cfg: &mut CaConfig) {
        if let Some(v) = &self.ca_dir {
            cfg.ca_dir.clone_from(v);
        }
        if let Some(v) = &self.queue_dir {
            cfg.queue_dir.clone_from(v);
        }
        if let Some(v) = &self.out_dir {
            cfg.out_dir.clone_from(v);
        }
        if let Some(v) = &self.dn_template {
            cfg.dn_template.clone_from(v);
        }
        if let Some(v) = &self.common_name {
            cfg.common_name.clone_from(v);
        }
        cfg.intermediate |= self.intermediate;
        cfg.resign |= self.resign;
        if let Some(v) = self.validity_days {
            cfg.validity_days = v;
        }
        if let Some(v) = self.ca_validity_days {
            cfg.ca_validity_days = v;
        }
        if let Some(v) = self.key_bits {
            cfg.key_bits = v;
        }
        if let Some(v) = self.lock_timeout {
            cfg.lock_timeout_secs = v;
        }
    }
}

/// Where the arranger takes node keys from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeySourceArg {
    /// Keys already exist in the node tree.
    Local,
    /// Keys sit next to the certificates in the batch.
    Signed,
}

impl From<KeySourceArg> for KeySource {
    fn from(arg: KeySourceArg) -> Self {
        match arg {
            KeySourceArg::Local => Self::Local,
            KeySourceArg::Signed => Self::Signed,
        }
    }
}

/// Arguments for the arrange command.
#[derive(Args, Debug, Clone, Default)]
pub struct ArrangeArgs {
    /// Signed batch directory, or the parent of several batches.
    pub signed_dir: Option<PathBuf>,

    /// Trust anchor; taken from the batch when omitted.
    #[arg(long, env = "NODECERT_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// Node tree root.
    #[arg(short, long, env = "NODECERT_NODE_DIR")]
    pub node_dir: Option<PathBuf>,

    /// Key provenance.
    #[arg(short, long, value_enum)]
    pub key_source: Option<KeySourceArg>,
}

impl ArrangeArgs {
    /// Overlays these flags onto `cfg`.
    pub fn apply(&self, cfg: &mut ArrangeConfig) {
        if let Some(v) = &self.signed_dir {
            cfg.signed_dir.clone_from(v);
        }
        if let Some(v) = &self.ca_cert {
            cfg.ca_cert = Some(v.clone());
        }
        if let Some(v) = &self.node_dir {
            cfg.node_dir.clone_from(v);
        }
        if let Some(v) = self.key_source {
            cfg.key_source = v.into();
        }
    }
}

/// Arguments for the verify command.
#[derive(Args, Debug, Clone, Default)]
pub struct VerifyArgs {
    /// Node tree root.
    #[arg(short, long, env = "NODECERT_NODE_DIR")]
    pub node_dir: Option<PathBuf>,

    /// Trust anchor; defaults to `<node-dir>/ca.crt`.
    #[arg(long, env = "NODECERT_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// Registry to check the node tree against.
    #[arg(short, long, env = "NODECERT_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Warn about certificates expiring within this many days.
    #[arg(long)]
    pub warn_days: Option<u32>,

    /// Concurrent workers.
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl VerifyArgs {
    /// Overlays these flags onto `cfg`.
    pub fn apply(&self, cfg: &mut VerifyConfig) {
        if let Some(v) = &self.node_dir {
            cfg.node_dir.clone_from(v);
        }
        if let Some(v) = &self.ca_cert {
            cfg.ca_cert = Some(v.clone());
        }
        if let Some(v) = &self.registry {
            cfg.registry = Some(v.clone());
        }
        if let Some(v) = self.warn_days {
            cfg.warn_days = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_flags() {
        let cli = Cli::parse_from([
            "nodecert",
            "request",
            "--dn-template",
            "O=Acme,OU=Infra",
            "--registry",
            "hosts.txt",
            "--key-bits",
            "2048",
        ]);
        let Commands::Request(args) = cli.command else {
            panic!("expected request command");
        };
        let mut cfg = RequestConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.dn_template.as_deref(), Some("O=Acme,OU=Infra"));
        assert_eq!(cfg.registry, PathBuf::from("hosts.txt"));
        assert_eq!(cfg.key_bits, 2048);
        assert_eq!(cfg.node_dir, PathBuf::from("nodes"));
    }

    #[test]
    fn sign_flags_only_override_what_is_set() {
        let cli = Cli::parse_from(["nodecert", "sign", "--intermediate", "--validity-days", "90"]);
        let Commands::Sign(args) = cli.command else {
            panic!("expected sign command");
        };
        let mut cfg = CaConfig {
            resign: true,
            ..CaConfig::default()
        };
        args.apply(&mut cfg);
        assert!(cfg.intermediate);
        assert!(cfg.resign);
        assert_eq!(cfg.validity_days, 90);
        assert_eq!(cfg.ca_validity_days, 3650);
    }

    #[test]
    fn parses_arrange_positional_and_key_source() {
        let cli = Cli::parse_from(["nodecert", "arrange", "signed/batch", "--key-source", "signed"]);
        let Commands::Arrange(args) = cli.command else {
            panic!("expected arrange command");
        };
        let mut cfg = ArrangeConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.signed_dir, PathBuf::from("signed/batch"));
        assert_eq!(cfg.key_source, KeySource::Signed);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["nodecert", "verify", "--format", "json", "--warn-days", "7"]);
        assert_eq!(cli.format, Format::Json);
        let Commands::Verify(args) = cli.command else {
            panic!("expected verify command");
        };
        assert_eq!(args.warn_days, Some(7));
    }

    #[test]
    fn default_format_is_table() {
        let cli = Cli::parse_from(["nodecert", "verify"]);
        assert_eq!(cli.format, Format::Table);
        assert!(!cli.log_json);
    }
}
