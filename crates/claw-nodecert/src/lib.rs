//! Node certificate provisioning for Clawbernetes clusters.
#![forbid(unsafe_code)]
//!
//! This crate provisions and audits the X.509 trust material of cluster
//! nodes: per-node keys and signing requests, a file-backed certificate
//! authority, deployable bundles, and a verification engine.
//!
//! # Overview
//!
//! The pipeline has four stages, each driven by its own config section:
//! - [`request::generate_all`] reads the node registry and writes a key,
//!   `options.cnf` and CSR per node, queueing each CSR for the CA
//! - [`ca::sign_pending`] bootstraps the CA (root, optionally an
//!   intermediate) and signs every pending request into a new batch
//! - [`arrange::arrange`] places signed certificates into the node tree and
//!   assembles `web.pem` bundles
//! - [`verify::verify_all`] audits every node directory against the anchor
//!
//! # Example
//!
//! ```no_run
//! use claw_nodecert::{config::NodeCertConfig, request, ca, arrange, verify};
//!
//! # async fn run() -> claw_nodecert::Result<()> {
//! let mut cfg = NodeCertConfig::default();
//! cfg.request.dn_template = Some("O=Acme,OU=Infra".into());
//!
//! request::generate_all(&cfg.request).await?;
//! let batch = ca::sign_pending(&cfg.ca)?;
//! cfg.arrange.signed_dir = batch.batch_dir;
//! arrange::arrange(&cfg.arrange)?;
//!
//! let report = verify::verify_all(&cfg.verify).await?;
//! assert!(!report.has_failures());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`registry`] - Node registry parsing
//! - [`naming`] - Filesystem-safe node names
//! - [`dn`] - Distinguished name templates
//! - [`der`] - Name rewriting for generated DER
//! - [`san`] - Subject alternative names
//! - [`request`] - Key and CSR generation
//! - [`ca`] - Certificate authority and signing
//! - [`ledger`] - Serial counter and issuance ledger
//! - [`policy`] - Subject matching policies
//! - [`arrange`] - Bundle assembly
//! - [`verify`] - Verification engine
//! - [`pem`] - PEM block scanner
//! - [`keys`] - Private keys and fingerprints
//! - [`config`] - Configuration model
//! - [`error`] - Error types

pub mod arrange;
pub mod ca;
pub mod config;
pub mod der;
pub mod dn;
pub mod error;
pub mod fsutil;
pub mod keys;
pub mod ledger;
pub mod naming;
pub mod pem;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod request;
pub mod san;
pub mod verify;

// Re-export commonly used types at crate root
pub use arrange::{arrange, ArrangeSummary};
pub use ca::{sign_pending, CertificateAuthority, SignSummary};
pub use config::{ArrangeConfig, CaConfig, KeySource, NodeCertConfig, RequestConfig, VerifyConfig};
pub use error::{Error, Result};
pub use registry::{NodeIdentity, Registry};
pub use request::{generate_all, RequestSummary};
pub use verify::{verify_all, CheckStatus, VerificationReport};
