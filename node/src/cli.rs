//! # CLI Interface
//!
//! Command-line arguments for `trishard-node`, via `clap` derive. Every
//! `run` flag can also come from a `TRISHARD_*` environment variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use trishard_wallet::config::{
    KdfParams, LifecycleConfig, DEFAULT_API_PORT, DEFAULT_MAX_FAILED_SUBMISSIONS,
    DEFAULT_METRICS_PORT,
};

use crate::logging::LogFormat;

/// Trishard wallet lifecycle node.
///
/// Serves the wallet facade (provisioning, backup, recovery) over HTTP for
/// a UI layer, backed by a local sled store and two remote collaborators.
#[derive(Parser, Debug)]
#[command(
    name = "trishard-node",
    about = "Threshold wallet lifecycle manager",
    version,
    propagate_version = true
)]
pub struct TrishardCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP API and metrics endpoints.
    Run(RunArgs),
    /// Query a running node's health endpoint.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding the wallet store. Created on first run.
    #[arg(long, short = 'd', env = "TRISHARD_DATA_DIR", default_value = "./trishard-data")]
    pub data_dir: PathBuf,

    /// Port for the wallet API.
    #[arg(long, env = "TRISHARD_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "TRISHARD_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Base URL of the Wallet Provisioning Service.
    #[arg(long, env = "TRISHARD_PROVISIONING_URL", required_unless_present = "local_collaborator")]
    pub provisioning_url: Option<String>,

    /// Base URL of the Threshold Reconstruction Service.
    #[arg(long, env = "TRISHARD_RECONSTRUCTION_URL", required_unless_present = "local_collaborator")]
    pub reconstruction_url: Option<String>,

    /// Run both collaborators in-process. Development only: the signing
    /// seed is handled inside this process.
    #[arg(long, env = "TRISHARD_LOCAL_COLLABORATOR", conflicts_with_all = ["provisioning_url", "reconstruction_url"])]
    pub local_collaborator: bool,

    /// Timeout for each collaborator request, in seconds.
    #[arg(long, env = "TRISHARD_SERVICE_TIMEOUT_SECS", default_value_t = 30)]
    pub service_timeout_secs: u64,

    /// Failed shard submissions allowed per recovery session.
    #[arg(long, env = "TRISHARD_MAX_FAILED_SUBMISSIONS", default_value_t = DEFAULT_MAX_FAILED_SUBMISSIONS)]
    pub max_failed_submissions: u32,

    /// Lifetime of a recovery session, in seconds.
    #[arg(long, env = "TRISHARD_SESSION_TTL_SECS", default_value_t = 24 * 60 * 60)]
    pub session_ttl_secs: u64,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "TRISHARD_LOG_FORMAT", default_value = "pretty", value_parser = LogFormat::parse)]
    pub log_format: LogFormat,
}

impl RunArgs {
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            max_failed_submissions: self.max_failed_submissions,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            kdf: KdfParams::default(),
            service_timeout: Duration::from_secs(self.service_timeout_secs),
        }
    }
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// API endpoint of the running node.
    #[arg(long, env = "TRISHARD_API_URL", default_value = "http://127.0.0.1:9751")]
    pub api_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        TrishardCli::command().debug_assert();
    }

    #[test]
    fn local_collaborator_needs_no_urls() {
        let cli = TrishardCli::try_parse_from(["trishard-node", "run", "--local-collaborator"])
            .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.local_collaborator);
        assert_eq!(args.api_port, DEFAULT_API_PORT);
        assert_eq!(args.lifecycle_config().max_failed_submissions, 5);
    }

    #[test]
    fn remote_mode_requires_both_urls() {
        let result = TrishardCli::try_parse_from([
            "trishard-node",
            "run",
            "--provisioning-url",
            "http://prov.local",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn json_log_format_parses() {
        let cli = TrishardCli::try_parse_from([
            "trishard-node",
            "run",
            "--local-collaborator",
            "--log-format",
            "json",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
