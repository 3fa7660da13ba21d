// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Trishard Node
//!
//! Entry point for the `trishard-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the wallet store, wires the
//! collaborators, and serves the wallet API.
//!
//! The binary supports three subcommands:
//!
//! - `run`    : serve the wallet API and metrics
//! - `status` : query a running node's health endpoint
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use trishard_wallet::collaborator::LocalThresholdService;
use trishard_wallet::config::{ENVELOPE_FORMAT_VERSION, RECOVERY_CODE_HRP};
use trishard_wallet::provisioning::{HttpProvisioningService, ProvisioningService};
use trishard_wallet::recovery::{HttpReconstructionService, ReconstructionService};
use trishard_wallet::storage::WalletDb;
use trishard_wallet::WalletSession;

use cli::{Commands, TrishardCli};
use metrics::WalletMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TrishardCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

type Collaborators = (Arc<dyn ProvisioningService>, Arc<dyn ReconstructionService>);

/// Picks the in-process collaborator or the two HTTP services.
fn collaborators(args: &cli::RunArgs) -> Result<Collaborators> {
    if args.local_collaborator {
        tracing::warn!("using in-process collaborators; the signing seed is handled locally");
        let local = Arc::new(LocalThresholdService::new());
        let provisioning: Arc<dyn ProvisioningService> = local.clone();
        let reconstruction: Arc<dyn ReconstructionService> = local;
        return Ok((provisioning, reconstruction));
    }

    let timeout = Duration::from_secs(args.service_timeout_secs);
    let (Some(provisioning_url), Some(reconstruction_url)) =
        (&args.provisioning_url, &args.reconstruction_url)
    else {
        bail!("--provisioning-url and --reconstruction-url are required without --local-collaborator");
    };

    let provisioning: Arc<dyn ProvisioningService> = Arc::new(
        HttpProvisioningService::new(provisioning_url, timeout)
            .with_context(|| {
                format!("failed to build provisioning client for {provisioning_url}")
            })?,
    );
    let reconstruction: Arc<dyn ReconstructionService> = Arc::new(
        HttpReconstructionService::new(reconstruction_url, timeout).with_context(|| {
            format!("failed to build reconstruction client for {reconstruction_url}")
        })?,
    );
    tracing::info!(%provisioning_url, %reconstruction_url, "using remote collaborators");
    Ok((provisioning, reconstruction))
}

/// Serves the wallet API and the metrics endpoint until shutdown.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting trishard-node"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = WalletDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Wallet facade ---
    let (provisioning, reconstruction) = collaborators(&args)?;
    let wallets = Arc::new(WalletSession::new(
        db.clone(),
        provisioning,
        reconstruction,
        args.lifecycle_config(),
    ));

    // --- Metrics ---
    let wallet_metrics =
        Arc::new(WalletMetrics::new().context("failed to register prometheus metrics")?);

    let app_state = api::AppState {
        wallets,
        metrics: Arc::clone(&wallet_metrics),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("wallet API listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&wallet_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    db.flush().context("failed to flush wallet store")?;
    tracing::info!("trishard-node stopped");
    Ok(())
}

/// Queries a running node's health endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/health", args.api_url.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("health endpoint returned a non-JSON body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("node reported {}", status);
    }
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("trishard-node  {}", env!("CARGO_PKG_VERSION"));
    println!("envelope       v{}", ENVELOPE_FORMAT_VERSION);
    println!("recovery code  {}1…", RECOVERY_CODE_HRP);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
