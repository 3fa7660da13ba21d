//! # Prometheus Metrics
//!
//! Operational counters for the wallet lifecycle. Scraped by Prometheus at
//! `/metrics`, served both on the API router and on the dedicated metrics
//! port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] under
//! the `trishard` prefix so they do not collide with the default global
//! registry.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

use trishard_wallet::WalletError;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct WalletMetrics {
    registry: Registry,
    pub wallets_created_total: IntCounter,
    pub provisioning_failures_total: IntCounter,
    pub recovery_sessions_started_total: IntCounter,
    pub recovery_sessions_completed_total: IntCounter,
    pub recovery_sessions_failed_total: IntCounter,
    /// Corrupted shards and address mismatches. Never wrong credentials.
    pub integrity_errors_total: IntCounter,
    pub backups_exported_total: IntCounter,
    /// Facade call latency, labelled by operation.
    pub operation_latency_seconds: HistogramVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl WalletMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("trishard".into()), None)?;

        let operation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Wallet facade call latency in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_latency_seconds.clone()))?;

        Ok(Self {
            wallets_created_total: counter(
                &registry,
                "wallets_created_total",
                "Wallets provisioned through this node",
            )?,
            provisioning_failures_total: counter(
                &registry,
                "provisioning_failures_total",
                "Provisioning attempts that did not produce a usable wallet",
            )?,
            recovery_sessions_started_total: counter(
                &registry,
                "recovery_sessions_started_total",
                "Recovery sessions opened",
            )?,
            recovery_sessions_completed_total: counter(
                &registry,
                "recovery_sessions_completed_total",
                "Recovery sessions that rebuilt the wallet",
            )?,
            recovery_sessions_failed_total: counter(
                &registry,
                "recovery_sessions_failed_total",
                "Recovery sessions closed without rebuilding the wallet",
            )?,
            integrity_errors_total: counter(
                &registry,
                "integrity_errors_total",
                "Corrupted shard material or reconstructed address mismatches",
            )?,
            backups_exported_total: counter(
                &registry,
                "backups_exported_total",
                "Backup shards shown to a user",
            )?,
            operation_latency_seconds,
            registry,
        })
    }

    /// Starts a latency timer for `operation`. Dropping it records nothing;
    /// call [`LatencyTimer::observe`].
    pub fn timer(&self, operation: &'static str) -> LatencyTimer<'_> {
        LatencyTimer {
            metrics: self,
            operation,
            started: Instant::now(),
        }
    }

    pub fn record_error(&self, error: &WalletError) {
        if error.is_integrity_failure() {
            self.integrity_errors_total.inc();
        }
        if matches!(error, WalletError::TooManyFailedAttempts | WalletError::AddressMismatch { .. }) {
            self.recovery_sessions_failed_total.inc();
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub struct LatencyTimer<'a> {
    metrics: &'a WalletMetrics,
    operation: &'static str,
    started: Instant,
}

impl LatencyTimer<'_> {
    pub fn observe(self) {
        self.metrics
            .operation_latency_seconds
            .with_label_values(&[self.operation])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<WalletMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
