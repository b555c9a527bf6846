//! Observability infrastructure for the exporter
//!
//! Provides:
//! - Prometheus self-metrics (cycle latency, outcomes, per-scope errors)
//! - Structured JSON lifecycle events with tracing

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use tracing::{error, info, warn};

/// Histogram buckets for collection cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0,
];

/// Outcome label values for `keyvault_exporter_collection_cycles_total`
pub mod outcomes {
    pub const PUBLISHED: &str = "published";
    pub const ABORTED: &str = "aborted";
    pub const SKIPPED: &str = "skipped";
    pub const TIMEOUT: &str = "timeout";
}

/// Exporter self-metrics.
///
/// Registered on an injected registry rather than the process default, so
/// several instances can live side by side in tests. Clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    collection_duration_seconds: Histogram,
    collection_cycles: IntCounterVec,
    collection_errors: IntCounterVec,
    vaults_collected: IntGauge,
    last_success_timestamp: Gauge,
}

impl ExporterMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            collection_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "keyvault_exporter_collection_duration_seconds",
                    "Time spent in a complete collection cycle",
                )
                .buckets(CYCLE_BUCKETS.to_vec()),
            )?,
            collection_cycles: IntCounterVec::new(
                Opts::new(
                    "keyvault_exporter_collection_cycles_total",
                    "Collection cycles by outcome",
                ),
                &["result"],
            )?,
            collection_errors: IntCounterVec::new(
                Opts::new(
                    "keyvault_exporter_collection_errors_total",
                    "Remote listing failures by scope",
                ),
                &["scope"],
            )?,
            vaults_collected: IntGauge::new(
                "keyvault_exporter_vaults_collected",
                "Vaults contributing to the last published snapshot",
            )?,
            last_success_timestamp: Gauge::new(
                "keyvault_exporter_last_success_timestamp_seconds",
                "Unix time of the last published snapshot",
            )?,
        };

        registry.register(Box::new(metrics.collection_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.collection_cycles.clone()))?;
        registry.register(Box::new(metrics.collection_errors.clone()))?;
        registry.register(Box::new(metrics.vaults_collected.clone()))?;
        registry.register(Box::new(metrics.last_success_timestamp.clone()))?;

        Ok(metrics)
    }

    /// Record the duration of a finished cycle
    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.collection_duration_seconds.observe(duration_secs);
    }

    /// Count a cycle outcome, see [`outcomes`]
    pub fn inc_cycle(&self, outcome: &str) {
        self.collection_cycles.with_label_values(&[outcome]).inc();
    }

    /// Count a failed remote listing
    pub fn inc_collection_error(&self, scope: &str) {
        self.collection_errors.with_label_values(&[scope]).inc();
    }

    /// Update the figures describing the last published snapshot
    pub fn set_published(&self, vaults: i64, timestamp_secs: f64) {
        self.vaults_collected.set(vaults);
        self.last_success_timestamp.set(timestamp_secs);
    }

    pub fn cycles(&self, outcome: &str) -> u64 {
        self.collection_cycles.with_label_values(&[outcome]).get()
    }

    pub fn collection_errors(&self, scope: &str) -> u64 {
        self.collection_errors.with_label_values(&[scope]).get()
    }
}

/// Structured logger for exporter lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, subscriptions: usize) {
        info!(
            event = "exporter_started",
            instance = %self.instance,
            exporter_version = %version,
            subscriptions = subscriptions,
            "Key vault exporter started"
        );
    }

    /// Log a published collection cycle
    pub fn log_cycle_published(
        &self,
        cycle: u64,
        vaults: usize,
        observations: usize,
        degraded_scopes: usize,
        elapsed_ms: u128,
    ) {
        if degraded_scopes > 0 {
            warn!(
                event = "collection_cycle",
                instance = %self.instance,
                cycle = cycle,
                vaults = vaults,
                observations = observations,
                degraded_scopes = degraded_scopes,
                elapsed_ms = elapsed_ms,
                "Collection cycle published with degraded vaults"
            );
        } else {
            info!(
                event = "collection_cycle",
                instance = %self.instance,
                cycle = cycle,
                vaults = vaults,
                observations = observations,
                elapsed_ms = elapsed_ms,
                "Collection cycle published"
            );
        }
    }

    /// Log a cycle that ended without publishing
    pub fn log_cycle_aborted(&self, reason: &str) {
        error!(
            event = "collection_cycle",
            instance = %self.instance,
            outcome = "aborted",
            reason = %reason,
            "Collection cycle aborted, keeping previous snapshot"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Key vault exporter shutting down"
        );
    }
}
