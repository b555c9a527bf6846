//! Key Vault Exporter - Azure Key Vault inventory metrics
//!
//! This binary walks the configured subscriptions on a fixed interval and
//! serves the keys, secrets and certificates it finds as Prometheus metrics.

use anyhow::{Context, Result};
use exporter_lib::{
    azure::{build_backend, AuthMode, AzureBackendConfig},
    collector::{CollectionLoopBuilder, CollectionOrchestrator},
    observability::{ExporterMetrics, StructuredLogger},
    registry::{MetricRegistry, MetricSchema, TagLabels},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::ExporterConfig::load()?;
    init_tracing(config.log_json);
    config.validate()?;

    info!(
        instance = %config.instance,
        interval_secs = config.scrape_interval_secs,
        concurrency = config.concurrency,
        "Starting keyvault-exporter"
    );

    // Azure backend
    let backend = build_backend(AzureBackendConfig {
        endpoints: config.azure_cloud()?.endpoints(),
        auth: AuthMode::from_env()?,
        subscriptions: config.subscriptions.clone(),
        vault_filter: config.vault_filter.clone(),
        request_timeout: config.request_timeout(),
    })
    .context("failed to build azure client")?;

    // Snapshot collector and self-metrics share one registry
    let registry = prometheus::Registry::new();
    let schema = MetricSchema::new(
        TagLabels::new(&config.vault_tags),
        TagLabels::new(&config.content_tags),
    );
    let metric_registry = MetricRegistry::new(Arc::new(schema))?;
    metric_registry.register(&registry)?;
    let metrics = ExporterMetrics::new(&registry)?;

    let logger = StructuredLogger::new(&config.instance);
    let orchestrator = Arc::new(
        CollectionOrchestrator::new(backend, metric_registry, config.orchestrator_config())
            .with_metrics(metrics)
            .with_logger(logger.clone()),
    );

    // No usable identity is fatal
    let subscriptions = orchestrator
        .preflight()
        .await
        .context("startup check against azure failed")?;
    logger.log_startup(EXPORTER_VERSION, subscriptions);

    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler = CollectionLoopBuilder::new()
        .orchestrator(orchestrator)
        .interval(config.scrape_interval())
        .jitter(config.scrape_jitter())
        .run_on_start(config.run_on_start)
        .build()?;
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(registry));
    let mut api_handle = tokio::spawn(api::serve(
        config.bind_addr()?,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    let reason = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            "SIGINT received"
        }
        result = &mut api_handle => {
            let err = match result {
                Ok(Ok(())) => anyhow::anyhow!("API server stopped unexpectedly"),
                Ok(Err(e)) => e,
                Err(e) => e.into(),
            };
            error!(error = %err, "API server failed");
            let _ = shutdown_tx.send(());
            scheduler_handle.await?;
            return Err(err);
        }
    };

    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());
    scheduler_handle.await?;
    api_handle.await??;
    info!("Shutdown complete");

    Ok(())
}
