//! Collection cycle orchestration
//!
//! One cycle walks every subscription, fans out one task per vault, waits for
//! all of them and only then publishes the aggregated observations:
//!
//! ```text
//! Idle → Walking → Collecting → Publishing → Idle
//! ```
//!
//! Tasks never touch the registry. They send their observations over a
//! private channel which is drained once the join barrier has been passed.

use super::builder::{ObservationBuilder, VaultObservations};
use super::walker::{ResourceWalker, DEFAULT_REQUEST_TIMEOUT};
use crate::client::{Audience, Backend, RequestContext};
use crate::error::{ClientError, ClientResult, CycleError};
use crate::observability::{outcomes, ExporterMetrics, StructuredLogger};
use crate::registry::MetricRegistry;
use crate::models::VaultTarget;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Where the current cycle is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    /// Resolving credentials and subscriptions, enumerating vaults and
    /// starting a task per vault
    Walking,
    /// Enumeration finished, waiting for the remaining vault tasks
    Collecting,
    Publishing,
}

/// Configuration for collection cycles
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum vault tasks in flight (default: 10)
    pub concurrency: usize,
    /// Only collect vaults in this resource group
    pub resource_group: Option<String>,
    /// Timeout for a single remote call or listing page (default: 30 seconds)
    pub request_timeout: Duration,
    /// Upper bound for a whole cycle (default: 10 minutes)
    pub cycle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            resource_group: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cycle_timeout: Duration::from_secs(600),
        }
    }
}

/// Summary of a published cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub subscriptions: usize,
    pub failed_subscriptions: usize,
    pub vaults: usize,
    pub observations: usize,
    /// Vault item kinds that could not be listed
    pub degraded_scopes: usize,
    pub elapsed: Duration,
}

/// How a call to [`CollectionOrchestrator::run_cycle`] ended
#[derive(Debug)]
pub enum CycleOutcome {
    Published(CycleReport),
    /// Another cycle was still running
    Skipped,
    /// The cycle failed before publishing; the previous snapshot stays live
    Aborted(CycleError),
    /// The cycle exceeded its bound and its tasks were cancelled
    TimedOut,
}

impl CycleOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, CycleOutcome::Published(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Published(_) => outcomes::PUBLISHED,
            CycleOutcome::Skipped => outcomes::SKIPPED,
            CycleOutcome::Aborted(_) => outcomes::ABORTED,
            CycleOutcome::TimedOut => outcomes::TIMEOUT,
        }
    }
}

/// Runs collection cycles against a backend and publishes into a registry
pub struct CollectionOrchestrator {
    backend: Backend,
    registry: MetricRegistry,
    config: OrchestratorConfig,
    metrics: Option<ExporterMetrics>,
    logger: Option<StructuredLogger>,
    phase: watch::Sender<CyclePhase>,
    running: Mutex<()>,
}

impl CollectionOrchestrator {
    pub fn new(backend: Backend, registry: MetricRegistry, config: OrchestratorConfig) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        Self {
            backend,
            registry,
            config,
            metrics: None,
            logger: None,
            phase,
            running: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<CyclePhase> {
        self.phase.subscribe()
    }

    /// True while a cycle holds the run lock
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Count a cycle that was never started because another was running
    pub fn record_skipped(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_cycle(outcomes::SKIPPED);
        }
    }

    /// Check that credentials work and subscriptions can be listed.
    ///
    /// Returns the number of visible subscriptions.
    pub async fn preflight(&self) -> Result<usize, CycleError> {
        let ctx = self.management_context().await?;
        let subscriptions = self
            .bounded(self.backend.subscriptions.list_subscriptions(&ctx))
            .await
            .map_err(CycleError::Subscriptions)?;
        Ok(subscriptions.len())
    }

    /// Run one cycle, or skip it if another is still in progress
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous collection cycle still running, skipping");
            self.record_skipped();
            return CycleOutcome::Skipped;
        };

        let start = Instant::now();
        let outcome = match timeout(self.config.cycle_timeout, self.collect(start)).await {
            Ok(Ok(report)) => CycleOutcome::Published(report),
            Ok(Err(err)) => CycleOutcome::Aborted(err),
            Err(_) => CycleOutcome::TimedOut,
        };
        self.set_phase(CyclePhase::Idle);

        self.record(&outcome, start.elapsed());
        outcome
    }

    async fn collect(&self, start: Instant) -> Result<CycleReport, CycleError> {
        self.set_phase(CyclePhase::Walking);

        let management = self.management_context().await?;
        // Vault tasks fetch their own context when they start; this only
        // checks that the data-plane identity works before fanning out
        self.bounded(self.backend.credentials.acquire_context(Audience::Vault))
            .await
            .map_err(CycleError::Credentials)?;

        let subscriptions = self
            .bounded(self.backend.subscriptions.list_subscriptions(&management))
            .await
            .map_err(CycleError::Subscriptions)?;
        let subscription_count = subscriptions.len();

        let include = match &self.backend.filter {
            Some(filter) => Some(
                self.bounded(filter.resolve(&management, &subscriptions))
                    .await
                    .map_err(CycleError::Filter)?,
            ),
            None => None,
        };

        let mut walker = ResourceWalker::new(Arc::clone(&self.backend.vaults), management, subscriptions)
            .resource_group(self.config.resource_group.clone())
            .request_timeout(self.config.request_timeout);
        if let Some(ids) = include {
            debug!(vaults = ids.len(), "Vault filter resolved");
            walker = walker.include_only(ids);
        }

        let builder = Arc::new(
            ObservationBuilder::new(
                Arc::clone(&self.backend.items),
                Arc::clone(self.registry.schema()),
            )
            .request_timeout(self.config.request_timeout),
        );
        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel::<VaultObservations>();
        let mut tasks = JoinSet::new();
        // Resource id → vault for every spawned task without observations yet
        let mut pending: HashMap<String, VaultTarget> = HashMap::new();

        while let Some(target) = walker.next().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            pending.insert(target.vault.resource_id(), target.clone());
            let builder = Arc::clone(&builder);
            let credentials = Arc::clone(&self.backend.credentials);
            let request_timeout = self.config.request_timeout;
            let tx = tx.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let ctx = timeout(request_timeout, credentials.acquire_context(Audience::Vault))
                    .await
                    .unwrap_or(Err(ClientError::Timeout(request_timeout)));
                let observations = match ctx {
                    Ok(ctx) => builder.build(&ctx, &target).await,
                    Err(e) => {
                        warn!(vault = %target.vault.name, error = %e, "Failed to acquire vault credentials");
                        builder.unavailable(&target)
                    }
                };
                if let Err(e) = tx.send(observations) {
                    warn!(vault = %target.vault.name, error = %e, "Failed to hand off vault observations");
                }
            });
        }
        drop(tx);

        let walk = walker.stats().clone();
        for subscription in &walk.failed_subscriptions {
            debug!(subscription = %subscription, "Subscription contributed no vaults");
            self.count_error("subscription");
        }

        self.set_phase(CyclePhase::Collecting);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Vault collection task failed");
            }
        }

        self.set_phase(CyclePhase::Publishing);
        let mut collected = Vec::with_capacity(pending.len());
        while let Some(vault) = rx.recv().await {
            pending.remove(&vault.resource_id);
            collected.push(vault);
        }
        for target in pending.into_values() {
            warn!(
                subscription = %target.subscription.id,
                vault = %target.vault.name,
                "Vault task ended without observations, marking it inaccessible"
            );
            self.count_error("task");
            collected.push(builder.unavailable(&target));
        }

        let mut observations = Vec::new();
        let mut vaults = 0usize;
        let mut degraded_scopes = 0usize;
        for vault in collected {
            debug!(
                vault = %vault.vault_name,
                observations = vault.observations.len(),
                degraded = vault.degraded.len(),
                "Aggregating vault observations"
            );
            vaults += 1;
            degraded_scopes += vault.degraded.len();
            for kind in &vault.degraded {
                self.count_error(kind.as_str());
            }
            observations.extend(vault.observations);
        }

        let observation_count = observations.len();
        let snapshot = self.registry.publish(observations)?;

        Ok(CycleReport {
            cycle: snapshot.cycle,
            subscriptions: subscription_count,
            failed_subscriptions: walk.failed_subscriptions.len(),
            vaults,
            observations: observation_count,
            degraded_scopes,
            elapsed: start.elapsed(),
        })
    }

    async fn management_context(&self) -> Result<RequestContext, CycleError> {
        self.bounded(self.backend.credentials.acquire_context(Audience::Management))
            .await
            .map_err(CycleError::Credentials)
    }

    /// Apply the request timeout to a single remote call
    async fn bounded<T>(&self, call: impl Future<Output = ClientResult<T>>) -> ClientResult<T> {
        timeout(self.config.request_timeout, call)
            .await
            .unwrap_or(Err(ClientError::Timeout(self.config.request_timeout)))
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.phase.send_replace(phase);
    }

    fn count_error(&self, scope: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_collection_error(scope);
        }
    }

    fn record(&self, outcome: &CycleOutcome, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_cycle(outcome.label());
            metrics.observe_cycle_duration(elapsed.as_secs_f64());
        }

        match outcome {
            CycleOutcome::Published(report) => {
                if let Some(metrics) = &self.metrics {
                    let published_at = self
                        .registry
                        .snapshot()
                        .map(|snapshot| snapshot.published_at.timestamp() as f64)
                        .unwrap_or_default();
                    metrics.set_published(report.vaults as i64, published_at);
                }
                match &self.logger {
                    Some(logger) => logger.log_cycle_published(
                        report.cycle,
                        report.vaults,
                        report.observations,
                        report.degraded_scopes,
                        report.elapsed.as_millis(),
                    ),
                    None => info!(
                        cycle = report.cycle,
                        vaults = report.vaults,
                        observations = report.observations,
                        "Collection cycle published"
                    ),
                }
            }
            CycleOutcome::Aborted(err) => self.log_aborted(&err.to_string()),
            CycleOutcome::TimedOut => self.log_aborted(&format!(
                "cycle exceeded {}s",
                self.config.cycle_timeout.as_secs()
            )),
            CycleOutcome::Skipped => {}
        }
    }

    fn log_aborted(&self, reason: &str) {
        match &self.logger {
            Some(logger) => logger.log_cycle_aborted(reason),
            None => warn!(reason = %reason, "Collection cycle aborted, keeping previous snapshot"),
        }
    }
}
