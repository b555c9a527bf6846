//! Collection scheduler
//!
//! Fires collection cycles on a fixed interval with optional jitter. Cycles run
//! as their own task so ticks keep arriving while one is in progress; a tick
//! that finds a cycle still running is skipped and counted.

use super::orchestrator::{CollectionOrchestrator, CycleOutcome};
use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Configuration for the collection scheduler
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Base interval between cycle starts (default: 5 minutes)
    pub interval: Duration,
    /// Maximum random delay added to each interval (default: none)
    pub jitter: Duration,
    /// Start the first cycle immediately instead of after one interval
    pub run_on_start: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            jitter: Duration::ZERO,
            run_on_start: true,
        }
    }
}

/// Periodically runs collection cycles until shutdown
pub struct CollectionLoop {
    orchestrator: Arc<CollectionOrchestrator>,
    config: CollectionConfig,
    current: Option<JoinHandle<CycleOutcome>>,
}

impl CollectionLoop {
    pub fn new(orchestrator: Arc<CollectionOrchestrator>, config: CollectionConfig) -> Self {
        Self {
            orchestrator,
            config,
            current: None,
        }
    }

    /// Run until a shutdown signal arrives. An in-flight cycle is aborted on
    /// shutdown and publishes nothing.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            jitter_secs = self.config.jitter.as_secs(),
            run_on_start = self.config.run_on_start,
            "Starting collection scheduler"
        );

        let mut next_tick = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.next_interval()
        };

        loop {
            tokio::select! {
                _ = sleep_until(next_tick) => {
                    self.tick();
                    next_tick += self.next_interval();
                }
                _ = shutdown.recv() => {
                    info!("Shutting down collection scheduler");
                    break;
                }
            }
        }

        if let Some(handle) = self.current.take() {
            if !handle.is_finished() {
                warn!("Aborting in-flight collection cycle");
            }
            handle.abort();
        }
    }

    /// Start a cycle unless the previous one is still running
    fn tick(&mut self) {
        if let Some(handle) = &self.current {
            if !handle.is_finished() {
                warn!("Collection cycle still running at next tick, skipping");
                self.orchestrator.record_skipped();
                return;
            }
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        self.current = Some(tokio::spawn(async move {
            let outcome = orchestrator.run_cycle().await;
            debug!(outcome = outcome.label(), "Collection cycle finished");
            outcome
        }));
    }

    /// Interval until the next tick, including jitter
    fn next_interval(&self) -> Duration {
        let jitter_ms = rand_jitter(self.config.jitter.as_millis() as u64);
        self.config.interval + Duration::from_millis(jitter_ms)
    }
}

/// Random jitter between 0 and max_ms inclusive
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}

/// Builder for the collection scheduler
pub struct CollectionLoopBuilder {
    orchestrator: Option<Arc<CollectionOrchestrator>>,
    config: CollectionConfig,
}

impl CollectionLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            orchestrator: None,
            config: CollectionConfig::default(),
        }
    }

    /// Set the orchestrator that runs each cycle
    pub fn orchestrator(mut self, orchestrator: Arc<CollectionOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Set the collection interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the jitter duration
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Whether the first cycle starts immediately
    pub fn run_on_start(mut self, run_on_start: bool) -> Self {
        self.config.run_on_start = run_on_start;
        self
    }

    /// Build the collection loop
    pub fn build(self) -> Result<CollectionLoop> {
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("Orchestrator is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Collection interval must be greater than zero");
        }

        Ok(CollectionLoop::new(orchestrator, self.config))
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
