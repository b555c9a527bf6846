//! Vault inventory collection
//!
//! This module walks subscriptions for key vaults, collects the keys, secrets
//! and certificates of every vault concurrently and publishes the result as
//! one consistent snapshot per cycle.

mod builder;
mod r#loop;
mod orchestrator;
mod walker;

#[cfg(test)]
mod testing;

pub use builder::{ObservationBuilder, VaultObservations};
pub use orchestrator::{
    CollectionOrchestrator, CycleOutcome, CyclePhase, CycleReport, OrchestratorConfig,
};
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder};
pub use walker::{ResourceWalker, WalkStats, DEFAULT_REQUEST_TIMEOUT};
