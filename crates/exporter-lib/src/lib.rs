//! Exporter library for Azure Key Vault inventory metrics
//!
//! This crate provides the core functionality for:
//! - Walking subscriptions for key vaults
//! - Concurrent collection of keys, secrets and certificates
//! - Atomic publishing of per-cycle metric snapshots
//! - An Azure REST backend for the collaborator traits
//! - Self-metrics and structured lifecycle logging

pub mod azure;
pub mod client;
pub mod collector;
pub mod error;
pub mod models;
pub mod observability;
pub mod registry;

pub use client::{Backend, RequestContext};
pub use error::{ClientError, ClientResult, CycleError};
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
pub use registry::{MetricRegistry, MetricSchema, MetricSnapshot, TagLabels};
