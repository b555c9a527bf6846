//! Exporter configuration

use anyhow::{Context, Result};
use exporter_lib::azure::AzureCloud;
use exporter_lib::collector::OrchestratorConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Keys holding space-separated lists
const LIST_KEYS: &[&str] = &["subscriptions", "vault_tags", "content_tags"];

/// Upper bound for in-flight vault tasks
const MAX_CONCURRENCY: usize = 1024;

/// Upper bound for intervals, jitter and timeouts (one week)
const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Exporter configuration, read from `EXPORTER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Instance name attached to lifecycle events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// HTTP listen address for metrics and health endpoints
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Collection interval in seconds
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval_secs: u64,

    /// Maximum random delay added to each interval, in seconds
    #[serde(default)]
    pub scrape_jitter_secs: u64,

    /// Run the first cycle at startup instead of after one interval
    #[serde(default = "default_true")]
    pub run_on_start: bool,

    /// Maximum vaults collected at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Subscription ids to walk; empty walks every visible subscription
    #[serde(default)]
    pub subscriptions: Vec<String>,

    #[serde(default)]
    pub resource_group: Option<String>,

    /// Resource Graph clause selecting the vaults to collect
    #[serde(default)]
    pub vault_filter: Option<String>,

    /// Vault tags exported as `tag_*` labels
    #[serde(default = "default_vault_tags")]
    pub vault_tags: Vec<String>,

    /// Key, secret and certificate tags exported as `tag_*` labels
    #[serde(default)]
    pub content_tags: Vec<String>,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_cloud")]
    pub cloud: String,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "keyvault-exporter".to_string())
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_scrape_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cycle_timeout() -> u64 {
    600
}

fn default_vault_tags() -> Vec<String> {
    vec!["owner".to_string()]
}

fn default_cloud() -> String {
    "AzurePublicCloud".to_string()
}

impl ExporterConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from the given variables instead of the process
    /// environment
    pub fn load_from(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let mut environment = config::Environment::with_prefix("EXPORTER")
            .try_parsing(true)
            .list_separator(" ")
            .source(vars);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let config = config::Config::builder()
            .add_source(environment)
            .build()
            .context("failed to read exporter configuration")?;

        let mut parsed: ExporterConfig = config
            .try_deserialize()
            .context("invalid exporter configuration")?;
        parsed.normalize();
        Ok(parsed)
    }

    fn normalize(&mut self) {
        for list in [
            &mut self.subscriptions,
            &mut self.vault_tags,
            &mut self.content_tags,
        ] {
            list.retain(|value| !value.trim().is_empty());
        }
        self.resource_group = self.resource_group.take().filter(|rg| !rg.trim().is_empty());
        self.vault_filter = self.vault_filter.take().filter(|f| !f.trim().is_empty());
    }

    /// Reject settings the exporter cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            anyhow::bail!("concurrency must be between 1 and {}", MAX_CONCURRENCY);
        }
        for (key, secs, min) in [
            ("scrape_interval_secs", self.scrape_interval_secs, 1),
            ("scrape_jitter_secs", self.scrape_jitter_secs, 0),
            ("request_timeout_secs", self.request_timeout_secs, 1),
            ("cycle_timeout_secs", self.cycle_timeout_secs, 1),
        ] {
            if !(min..=MAX_DURATION_SECS).contains(&secs) {
                anyhow::bail!("{} must be between {} and {}", key, min, MAX_DURATION_SECS);
            }
        }
        self.bind_addr()?;
        self.azure_cloud()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.bind))
    }

    pub fn azure_cloud(&self) -> Result<AzureCloud> {
        self.cloud.parse().map_err(anyhow::Error::msg)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }

    pub fn scrape_jitter(&self) -> Duration {
        Duration::from_secs(self.scrape_jitter_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.concurrency,
            resource_group: self.resource_group.clone(),
            request_timeout: self.request_timeout(),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
        }
    }
}
