//! Metric schema and the published snapshot served to scrapes
//!
//! Observations produced during a cycle are plain data. They only become
//! visible once [`MetricRegistry::publish`] swaps in a complete snapshot, so a
//! concurrent scrape sees either the previous cycle or the new one, never a mix.

use crate::models::ItemKind;
use chrono::{DateTime, Utc};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Label name → value
pub type Labels = BTreeMap<String, String>;

/// Prefix for labels derived from resource tags
pub const TAG_LABEL_PREFIX: &str = "tag_";

/// Metric families exported for vault inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    VaultInfo,
    VaultStatus,
    VaultEntries,
    ItemInfo(ItemKind),
    ItemStatus(ItemKind),
}

impl Family {
    pub const ALL: [Family; 9] = [
        Family::VaultInfo,
        Family::VaultStatus,
        Family::VaultEntries,
        Family::ItemInfo(ItemKind::Keys),
        Family::ItemStatus(ItemKind::Keys),
        Family::ItemInfo(ItemKind::Secrets),
        Family::ItemStatus(ItemKind::Secrets),
        Family::ItemInfo(ItemKind::Certificates),
        Family::ItemStatus(ItemKind::Certificates),
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Family::VaultInfo => "azurerm_keyvault_info",
            Family::VaultStatus => "azurerm_keyvault_status",
            Family::VaultEntries => "azurerm_keyvault_entries",
            Family::ItemInfo(ItemKind::Keys) => "azurerm_keyvault_key_info",
            Family::ItemStatus(ItemKind::Keys) => "azurerm_keyvault_key_status",
            Family::ItemInfo(ItemKind::Secrets) => "azurerm_keyvault_secret_info",
            Family::ItemStatus(ItemKind::Secrets) => "azurerm_keyvault_secret_status",
            Family::ItemInfo(ItemKind::Certificates) => "azurerm_keyvault_certificate_info",
            Family::ItemStatus(ItemKind::Certificates) => "azurerm_keyvault_certificate_status",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Family::VaultInfo => "Azure KeyVault information",
            Family::VaultStatus => "Azure KeyVault status",
            Family::VaultEntries => "Azure KeyVault entries",
            Family::ItemInfo(ItemKind::Keys) => "Azure KeyVault key information",
            Family::ItemStatus(ItemKind::Keys) => "Azure KeyVault key status",
            Family::ItemInfo(ItemKind::Secrets) => "Azure KeyVault secret information",
            Family::ItemStatus(ItemKind::Secrets) => "Azure KeyVault secret status",
            Family::ItemInfo(ItemKind::Certificates) => "Azure KeyVault certificate information",
            Family::ItemStatus(ItemKind::Certificates) => "Azure KeyVault certificate status",
        }
    }
}

/// One labelled numeric data point
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub family: Family,
    pub labels: Labels,
    pub value: f64,
}

impl Observation {
    pub fn new(family: Family, labels: Labels, value: f64) -> Self {
        Self {
            family,
            labels,
            value,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Maps configured tag names onto `tag_*` label names
#[derive(Debug, Clone, Default)]
pub struct TagLabels {
    entries: Vec<(String, String)>,
}

impl TagLabels {
    pub fn new<S: AsRef<str>>(tags: &[S]) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if tag.is_empty() {
                continue;
            }
            let label = tag_label_name(tag);
            if entries.iter().any(|(_, existing)| *existing == label) {
                warn!(tag = %tag, label = %label, "Ignoring tag that maps to a duplicate label");
                continue;
            }
            entries.push((tag.to_string(), label));
        }
        Self { entries }
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, label)| label.as_str())
    }

    /// Add one label per configured tag; missing tags become empty values
    pub fn apply(&self, labels: &mut Labels, tags: &HashMap<String, String>) {
        for (tag, label) in &self.entries {
            let value = tags.get(tag).cloned().unwrap_or_default();
            labels.insert(label.clone(), value);
        }
    }
}

/// Convert an Azure tag name into a valid Prometheus label name
pub fn tag_label_name(tag: &str) -> String {
    let sanitized: String = tag
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", TAG_LABEL_PREFIX, sanitized)
}

/// Label names per family, fixed for the lifetime of the process
#[derive(Debug, Clone, Default)]
pub struct MetricSchema {
    vault_tags: TagLabels,
    content_tags: TagLabels,
}

impl MetricSchema {
    pub fn new(vault_tags: TagLabels, content_tags: TagLabels) -> Self {
        Self {
            vault_tags,
            content_tags,
        }
    }

    pub fn vault_tags(&self) -> &TagLabels {
        &self.vault_tags
    }

    pub fn content_tags(&self) -> &TagLabels {
        &self.content_tags
    }

    pub fn label_names(&self, family: Family) -> Vec<String> {
        let mut names: Vec<String> = match family {
            Family::VaultInfo => vec![
                "subscriptionID".into(),
                "subscriptionName".into(),
                "resourceID".into(),
                "vaultName".into(),
                "location".into(),
                "resourceGroup".into(),
            ],
            Family::VaultStatus => vec![
                "resourceID".into(),
                "vaultName".into(),
                "type".into(),
                "scope".into(),
            ],
            Family::VaultEntries => vec!["resourceID".into(), "vaultName".into(), "type".into()],
            Family::ItemInfo(kind) => vec![
                "resourceID".into(),
                "vaultName".into(),
                format!("{}Name", kind.singular()),
                format!("{}ID", kind.singular()),
                "enabled".into(),
            ],
            Family::ItemStatus(kind) => vec![
                "resourceID".into(),
                "vaultName".into(),
                format!("{}ID", kind.singular()),
                "type".into(),
            ],
        };

        match family {
            Family::VaultInfo => names.extend(self.vault_tags.label_names().map(String::from)),
            Family::ItemInfo(_) => names.extend(self.content_tags.label_names().map(String::from)),
            _ => {}
        }

        names
    }

    /// True if the observation carries exactly the labels of its family
    fn matches(&self, observation: &Observation) -> bool {
        let expected = self.label_names(observation.family);
        expected.len() == observation.labels.len()
            && expected.iter().all(|name| observation.labels.contains_key(name))
    }
}

/// Complete set of observations from one collection cycle
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub cycle: u64,
    pub published_at: DateTime<Utc>,
    series: BTreeMap<Family, BTreeMap<Labels, f64>>,
}

impl MetricSnapshot {
    /// Value of the series with exactly these labels
    pub fn get(&self, family: Family, labels: &Labels) -> Option<f64> {
        self.series.get(&family)?.get(labels).copied()
    }

    /// All series of a family, ordered by label set
    pub fn series(&self, family: Family) -> impl Iterator<Item = (&Labels, f64)> {
        self.series
            .get(&family)
            .into_iter()
            .flat_map(|series| series.iter().map(|(labels, value)| (labels, *value)))
    }

    /// Series of a family whose labels contain all of the given pairs
    pub fn find(&self, family: Family, matchers: &[(&str, &str)]) -> Vec<(&Labels, f64)> {
        self.series(family)
            .filter(|(labels, _)| {
                matchers
                    .iter()
                    .all(|(name, value)| labels.get(*name).map(String::as_str) == Some(*value))
            })
            .collect()
    }

    pub fn count(&self, family: Family) -> usize {
        self.series.get(&family).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Series data without cycle bookkeeping, for comparing two cycles
    pub fn same_series(&self, other: &MetricSnapshot) -> bool {
        self.series == other.series
    }
}

struct Published {
    snapshot: Arc<MetricSnapshot>,
    families: Vec<MetricFamily>,
}

struct RegistryInner {
    schema: Arc<MetricSchema>,
    descs: Vec<Desc>,
    current: RwLock<Option<Arc<Published>>>,
    cycles: AtomicU64,
}

/// Holds the latest published snapshot and exposes it as a Prometheus collector.
///
/// Clones share the same snapshot.
#[derive(Clone)]
pub struct MetricRegistry {
    inner: Arc<RegistryInner>,
}

impl MetricRegistry {
    pub fn new(schema: Arc<MetricSchema>) -> prometheus::Result<Self> {
        let descs = Family::ALL
            .iter()
            .map(|family| {
                Desc::new(
                    family.name().to_string(),
                    family.help().to_string(),
                    schema.label_names(*family),
                    HashMap::new(),
                )
            })
            .collect::<prometheus::Result<Vec<_>>>()?;

        Ok(Self {
            inner: Arc::new(RegistryInner {
                schema,
                descs,
                current: RwLock::new(None),
                cycles: AtomicU64::new(0),
            }),
        })
    }

    pub fn schema(&self) -> &Arc<MetricSchema> {
        &self.inner.schema
    }

    /// Register the snapshot families with a Prometheus registry
    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.clone()))
    }

    /// Latest published snapshot, `None` before the first cycle completes
    pub fn snapshot(&self) -> Option<Arc<MetricSnapshot>> {
        self.current()
            .as_ref()
            .map(|published| Arc::clone(&published.snapshot))
    }

    /// Replace the current snapshot with the given observations.
    ///
    /// Everything is built off to the side; the live snapshot changes with a
    /// single pointer swap at the end.
    pub fn publish(&self, observations: Vec<Observation>) -> prometheus::Result<Arc<MetricSnapshot>> {
        let schema = &self.inner.schema;
        let mut series: BTreeMap<Family, BTreeMap<Labels, f64>> = BTreeMap::new();
        let mut rejected = 0usize;
        let mut duplicates = 0usize;

        for observation in observations {
            if !schema.matches(&observation) {
                rejected += 1;
                continue;
            }
            let previous = series
                .entry(observation.family)
                .or_default()
                .insert(observation.labels, observation.value);
            if previous.is_some() {
                duplicates += 1;
            }
        }

        if rejected > 0 {
            warn!(rejected = rejected, "Dropped observations with unexpected labels");
        }
        if duplicates > 0 {
            debug!(duplicates = duplicates, "Duplicate label sets overwritten");
        }

        let mut families = Vec::new();
        for family in Family::ALL {
            let Some(family_series) = series.get(&family) else {
                continue;
            };
            let label_names = schema.label_names(family);
            let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
            let gauge = GaugeVec::new(Opts::new(family.name(), family.help()), &label_refs)?;

            for (labels, value) in family_series {
                let values: Vec<&str> = label_names
                    .iter()
                    .map(|name| labels.get(name).map(String::as_str).unwrap_or_default())
                    .collect();
                gauge.get_metric_with_label_values(&values)?.set(*value);
            }

            families.extend(
                gauge
                    .collect()
                    .into_iter()
                    .filter(|mf| !mf.get_metric().is_empty()),
            );
        }

        let snapshot = Arc::new(MetricSnapshot {
            cycle: self.inner.cycles.fetch_add(1, Ordering::SeqCst) + 1,
            published_at: Utc::now(),
            series,
        });

        let published = Arc::new(Published {
            snapshot: Arc::clone(&snapshot),
            families,
        });

        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(published);

        Ok(snapshot)
    }

    fn current(&self) -> Option<Arc<Published>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Collector for MetricRegistry {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.current()
            .map(|published| published.families.clone())
            .unwrap_or_default()
    }
}
