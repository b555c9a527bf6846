//! Per-vault observation building
//!
//! Lists the keys, secrets and certificates of a single vault and turns them
//! into observations. Each item kind is listed independently: a failure on one
//! kind shows up as an access status of 0 for that scope and never affects the
//! other two.

use crate::client::{ItemLister, RequestContext};
use crate::error::ClientError;
use crate::models::{name_from_id, resource_group_from_id, ItemKind, VaultItem, VaultTarget};
use crate::registry::{Family, Labels, MetricSchema, Observation};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::walker::DEFAULT_REQUEST_TIMEOUT;

/// Observations for one vault, the unit sent over the aggregation channel
#[derive(Debug, Clone)]
pub struct VaultObservations {
    pub resource_id: String,
    pub vault_name: String,
    pub observations: Vec<Observation>,
    /// Item kinds whose listing failed
    pub degraded: Vec<ItemKind>,
}

/// Items seen for one kind, plus the error that stopped paging, if any
struct Listing {
    items: Vec<VaultItem>,
    error: Option<ClientError>,
}

/// Builds all observations describing a vault and its contents
pub struct ObservationBuilder {
    items: Arc<dyn ItemLister>,
    schema: Arc<MetricSchema>,
    request_timeout: Duration,
}

impl ObservationBuilder {
    pub fn new(items: Arc<dyn ItemLister>, schema: Arc<MetricSchema>) -> Self {
        Self {
            items,
            schema,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub async fn build(&self, ctx: &RequestContext, target: &VaultTarget) -> VaultObservations {
        let vault = &target.vault;
        let resource_id = vault.resource_id();
        let vault_name = vault_label_name(target, &resource_id);
        let mut observations = vec![self.vault_info(target, &resource_id, &vault_name)];
        let mut degraded = Vec::new();

        for kind in ItemKind::ALL {
            let listing = self.list(ctx, target, kind).await;

            for item in &listing.items {
                observations.push(self.item_info(&resource_id, &vault_name, kind, item));
                observations.extend(item_status(&resource_id, &vault_name, kind, item));
            }

            let accessible = match &listing.error {
                Some(err) => {
                    warn!(
                        vault = %vault.name,
                        scope = %kind,
                        access_denied = err.is_access_denied(),
                        error = %err,
                        "Failed to list vault entries"
                    );
                    degraded.push(kind);
                    0.0
                }
                None => 1.0,
            };

            observations.push(Observation::new(
                Family::VaultStatus,
                vault_labels(
                    &resource_id,
                    &vault_name,
                    [("type", "access"), ("scope", kind.as_str())],
                ),
                accessible,
            ));
            observations.push(Observation::new(
                Family::VaultEntries,
                vault_labels(&resource_id, &vault_name, [("type", kind.as_str())]),
                listing.items.len() as f64,
            ));
        }

        debug!(
            vault = %vault.name,
            observations = observations.len(),
            degraded = degraded.len(),
            "Built vault observations"
        );

        VaultObservations {
            resource_id,
            vault_name,
            observations,
            degraded,
        }
    }

    /// Observations for a vault whose contents could not be read at all.
    ///
    /// The vault stays in the inventory with every scope marked inaccessible.
    pub fn unavailable(&self, target: &VaultTarget) -> VaultObservations {
        let resource_id = target.vault.resource_id();
        let vault_name = vault_label_name(target, &resource_id);
        let mut observations = vec![self.vault_info(target, &resource_id, &vault_name)];

        for kind in ItemKind::ALL {
            observations.push(Observation::new(
                Family::VaultStatus,
                vault_labels(
                    &resource_id,
                    &vault_name,
                    [("type", "access"), ("scope", kind.as_str())],
                ),
                0.0,
            ));
            observations.push(Observation::new(
                Family::VaultEntries,
                vault_labels(&resource_id, &vault_name, [("type", kind.as_str())]),
                0.0,
            ));
        }

        VaultObservations {
            resource_id,
            vault_name,
            observations,
            degraded: ItemKind::ALL.to_vec(),
        }
    }

    /// Page through one item kind, stopping at the first failed page
    async fn list(&self, ctx: &RequestContext, target: &VaultTarget, kind: ItemKind) -> Listing {
        let mut pager = self.items.list_items(ctx, &target.vault, kind);
        let mut items = Vec::new();

        loop {
            match timeout(self.request_timeout, pager.next_page()).await {
                Ok(Some(Ok(page))) => items.extend(page),
                Ok(None) => return Listing { items, error: None },
                Ok(Some(Err(err))) => {
                    return Listing {
                        items,
                        error: Some(err),
                    }
                }
                Err(_) => {
                    return Listing {
                        items,
                        error: Some(ClientError::Timeout(self.request_timeout)),
                    }
                }
            }
        }
    }

    fn vault_info(&self, target: &VaultTarget, resource_id: &str, vault_name: &str) -> Observation {
        let vault = &target.vault;
        let resource_group = resource_group_from_id(resource_id)
            .map(str::to_string)
            .unwrap_or_else(|| vault.resource_group.to_lowercase());

        let mut labels = Labels::new();
        labels.insert("subscriptionID".into(), target.subscription.id.clone());
        labels.insert(
            "subscriptionName".into(),
            target.subscription.display_name.clone(),
        );
        labels.insert("resourceID".into(), resource_id.to_string());
        labels.insert("vaultName".into(), vault_name.to_string());
        labels.insert("location".into(), vault.location.clone());
        labels.insert("resourceGroup".into(), resource_group);
        self.schema.vault_tags().apply(&mut labels, &vault.tags);

        Observation::new(Family::VaultInfo, labels, 1.0)
    }

    fn item_info(
        &self,
        resource_id: &str,
        vault_name: &str,
        kind: ItemKind,
        item: &VaultItem,
    ) -> Observation {
        let noun = kind.singular();
        let mut labels = vault_labels(resource_id, vault_name, []);
        labels.insert(format!("{}Name", noun), item.name.clone());
        labels.insert(format!("{}ID", noun), item.id.clone());
        labels.insert("enabled".into(), item.enabled.to_string());
        self.schema.content_tags().apply(&mut labels, &item.tags);

        Observation::new(Family::ItemInfo(kind), labels, 1.0)
    }
}

/// Vault name as it appears in the lower-cased resource id
fn vault_label_name(target: &VaultTarget, resource_id: &str) -> String {
    name_from_id(resource_id)
        .map(str::to_string)
        .unwrap_or_else(|| target.vault.name.to_lowercase())
}

/// The four lifecycle timestamps of an item, 0 when unset
fn item_status(
    resource_id: &str,
    vault_name: &str,
    kind: ItemKind,
    item: &VaultItem,
) -> Vec<Observation> {
    let ts = &item.timestamps;
    [
        ("created", ts.created),
        ("updated", ts.updated),
        ("notBefore", ts.not_before),
        ("expiry", ts.expires),
    ]
    .into_iter()
    .map(|(status_type, timestamp)| {
        let mut labels = vault_labels(resource_id, vault_name, [("type", status_type)]);
        labels.insert(format!("{}ID", kind.singular()), item.id.clone());
        Observation::new(Family::ItemStatus(kind), labels, unix_seconds(timestamp))
    })
    .collect()
}

fn vault_labels<const N: usize>(
    resource_id: &str,
    vault_name: &str,
    extra: [(&str, &str); N],
) -> Labels {
    let mut labels = Labels::new();
    labels.insert("resourceID".into(), resource_id.to_string());
    labels.insert("vaultName".into(), vault_name.to_string());
    for (name, value) in extra {
        labels.insert(name.to_string(), value.to_string());
    }
    labels
}

fn unix_seconds(timestamp: Option<DateTime<Utc>>) -> f64 {
    timestamp.map(|ts| ts.timestamp() as f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Audience, BoxPager, StaticPager};
    use crate::error::ClientResult;
    use crate::models::{ItemTimestamps, Subscription, Vault};
    use crate::registry::TagLabels;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct KindLister {
        pages: Mutex<HashMap<ItemKind, Vec<ClientResult<Vec<VaultItem>>>>>,
    }

    impl ItemLister for KindLister {
        fn list_items(&self, _ctx: &RequestContext, _vault: &Vault, kind: ItemKind) -> BoxPager<VaultItem> {
            let pages = self.pages.lock().unwrap().remove(&kind).unwrap_or_default();
            Box::new(StaticPager::new(pages))
        }
    }

    fn target() -> VaultTarget {
        let mut tags = HashMap::new();
        tags.insert("owner".to_string(), "platform".to_string());
        VaultTarget {
            subscription: Subscription::new("sub1", "Production"),
            vault: Vault {
                id: "/subscriptions/sub1/resourceGroups/RG/providers/Microsoft.KeyVault/vaults/KV1"
                    .to_string(),
                name: "KV1".to_string(),
                location: "westeurope".to_string(),
                resource_group: "RG".to_string(),
                tags,
                vault_uri: "https://kv1.vault.azure.net/".to_string(),
            },
        }
    }

    fn item(name: &str, expires: Option<i64>) -> VaultItem {
        VaultItem {
            id: format!("https://kv1.vault.azure.net/keys/{}", name),
            name: name.to_string(),
            enabled: true,
            tags: HashMap::new(),
            timestamps: ItemTimestamps {
                created: Some(Utc.timestamp_opt(1_600_000_000, 0).unwrap()),
                updated: None,
                not_before: None,
                expires: expires.map(|secs| Utc.timestamp_opt(secs, 0).unwrap()),
            },
        }
    }

    fn builder(pages: Vec<(ItemKind, Vec<ClientResult<Vec<VaultItem>>>)>) -> ObservationBuilder {
        let lister = Arc::new(KindLister {
            pages: Mutex::new(pages.into_iter().collect()),
        });
        let schema = Arc::new(MetricSchema::new(
            TagLabels::new(&["owner"]),
            TagLabels::default(),
        ));
        ObservationBuilder::new(lister, schema)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Audience::Vault, "token")
    }

    fn of(observations: &[Observation], family: Family) -> Vec<&Observation> {
        observations.iter().filter(|o| o.family == family).collect()
    }

    #[tokio::test]
    async fn test_builds_item_info_and_status() {
        let builder = builder(vec![(
            ItemKind::Keys,
            vec![Ok(vec![item("signing", Some(1_900_000_000)), item("plain", None)])],
        )]);

        let result = builder.build(&ctx(), &target()).await;
        let obs = &result.observations;

        assert_eq!(of(obs, Family::ItemInfo(ItemKind::Keys)).len(), 2);
        assert_eq!(of(obs, Family::ItemStatus(ItemKind::Keys)).len(), 8);

        let expiry: Vec<f64> = of(obs, Family::ItemStatus(ItemKind::Keys))
            .into_iter()
            .filter(|o| o.label("type") == Some("expiry"))
            .map(|o| o.value)
            .collect();
        assert!(expiry.contains(&1_900_000_000.0));
        assert!(expiry.contains(&0.0));

        let created = of(obs, Family::ItemStatus(ItemKind::Keys))
            .into_iter()
            .find(|o| o.label("type") == Some("created"))
            .unwrap();
        assert_eq!(created.value, 1_600_000_000.0);
        assert!(result.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_vault_info_has_lowercase_id_and_tags() {
        let builder = builder(vec![]);
        let result = builder.build(&ctx(), &target()).await;

        let info = of(&result.observations, Family::VaultInfo);
        assert_eq!(info.len(), 1);
        assert_eq!(
            info[0].label("resourceID"),
            Some("/subscriptions/sub1/resourcegroups/rg/providers/microsoft.keyvault/vaults/kv1")
        );
        assert_eq!(info[0].label("vaultName"), Some("kv1"));
        assert_eq!(info[0].label("resourceGroup"), Some("rg"));
        assert_eq!(info[0].label("tag_owner"), Some("platform"));
        assert_eq!(info[0].label("subscriptionName"), Some("Production"));
    }

    #[tokio::test]
    async fn test_empty_vault_reports_zero_entries_and_access() {
        let builder = builder(vec![]);
        let result = builder.build(&ctx(), &target()).await;
        let obs = &result.observations;

        let entries = of(obs, Family::VaultEntries);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|o| o.value == 0.0));

        let status = of(obs, Family::VaultStatus);
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|o| o.value == 1.0));
    }

    #[tokio::test]
    async fn test_failed_kind_is_isolated() {
        let builder = builder(vec![
            (ItemKind::Keys, vec![Ok(vec![item("k1", None)])]),
            (
                ItemKind::Secrets,
                vec![Err(ClientError::Status {
                    status: 403,
                    body: "Forbidden".into(),
                })],
            ),
            (ItemKind::Certificates, vec![Ok(vec![item("c1", None)])]),
        ]);

        let result = builder.build(&ctx(), &target()).await;
        let obs = &result.observations;

        assert_eq!(result.degraded, vec![ItemKind::Secrets]);
        assert!(of(obs, Family::ItemInfo(ItemKind::Secrets)).is_empty());
        assert_eq!(of(obs, Family::ItemInfo(ItemKind::Keys)).len(), 1);
        assert_eq!(of(obs, Family::ItemInfo(ItemKind::Certificates)).len(), 1);

        let access: HashMap<&str, f64> = of(obs, Family::VaultStatus)
            .into_iter()
            .map(|o| (o.label("scope").unwrap(), o.value))
            .collect();
        assert_eq!(access["keys"], 1.0);
        assert_eq!(access["secrets"], 0.0);
        assert_eq!(access["certificates"], 1.0);
    }

    #[tokio::test]
    async fn test_page_failure_keeps_earlier_pages() {
        let builder = builder(vec![(
            ItemKind::Keys,
            vec![
                Ok(vec![item("k1", None)]),
                Err(ClientError::Request("connection reset".into())),
                Ok(vec![item("k2", None)]),
            ],
        )]);

        let result = builder.build(&ctx(), &target()).await;
        let entries = of(&result.observations, Family::VaultEntries)
            .into_iter()
            .find(|o| o.label("type") == Some("keys"))
            .unwrap();

        assert_eq!(entries.value, 1.0);
        assert_eq!(result.degraded, vec![ItemKind::Keys]);
    }

    #[test]
    fn test_unavailable_vault_keeps_info_and_marks_every_scope() {
        let builder = builder(vec![]);
        let result = builder.unavailable(&target());
        let obs = &result.observations;

        assert_eq!(of(obs, Family::VaultInfo).len(), 1);
        assert_eq!(result.degraded, ItemKind::ALL.to_vec());
        assert_eq!(result.vault_name, "kv1");

        let status = of(obs, Family::VaultStatus);
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|o| o.value == 0.0));

        let entries = of(obs, Family::VaultEntries);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|o| o.value == 0.0));
    }
}
