//! In-memory cloud used by the collector tests

use crate::client::{
    Audience, Backend, BoxPager, CredentialProvider, InclusionFilter, ItemLister, Pager,
    RequestContext, StaticPager, SubscriptionLister, VaultLister,
};
use crate::error::{ClientError, ClientResult};
use crate::models::{ItemKind, ItemTimestamps, Subscription, Vault, VaultItem};
use crate::registry::{MetricRegistry, MetricSchema, TagLabels};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn vault(subscription: &str, name: &str) -> Vault {
    let mut tags = HashMap::new();
    tags.insert("owner".to_string(), format!("team-{}", name));
    Vault {
        id: format!(
            "/subscriptions/{}/resourceGroups/rg-{}/providers/Microsoft.KeyVault/vaults/{}",
            subscription, subscription, name
        ),
        name: name.to_string(),
        location: "westeurope".to_string(),
        resource_group: format!("rg-{}", subscription),
        tags,
        vault_uri: format!("https://{}.vault.azure.net/", name),
    }
}

pub fn item(vault: &str, kind: ItemKind, name: &str, expires: Option<i64>) -> VaultItem {
    VaultItem {
        id: format!("https://{}.vault.azure.net/{}/{}", vault, kind, name),
        name: name.to_string(),
        enabled: true,
        tags: HashMap::new(),
        timestamps: ItemTimestamps {
            created: Utc.timestamp_opt(1_600_000_000, 0).single(),
            updated: Utc.timestamp_opt(1_650_000_000, 0).single(),
            not_before: None,
            expires: expires.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        },
    }
}

pub fn registry() -> MetricRegistry {
    let schema = MetricSchema::new(TagLabels::new(&["owner"]), TagLabels::default());
    MetricRegistry::new(Arc::new(schema)).unwrap()
}

/// Tracks how many item listings are in flight at once
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeCloud {
    subscriptions: Vec<Subscription>,
    vaults: HashMap<String, Vec<Vault>>,
    items: HashMap<(String, ItemKind), ClientResult<Vec<VaultItem>>>,
    include: Option<HashSet<String>>,
    gate: Option<(String, Arc<Notify>)>,
    item_delay: Duration,
    credential_delay: Duration,
    vault_credentials_fail_after: Option<usize>,
    panicking: Option<String>,
    pub fail_credentials: AtomicBool,
    pub fail_subscriptions: AtomicBool,
    pub fail_vault_listing: AtomicBool,
    pub in_flight: Arc<InFlight>,
    pub item_listings: AtomicUsize,
    /// Vault data-plane contexts handed out so far
    pub vault_contexts: AtomicUsize,
    /// Bearer values seen by item listings
    pub seen_tokens: Mutex<HashSet<String>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription(mut self, id: &str, name: &str) -> Self {
        self.subscriptions.push(Subscription::new(id, name));
        self
    }

    pub fn vault(mut self, subscription: &str, name: &str) -> Self {
        self.vaults
            .entry(subscription.to_string())
            .or_default()
            .push(vault(subscription, name));
        self
    }

    pub fn items(mut self, vault: &str, kind: ItemKind, items: Vec<VaultItem>) -> Self {
        self.items.insert((vault.to_string(), kind), Ok(items));
        self
    }

    pub fn failing(mut self, vault: &str, kind: ItemKind, error: ClientError) -> Self {
        self.items.insert((vault.to_string(), kind), Err(error));
        self
    }

    /// Only include the given vault resource ids
    pub fn include(mut self, ids: &[String]) -> Self {
        self.include = Some(ids.iter().map(|id| id.to_lowercase()).collect());
        self
    }

    /// Hold the key listing of `vault` until `gate` is notified
    pub fn gate(mut self, vault: &str, gate: Arc<Notify>) -> Self {
        self.gate = Some((vault.to_string(), gate));
        self
    }

    pub fn item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn credential_delay(mut self, delay: Duration) -> Self {
        self.credential_delay = delay;
        self
    }

    /// Fail every vault data-plane token request after the first `issued`
    pub fn vault_credentials_fail_after(mut self, issued: usize) -> Self {
        self.vault_credentials_fail_after = Some(issued);
        self
    }

    /// Panic while listing the items of `vault`
    pub fn panicking(mut self, vault: &str) -> Self {
        self.panicking = Some(vault.to_string());
        self
    }

    pub fn into_backend(self) -> (Arc<FakeCloud>, Backend) {
        let cloud = Arc::new(self);
        let filter = cloud
            .include
            .as_ref()
            .map(|_| cloud.clone() as Arc<dyn InclusionFilter>);
        let backend = Backend {
            credentials: cloud.clone(),
            subscriptions: cloud.clone(),
            vaults: cloud.clone(),
            items: cloud.clone(),
            filter,
        };
        (cloud, backend)
    }
}

#[async_trait]
impl CredentialProvider for FakeCloud {
    async fn acquire_context(&self, audience: Audience) -> ClientResult<RequestContext> {
        if !self.credential_delay.is_zero() {
            tokio::time::sleep(self.credential_delay).await;
        }
        if self.fail_credentials.load(Ordering::SeqCst) {
            return Err(ClientError::Auth("invalid client secret".into()));
        }
        if audience == Audience::Management {
            return Ok(RequestContext::new(audience, "fake-token"));
        }

        let issued = self.vault_contexts.fetch_add(1, Ordering::SeqCst);
        if self.vault_credentials_fail_after.is_some_and(|limit| issued >= limit) {
            return Err(ClientError::Auth("token refresh rejected".into()));
        }
        Ok(RequestContext::new(audience, format!("vault-token-{}", issued + 1)))
    }
}

#[async_trait]
impl SubscriptionLister for FakeCloud {
    async fn list_subscriptions(&self, _ctx: &RequestContext) -> ClientResult<Vec<Subscription>> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                status: 503,
                body: "Service Unavailable".into(),
            });
        }
        Ok(self.subscriptions.clone())
    }
}

impl VaultLister for FakeCloud {
    fn list_vaults(
        &self,
        _ctx: &RequestContext,
        subscription: &Subscription,
        _resource_group: Option<&str>,
    ) -> BoxPager<Vault> {
        if self.fail_vault_listing.load(Ordering::SeqCst) {
            return Box::new(StaticPager::new([Err(ClientError::Request(
                "connection refused".into(),
            ))]));
        }
        let vaults = self
            .vaults
            .get(&subscription.id)
            .cloned()
            .unwrap_or_default();
        Box::new(StaticPager::single(vaults))
    }
}

impl ItemLister for FakeCloud {
    fn list_items(&self, ctx: &RequestContext, vault: &Vault, kind: ItemKind) -> BoxPager<VaultItem> {
        if self.panicking.as_deref() == Some(vault.name.as_str()) {
            panic!("item listing crashed for {}", vault.name);
        }
        self.item_listings.fetch_add(1, Ordering::SeqCst);
        self.seen_tokens.lock().unwrap().insert(ctx.authorization());
        let page = self
            .items
            .get(&(vault.name.clone(), kind))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));
        let gate = match &self.gate {
            Some((gated, notify)) if *gated == vault.name && kind == ItemKind::Keys => {
                Some(notify.clone())
            }
            _ => None,
        };
        Box::new(FakeItemPager {
            page: Some(page),
            gate,
            delay: self.item_delay,
            in_flight: self.in_flight.clone(),
        })
    }
}

#[async_trait]
impl InclusionFilter for FakeCloud {
    async fn resolve(
        &self,
        _ctx: &RequestContext,
        _subscriptions: &[Subscription],
    ) -> ClientResult<HashSet<String>> {
        Ok(self.include.clone().unwrap_or_default())
    }
}

struct FakeItemPager {
    page: Option<ClientResult<Vec<VaultItem>>>,
    gate: Option<Arc<Notify>>,
    delay: Duration,
    in_flight: Arc<InFlight>,
}

#[async_trait]
impl Pager<VaultItem> for FakeItemPager {
    async fn next_page(&mut self) -> Option<ClientResult<Vec<VaultItem>>> {
        let page = self.page.take()?;
        self.in_flight.enter();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.exit();
        Some(page)
    }
}
