//! ARM, Key Vault data-plane and Resource Graph listings
//!
//! Every listing follows `nextLink` (or `$skipToken` for Resource Graph) one
//! page per call, so a failed page surfaces to the caller without losing the
//! pages already returned.

use super::{
    AzureEndpoints, AzureHttp, ListPage, DATA_PLANE_API_VERSION, RESOURCE_GRAPH_API_VERSION,
    SUBSCRIPTIONS_API_VERSION, VAULTS_API_VERSION,
};
use crate::client::{
    BoxPager, InclusionFilter, ItemLister, Pager, RequestContext, StaticPager, SubscriptionLister,
    VaultLister,
};
use crate::error::{ClientError, ClientResult};
use crate::models::{
    name_from_id, resource_group_from_id, ItemKind, ItemTimestamps, Subscription, Vault, VaultItem,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// `{base}/{segments..}?api-version={api_version}`, with each segment escaped
fn api_url(base: &str, segments: &[&str], api_version: &str) -> ClientResult<String> {
    let mut url =
        Url::parse(base).map_err(|err| ClientError::Request(format!("invalid url {}: {}", base, err)))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Request(format!("url cannot be a base: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    url.query_pairs_mut().append_pair("api-version", api_version);
    Ok(url.to_string())
}

/// Follows `nextLink` until the listing is exhausted
struct NextLinkPager<R, T> {
    http: AzureHttp,
    authorization: String,
    next: Option<String>,
    convert: fn(R) -> Option<T>,
}

impl<R, T> NextLinkPager<R, T> {
    fn new(http: AzureHttp, ctx: &RequestContext, url: String, convert: fn(R) -> Option<T>) -> Self {
        Self {
            http,
            authorization: ctx.authorization(),
            next: Some(url),
            convert,
        }
    }
}

#[async_trait]
impl<R, T> Pager<T> for NextLinkPager<R, T>
where
    R: DeserializeOwned + Send + 'static,
    T: Send + 'static,
{
    async fn next_page(&mut self) -> Option<ClientResult<Vec<T>>> {
        let url = self.next.take()?;
        let page: ListPage<R> = match self.http.get_json(&url, &self.authorization).await {
            Ok(page) => page,
            Err(err) => return Some(Err(err)),
        };
        self.next = page.next_link.filter(|link| !link.is_empty());
        Some(Ok(page.value.into_iter().filter_map(self.convert).collect()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRecord {
    subscription_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl From<SubscriptionRecord> for Subscription {
    fn from(record: SubscriptionRecord) -> Self {
        let display_name = record
            .display_name
            .unwrap_or_else(|| record.subscription_id.clone());
        Subscription::new(record.subscription_id, display_name)
    }
}

/// Lists configured subscriptions, or every subscription visible to the identity
pub struct ArmSubscriptionLister {
    http: AzureHttp,
    endpoints: Arc<AzureEndpoints>,
    ids: Vec<String>,
}

impl ArmSubscriptionLister {
    pub fn new(http: AzureHttp, endpoints: Arc<AzureEndpoints>, ids: Vec<String>) -> Self {
        Self {
            http,
            endpoints,
            ids,
        }
    }
}

#[async_trait]
impl SubscriptionLister for ArmSubscriptionLister {
    async fn list_subscriptions(&self, ctx: &RequestContext) -> ClientResult<Vec<Subscription>> {
        if !self.ids.is_empty() {
            let authorization = ctx.authorization();
            let mut subscriptions = Vec::with_capacity(self.ids.len());
            for id in &self.ids {
                let url = api_url(
                    &self.endpoints.management,
                    &["subscriptions", id.as_str()],
                    SUBSCRIPTIONS_API_VERSION,
                )?;
                let record: SubscriptionRecord = self.http.get_json(&url, &authorization).await?;
                subscriptions.push(record.into());
            }
            return Ok(subscriptions);
        }

        let url = api_url(
            &self.endpoints.management,
            &["subscriptions"],
            SUBSCRIPTIONS_API_VERSION,
        )?;
        let mut pager: NextLinkPager<SubscriptionRecord, Subscription> =
            NextLinkPager::new(self.http.clone(), ctx, url, |record| Some(record.into()));

        let mut subscriptions = Vec::new();
        while let Some(page) = pager.next_page().await {
            subscriptions.extend(page?);
        }
        debug!(subscriptions = subscriptions.len(), "Listed subscriptions");
        Ok(subscriptions)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
    #[serde(default)]
    properties: Option<VaultProperties>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultProperties {
    #[serde(default)]
    vault_uri: Option<String>,
}

fn vault_from_record(record: VaultRecord, vault_dns_suffix: &str) -> Option<Vault> {
    let name = record
        .name
        .filter(|name| !name.is_empty())
        .or_else(|| name_from_id(&record.id).map(String::from))?;
    let resource_group = resource_group_from_id(&record.id)
        .unwrap_or_default()
        .to_string();
    let vault_uri = record
        .properties
        .and_then(|properties| properties.vault_uri)
        .unwrap_or_else(|| format!("https://{}.{}/", name, vault_dns_suffix));

    Some(Vault {
        id: record.id,
        name,
        location: record.location.unwrap_or_default(),
        resource_group,
        tags: record.tags.unwrap_or_default(),
        vault_uri,
    })
}

/// Lists key vaults through Azure Resource Manager
pub struct ArmVaultLister {
    http: AzureHttp,
    endpoints: Arc<AzureEndpoints>,
}

impl ArmVaultLister {
    pub fn new(http: AzureHttp, endpoints: Arc<AzureEndpoints>) -> Self {
        Self { http, endpoints }
    }
}

/// Pages vault records and fills in the vault uri for the cloud's DNS suffix
struct VaultPager {
    inner: NextLinkPager<VaultRecord, VaultRecord>,
    vault_dns_suffix: String,
}

#[async_trait]
impl Pager<Vault> for VaultPager {
    async fn next_page(&mut self) -> Option<ClientResult<Vec<Vault>>> {
        let page = self.inner.next_page().await?;
        Some(page.map(|records| {
            records
                .into_iter()
                .filter_map(|record| vault_from_record(record, &self.vault_dns_suffix))
                .collect()
        }))
    }
}

impl VaultLister for ArmVaultLister {
    fn list_vaults(
        &self,
        ctx: &RequestContext,
        subscription: &Subscription,
        resource_group: Option<&str>,
    ) -> BoxPager<Vault> {
        let mut segments = vec!["subscriptions", subscription.id.as_str()];
        if let Some(rg) = resource_group {
            segments.extend(["resourceGroups", rg]);
        }
        segments.extend(["providers", "Microsoft.KeyVault", "vaults"]);

        let url = match api_url(&self.endpoints.management, &segments, VAULTS_API_VERSION) {
            Ok(url) => url,
            Err(err) => return Box::new(StaticPager::new([Err(err)])),
        };

        Box::new(VaultPager {
            inner: NextLinkPager::new(self.http.clone(), ctx, url, Some),
            vault_dns_suffix: self.endpoints.vault_dns_suffix.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ItemRecord {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    attributes: Option<ItemAttributes>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ItemAttributes {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    updated: Option<i64>,
}

fn unix(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn item_from_record(record: ItemRecord) -> Option<VaultItem> {
    // Keys carry their identifier in `kid`
    let id = record.kid.or(record.id)?;
    let name = name_from_id(&id)?.to_string();
    let (enabled, timestamps) = match record.attributes {
        Some(attributes) => (
            attributes.enabled.unwrap_or(false),
            ItemTimestamps {
                created: unix(attributes.created),
                updated: unix(attributes.updated),
                not_before: unix(attributes.nbf),
                expires: unix(attributes.exp),
            },
        ),
        None => (false, ItemTimestamps::default()),
    };

    Some(VaultItem {
        id,
        name,
        enabled,
        tags: record.tags.unwrap_or_default(),
        timestamps,
    })
}

/// Lists vault contents through the Key Vault data plane
pub struct VaultItemLister {
    http: AzureHttp,
}

impl VaultItemLister {
    pub fn new(http: AzureHttp) -> Self {
        Self { http }
    }
}

impl ItemLister for VaultItemLister {
    fn list_items(&self, ctx: &RequestContext, vault: &Vault, kind: ItemKind) -> BoxPager<VaultItem> {
        let url = match api_url(&vault.vault_uri, &[kind.as_str()], DATA_PLANE_API_VERSION) {
            Ok(url) => url,
            Err(err) => return Box::new(StaticPager::new([Err(err)])),
        };
        Box::new(NextLinkPager::new(self.http.clone(), ctx, url, item_from_record))
    }
}

#[derive(Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Vec<GraphRow>,
    #[serde(rename = "$skipToken", default)]
    skip_token: Option<String>,
}

#[derive(Deserialize)]
struct GraphRow {
    id: String,
}

/// Resolves the vaults to include with a Resource Graph query
pub struct ResourceGraphFilter {
    http: AzureHttp,
    endpoints: Arc<AzureEndpoints>,
    clause: String,
}

impl ResourceGraphFilter {
    pub fn new(http: AzureHttp, endpoints: Arc<AzureEndpoints>, clause: String) -> Self {
        Self {
            http,
            endpoints,
            clause,
        }
    }

    fn query(&self) -> String {
        let clause = self.clause.trim().trim_start_matches('|').trim();
        format!(
            "Resources | where type =~ \"microsoft.keyvault/vaults\" | {} | project id",
            clause
        )
    }
}

#[async_trait]
impl InclusionFilter for ResourceGraphFilter {
    async fn resolve(
        &self,
        ctx: &RequestContext,
        subscriptions: &[Subscription],
    ) -> ClientResult<HashSet<String>> {
        let url = api_url(
            &self.endpoints.management,
            &["providers", "Microsoft.ResourceGraph", "resources"],
            RESOURCE_GRAPH_API_VERSION,
        )?;
        let authorization = ctx.authorization();
        let subscription_ids: Vec<&str> = subscriptions.iter().map(|s| s.id.as_str()).collect();
        let query = self.query();

        let mut ids = HashSet::new();
        let mut skip_token: Option<String> = None;
        loop {
            let mut options = json!({ "resultFormat": "objectArray" });
            if let Some(token) = &skip_token {
                options["$skipToken"] = json!(token);
            }
            let body = json!({
                "subscriptions": subscription_ids,
                "query": query,
                "options": options,
            });

            let response: GraphResponse = self.http.post_json(&url, &authorization, &body).await?;
            ids.extend(response.data.into_iter().map(|row| row.id.to_lowercase()));

            match response.skip_token.filter(|token| !token.is_empty()) {
                Some(token) => skip_token = Some(token),
                None => break,
            }
        }

        debug!(vaults = ids.len(), "Resolved vault filter");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Audience;
    use crate::error::ClientError;
    use mockito::Matcher;
    use std::time::Duration;

    fn http() -> AzureHttp {
        AzureHttp::new(Duration::from_secs(5)).unwrap()
    }

    fn endpoints(server: &mockito::Server) -> Arc<AzureEndpoints> {
        Arc::new(AzureEndpoints {
            management: server.url(),
            ..AzureEndpoints::default()
        })
    }

    fn ctx(audience: Audience) -> RequestContext {
        RequestContext::new(audience, "test-token")
    }

    #[tokio::test]
    async fn test_lists_all_subscriptions_across_pages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions")
            .match_header("authorization", "Bearer test-token")
            .match_query(Matcher::UrlEncoded("api-version".into(), "2020-01-01".into()))
            .with_status(200)
            .with_body(format!(
                r#"{{"value":[{{"subscriptionId":"sub1","displayName":"Production"}}],"nextLink":"{}/next/subscriptions"}}"#,
                server.url()
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/next/subscriptions")
            .with_status(200)
            .with_body(r#"{"value":[{"subscriptionId":"sub2"}]}"#)
            .create_async()
            .await;

        let lister = ArmSubscriptionLister::new(http(), endpoints(&server), Vec::new());
        let subscriptions = lister
            .list_subscriptions(&ctx(Audience::Management))
            .await
            .unwrap();

        assert_eq!(
            subscriptions,
            vec![
                Subscription::new("sub1", "Production"),
                Subscription::new("sub2", "sub2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_lists_configured_subscriptions_only() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/subscriptions/sub9")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"subscriptionId":"sub9","displayName":"Sandbox"}"#)
            .expect(1)
            .create_async()
            .await;

        let lister = ArmSubscriptionLister::new(http(), endpoints(&server), vec!["sub9".into()]);
        let subscriptions = lister
            .list_subscriptions(&ctx(Audience::Management))
            .await
            .unwrap();

        assert_eq!(subscriptions, vec![Subscription::new("sub9", "Sandbox")]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_vault_listing_follows_next_link_and_parses_ids() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subscriptions/sub1/resourceGroups/rg-prod/providers/Microsoft.KeyVault/vaults")
            .match_query(Matcher::UrlEncoded("api-version".into(), "2022-07-01".into()))
            .with_status(200)
            .with_body(format!(
                r#"{{"value":[{{"id":"/subscriptions/sub1/resourceGroups/rg-prod/providers/Microsoft.KeyVault/vaults/kv1","name":"kv1","location":"westeurope","tags":{{"owner":"platform"}},"properties":{{"vaultUri":"https://kv1.vault.azure.net/"}}}}],"nextLink":"{}/next/vaults"}}"#,
                server.url()
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/next/vaults")
            .with_status(200)
            .with_body(
                r#"{"value":[{"id":"/subscriptions/sub1/resourceGroups/rg-prod/providers/Microsoft.KeyVault/vaults/kv2","location":"northeurope"}]}"#,
            )
            .create_async()
            .await;

        let lister = ArmVaultLister::new(http(), endpoints(&server));
        let mut pager = lister.list_vaults(
            &ctx(Audience::Management),
            &Subscription::new("sub1", "Production"),
            Some("rg-prod"),
        );

        let first = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first[0].name, "kv1");
        assert_eq!(first[0].resource_group, "rg-prod");
        assert_eq!(first[0].tags.get("owner").map(String::as_str), Some("platform"));

        let second = pager.next_page().await.unwrap().unwrap();
        assert_eq!(second[0].name, "kv2");
        assert_eq!(second[0].vault_uri, "https://kv2.vault.azure.net/");

        assert!(pager.next_page().await.is_none());
    }

    #[tokio::test]
    async fn test_item_listing_maps_attributes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/keys")
            .match_query(Matcher::UrlEncoded("api-version".into(), "7.4".into()))
            .with_status(200)
            .with_body(format!(
                r#"{{"value":[{{"kid":"{}/keys/signing","attributes":{{"enabled":true,"exp":1900000000,"created":1600000000}},"tags":{{"env":"prod"}}}},{{"kid":"{}/keys/old"}}],"nextLink":null}}"#,
                server.url(),
                server.url()
            ))
            .create_async()
            .await;

        let vault = Vault {
            id: "/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv1".into(),
            name: "kv1".into(),
            location: "westeurope".into(),
            resource_group: "rg".into(),
            tags: HashMap::new(),
            vault_uri: format!("{}/", server.url()),
        };
        let lister = VaultItemLister::new(http());
        let mut pager = lister.list_items(&ctx(Audience::Vault), &vault, ItemKind::Keys);

        let items = pager.next_page().await.unwrap().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "signing");
        assert!(items[0].enabled);
        assert_eq!(items[0].timestamps.expires.map(|t| t.timestamp()), Some(1_900_000_000));
        assert_eq!(items[0].timestamps.not_before, None);
        assert_eq!(items[0].tags.get("env").map(String::as_str), Some("prod"));
        assert!(!items[1].enabled);
        assert!(pager.next_page().await.is_none());
    }

    #[tokio::test]
    async fn test_item_listing_surfaces_forbidden() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/secrets")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"code":"Forbidden"}}"#)
            .create_async()
            .await;

        let vault = Vault {
            id: "/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv1".into(),
            name: "kv1".into(),
            location: String::new(),
            resource_group: "rg".into(),
            tags: HashMap::new(),
            vault_uri: server.url(),
        };
        let mut pager = VaultItemLister::new(http()).list_items(&ctx(Audience::Vault), &vault, ItemKind::Secrets);

        let err = pager.next_page().await.unwrap().unwrap_err();
        assert!(err.is_access_denied());
        assert!(matches!(err, ClientError::Status { status: 403, .. }));
    }

    #[test]
    fn test_api_url_escapes_segments() {
        let url = api_url(
            "https://management.azure.com/",
            &["subscriptions", "sub 1", "resourceGroups", "rg#1"],
            "2022-07-01",
        )
        .unwrap();
        assert_eq!(
            url,
            "https://management.azure.com/subscriptions/sub%201/resourceGroups/rg%231?api-version=2022-07-01"
        );
    }

    #[tokio::test]
    async fn test_invalid_vault_uri_yields_failed_page() {
        let vault = Vault {
            id: "/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv1".into(),
            name: "kv1".into(),
            location: String::new(),
            resource_group: "rg".into(),
            tags: HashMap::new(),
            vault_uri: "not a url".into(),
        };
        let mut pager = VaultItemLister::new(http()).list_items(&ctx(Audience::Vault), &vault, ItemKind::Keys);

        assert!(pager.next_page().await.unwrap().is_err());
        assert!(pager.next_page().await.is_none());
    }

    #[tokio::test]
    async fn test_resource_graph_filter_follows_skip_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/providers/Microsoft.ResourceGraph/resources")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "subscriptions": ["sub1"],
                "query": "Resources | where type =~ \"microsoft.keyvault/vaults\" | where tags.monitor == \"true\" | project id",
                "options": { "resultFormat": "objectArray", "$skipToken": "page2" }
            })))
            .with_status(200)
            .with_body(r#"{"data":[{"id":"/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/KV2"}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/providers/Microsoft.ResourceGraph/resources")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":[{"id":"/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/KV1"}],"$skipToken":"page2"}"#)
            .create_async()
            .await;

        let filter = ResourceGraphFilter::new(
            http(),
            endpoints(&server),
            "| where tags.monitor == \"true\"".into(),
        );
        let ids = filter
            .resolve(&ctx(Audience::Management), &[Subscription::new("sub1", "Production")])
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(ids.contains("/subscriptions/sub1/resourcegroups/rg/providers/microsoft.keyvault/vaults/kv1"));
        assert!(ids.contains("/subscriptions/sub1/resourcegroups/rg/providers/microsoft.keyvault/vaults/kv2"));
    }
}
