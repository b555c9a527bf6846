//! Azure REST backend
//!
//! Implements the collaborator traits over the Azure management and Key Vault
//! data-plane REST APIs. Authentication uses the OAuth2 client credentials flow
//! or a static bearer token.

mod auth;
mod resources;

pub use auth::{AuthMode, AzureCredentials};
pub use resources::{ArmSubscriptionLister, ArmVaultLister, ResourceGraphFilter, VaultItemLister};

use crate::client::Backend;
use crate::error::{ClientError, ClientResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const SUBSCRIPTIONS_API_VERSION: &str = "2020-01-01";
const VAULTS_API_VERSION: &str = "2022-07-01";
const RESOURCE_GRAPH_API_VERSION: &str = "2021-03-01";
const DATA_PLANE_API_VERSION: &str = "7.4";

/// Named Azure cloud environments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureCloud {
    Public,
    China,
    UsGovernment,
}

impl FromStr for AzureCloud {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "azurepubliccloud" | "public" => Ok(AzureCloud::Public),
            "azurechinacloud" | "china" => Ok(AzureCloud::China),
            "azureusgovernmentcloud" | "usgovernment" => Ok(AzureCloud::UsGovernment),
            other => Err(format!("unknown azure cloud: {}", other)),
        }
    }
}

impl AzureCloud {
    pub fn endpoints(&self) -> AzureEndpoints {
        let (authority, management, vault_suffix) = match self {
            AzureCloud::Public => (
                "https://login.microsoftonline.com",
                "https://management.azure.com",
                "vault.azure.net",
            ),
            AzureCloud::China => (
                "https://login.chinacloudapi.cn",
                "https://management.chinacloudapi.cn",
                "vault.azure.cn",
            ),
            AzureCloud::UsGovernment => (
                "https://login.microsoftonline.us",
                "https://management.usgovcloudapi.net",
                "vault.usgovcloudapi.net",
            ),
        };

        AzureEndpoints {
            authority: authority.to_string(),
            management: management.to_string(),
            management_scope: format!("{}/.default", management),
            vault_scope: format!("https://{}/.default", vault_suffix),
            vault_dns_suffix: vault_suffix.to_string(),
        }
    }
}

/// Base URLs and token scopes of one cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureEndpoints {
    pub authority: String,
    pub management: String,
    pub management_scope: String,
    pub vault_scope: String,
    pub vault_dns_suffix: String,
}

impl Default for AzureEndpoints {
    fn default() -> Self {
        AzureCloud::Public.endpoints()
    }
}

/// Everything needed to talk to Azure
#[derive(Debug, Clone)]
pub struct AzureBackendConfig {
    pub endpoints: AzureEndpoints,
    pub auth: AuthMode,
    /// Subscription ids to walk; empty means every visible subscription
    pub subscriptions: Vec<String>,
    /// Resource Graph filter clause selecting the vaults to include
    pub vault_filter: Option<String>,
    pub request_timeout: Duration,
}

/// Build a backend wired to the Azure REST APIs
pub fn build_backend(config: AzureBackendConfig) -> ClientResult<Backend> {
    let http = AzureHttp::new(config.request_timeout)?;
    let endpoints = Arc::new(config.endpoints);

    let filter = config
        .vault_filter
        .filter(|clause| !clause.trim().is_empty())
        .map(|clause| {
            Arc::new(ResourceGraphFilter::new(http.clone(), endpoints.clone(), clause))
                as Arc<dyn crate::client::InclusionFilter>
        });

    Ok(Backend {
        credentials: Arc::new(AzureCredentials::new(
            http.clone(),
            endpoints.clone(),
            config.auth,
        )),
        subscriptions: Arc::new(ArmSubscriptionLister::new(
            http.clone(),
            endpoints.clone(),
            config.subscriptions,
        )),
        vaults: Arc::new(ArmVaultLister::new(http.clone(), endpoints.clone())),
        items: Arc::new(VaultItemLister::new(http)),
        filter,
    })
}

/// Shared HTTP client with Azure error mapping
#[derive(Clone)]
pub struct AzureHttp {
    client: reqwest::Client,
}

impl AzureHttp {
    pub fn new(timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("keyvault-exporter/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub async fn get_json<R: DeserializeOwned>(&self, url: &str, authorization: &str) -> ClientResult<R> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        authorization: &str,
        body: &B,
    ) -> ClientResult<R> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(body)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn post_form<R: DeserializeOwned>(&self, url: &str, form: &[(&str, &str)]) -> ClientResult<R> {
        let response = self.client.post(url).form(form).send().await?;
        decode(response).await
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> ClientResult<R> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<R>()
        .await
        .map_err(|err| ClientError::Decode(err.to_string()))
}

/// One page of an ARM or data-plane list response
#[derive(Debug, Deserialize)]
struct ListPage<R> {
    #[serde(default = "Vec::new")]
    value: Vec<R>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
}
