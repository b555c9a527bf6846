//! Azure access tokens, cached per audience

use super::{AzureEndpoints, AzureHttp};
use crate::client::{Audience, CredentialProvider, RequestContext};
use crate::error::{ClientError, ClientResult};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// How the exporter authenticates against Azure
#[derive(Clone)]
pub enum AuthMode {
    ClientCredentials {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    StaticToken {
        bearer: String,
    },
}

impl AuthMode {
    /// Read credentials from `AZURE_BEARER_TOKEN`, or from `AZURE_TENANT_ID`,
    /// `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`
    pub fn from_env() -> anyhow::Result<Self> {
        let static_token = std::env::var("AZURE_BEARER_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(bearer) = static_token {
            return Ok(AuthMode::StaticToken { bearer });
        }

        let tenant_id =
            std::env::var("AZURE_TENANT_ID").context("missing AZURE_TENANT_ID for Azure auth")?;
        let client_id =
            std::env::var("AZURE_CLIENT_ID").context("missing AZURE_CLIENT_ID for Azure auth")?;
        let client_secret = std::env::var("AZURE_CLIENT_SECRET")
            .context("missing AZURE_CLIENT_SECRET for Azure auth")?;

        Ok(AuthMode::ClientCredentials {
            tenant_id,
            client_id,
            client_secret,
        })
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::ClientCredentials {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientCredentials")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            AuthMode::StaticToken { .. } => f
                .debug_struct("StaticToken")
                .field("bearer", &"<redacted>")
                .finish(),
        }
    }
}

/// Cached tokens are replaced once less than this much validity is left
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Credential provider caching one token per audience
pub struct AzureCredentials {
    http: AzureHttp,
    endpoints: Arc<AzureEndpoints>,
    mode: AuthMode,
    cache: Mutex<HashMap<Audience, CachedToken>>,
}

impl AzureCredentials {
    pub fn new(http: AzureHttp, endpoints: Arc<AzureEndpoints>, mode: AuthMode) -> Self {
        match &mode {
            AuthMode::ClientCredentials {
                tenant_id,
                client_id,
                ..
            } => info!(
                tenant_id = %tenant_id,
                client_id = %client_id,
                "Azure credential: client secret"
            ),
            AuthMode::StaticToken { .. } => info!("Azure credential: static bearer token"),
        }

        Self {
            http,
            endpoints,
            mode,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn scope(&self, audience: Audience) -> &str {
        match audience {
            Audience::Management => &self.endpoints.management_scope,
            Audience::Vault => &self.endpoints.vault_scope,
        }
    }

    async fn request_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        audience: Audience,
    ) -> ClientResult<CachedToken> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.endpoints.authority.trim_end_matches('/'),
            tenant_id
        );
        let form = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", self.scope(audience)),
            ("grant_type", "client_credentials"),
        ];

        let payload: TokenResponse = self.http.post_form(&url, &form).await.map_err(|err| match err {
            ClientError::Status { status, body } => {
                ClientError::Auth(format!("token endpoint rejected the request: {} {}", status, body))
            }
            other => other,
        })?;

        let expires_in = Duration::from_secs(payload.expires_in.unwrap_or(3600));
        let usable_for = expires_in.saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(?audience, expires_in = expires_in.as_secs(), "Acquired access token");

        Ok(CachedToken {
            token: payload.access_token,
            expires_at: Instant::now() + usable_for,
        })
    }
}

#[async_trait]
impl CredentialProvider for AzureCredentials {
    async fn acquire_context(&self, audience: Audience) -> ClientResult<RequestContext> {
        let (tenant_id, client_id, client_secret) = match &self.mode {
            AuthMode::StaticToken { bearer } => {
                let token = bearer
                    .strip_prefix("Bearer ")
                    .or_else(|| bearer.strip_prefix("bearer "))
                    .unwrap_or(bearer);
                return Ok(RequestContext::new(audience, token));
            }
            AuthMode::ClientCredentials {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&audience) {
            if Instant::now() < cached.expires_at {
                return Ok(RequestContext::new(audience, cached.token.clone()));
            }
        }

        let fresh = self
            .request_token(tenant_id, client_id, client_secret, audience)
            .await?;
        let ctx = RequestContext::new(audience, fresh.token.clone());
        cache.insert(audience, fresh);
        Ok(ctx)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}
