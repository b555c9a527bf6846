//! Collaborator interfaces used by the collection engine
//!
//! The engine never talks to a cloud API directly. Credentials, subscription
//! and vault enumeration, and item listings are reached through the traits in
//! this module, so tests can drive the engine with in-memory backends.

use crate::error::ClientResult;
use crate::models::{ItemKind, Subscription, Vault, VaultItem};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Token audience a request context is issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Management plane: subscriptions, vault listing, resource graph
    Management,
    /// Vault data plane: keys, secrets, certificates
    Vault,
}

/// Bearer context attached to remote calls
#[derive(Clone)]
pub struct RequestContext {
    audience: Audience,
    bearer: String,
}

impl RequestContext {
    pub fn new(audience: Audience, bearer: impl Into<String>) -> Self {
        Self {
            audience,
            bearer: bearer.into(),
        }
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.bearer)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("audience", &self.audience)
            .field("bearer", &"<redacted>")
            .finish()
    }
}

/// Paged sequence of remote results.
///
/// Each call fetches one page. `None` means the sequence is exhausted; an
/// error applies to that page only and callers stop paging on it.
#[async_trait]
pub trait Pager<T>: Send {
    async fn next_page(&mut self) -> Option<ClientResult<Vec<T>>>;
}

pub type BoxPager<T> = Box<dyn Pager<T>>;

/// Supplies request contexts for remote calls
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire_context(&self, audience: Audience) -> ClientResult<RequestContext>;
}

/// Lists the subscriptions to walk
#[async_trait]
pub trait SubscriptionLister: Send + Sync {
    async fn list_subscriptions(&self, ctx: &RequestContext) -> ClientResult<Vec<Subscription>>;
}

/// Lists vaults in a subscription, optionally restricted to a resource group
pub trait VaultLister: Send + Sync {
    fn list_vaults(
        &self,
        ctx: &RequestContext,
        subscription: &Subscription,
        resource_group: Option<&str>,
    ) -> BoxPager<Vault>;
}

/// Lists the keys, secrets or certificates stored in a vault
pub trait ItemLister: Send + Sync {
    fn list_items(&self, ctx: &RequestContext, vault: &Vault, kind: ItemKind) -> BoxPager<VaultItem>;
}

/// Resolves the set of vault resource ids to include in a cycle.
///
/// Returned ids must be lower-cased.
#[async_trait]
pub trait InclusionFilter: Send + Sync {
    async fn resolve(
        &self,
        ctx: &RequestContext,
        subscriptions: &[Subscription],
    ) -> ClientResult<HashSet<String>>;
}

/// Bundle of collaborators the orchestrator needs
#[derive(Clone)]
pub struct Backend {
    pub credentials: Arc<dyn CredentialProvider>,
    pub subscriptions: Arc<dyn SubscriptionLister>,
    pub vaults: Arc<dyn VaultLister>,
    pub items: Arc<dyn ItemLister>,
    pub filter: Option<Arc<dyn InclusionFilter>>,
}

/// Pager over pages that are already in memory
pub struct StaticPager<T> {
    pages: VecDeque<ClientResult<Vec<T>>>,
}

impl<T> StaticPager<T> {
    pub fn new(pages: impl IntoIterator<Item = ClientResult<Vec<T>>>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
        }
    }

    /// A pager yielding a single page
    pub fn single(items: Vec<T>) -> Self {
        Self::new([Ok(items)])
    }
}

#[async_trait]
impl<T: Send> Pager<T> for StaticPager<T> {
    async fn next_page(&mut self) -> Option<ClientResult<Vec<T>>> {
        self.pages.pop_front()
    }
}
