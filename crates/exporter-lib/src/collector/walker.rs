//! Vault enumeration across subscriptions
//!
//! Walks subscriptions one at a time and pages through their vault listings,
//! handing vaults out as soon as each page arrives.

use crate::client::{BoxPager, RequestContext, VaultLister};
use crate::models::{Subscription, Vault, VaultTarget};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default timeout for a single listing page
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Counters describing one walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub subscriptions_walked: usize,
    pub failed_subscriptions: Vec<String>,
    pub vaults_found: usize,
    pub vaults_filtered: usize,
}

/// Lazily produces the vaults to collect in one cycle.
///
/// A walker is single-use; every cycle builds a new one.
pub struct ResourceWalker {
    lister: Arc<dyn VaultLister>,
    ctx: RequestContext,
    resource_group: Option<String>,
    include: Option<HashSet<String>>,
    request_timeout: Duration,
    pending: VecDeque<Subscription>,
    current: Option<(Subscription, BoxPager<Vault>)>,
    buffered: VecDeque<VaultTarget>,
    stats: WalkStats,
}

impl ResourceWalker {
    pub fn new(
        lister: Arc<dyn VaultLister>,
        ctx: RequestContext,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        Self {
            lister,
            ctx,
            resource_group: None,
            include: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pending: subscriptions.into(),
            current: None,
            buffered: VecDeque::new(),
            stats: WalkStats::default(),
        }
    }

    /// Only list vaults in this resource group
    pub fn resource_group(mut self, resource_group: Option<String>) -> Self {
        self.resource_group = resource_group.filter(|rg| !rg.is_empty());
        self
    }

    /// Skip vaults whose resource id is not in `ids` (case-insensitive)
    pub fn include_only(mut self, ids: HashSet<String>) -> Self {
        self.include = Some(ids.into_iter().map(|id| id.to_lowercase()).collect());
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn stats(&self) -> &WalkStats {
        &self.stats
    }

    /// Next vault to collect, `None` once every subscription is exhausted
    pub async fn next(&mut self) -> Option<VaultTarget> {
        loop {
            if let Some(target) = self.buffered.pop_front() {
                return Some(target);
            }

            if self.current.is_none() {
                let subscription = self.pending.pop_front()?;
                debug!(subscription = %subscription.id, "Listing vaults");
                let pager = self.lister.list_vaults(
                    &self.ctx,
                    &subscription,
                    self.resource_group.as_deref(),
                );
                self.stats.subscriptions_walked += 1;
                self.current = Some((subscription, pager));
            }

            let Some((subscription, pager)) = self.current.as_mut() else {
                continue;
            };

            let finished = match timeout(self.request_timeout, pager.next_page()).await {
                Ok(Some(Ok(vaults))) => {
                    for vault in vaults {
                        let resource_id = vault.resource_id();
                        if let Some(include) = &self.include {
                            if !include.contains(&resource_id) {
                                debug!(
                                    resource_id = %resource_id,
                                    "Ignoring vault, not matching vault filter"
                                );
                                self.stats.vaults_filtered += 1;
                                continue;
                            }
                        }
                        self.stats.vaults_found += 1;
                        self.buffered.push_back(VaultTarget {
                            subscription: subscription.clone(),
                            vault,
                        });
                    }
                    false
                }
                Ok(None) => true,
                Ok(Some(Err(err))) => {
                    warn!(
                        subscription = %subscription.id,
                        error = %err,
                        "Vault listing failed, skipping rest of subscription"
                    );
                    self.stats.failed_subscriptions.push(subscription.id.clone());
                    true
                }
                Err(_) => {
                    warn!(
                        subscription = %subscription.id,
                        timeout_secs = self.request_timeout.as_secs(),
                        "Vault listing timed out, skipping rest of subscription"
                    );
                    self.stats.failed_subscriptions.push(subscription.id.clone());
                    true
                }
            };

            if finished {
                self.current = None;
            }
        }
    }
}
