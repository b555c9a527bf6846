//! Core data models for the exporter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Cloud subscription, the top-level partition of vault enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub display_name: String,
}

impl Subscription {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Key vault resource as returned by the management plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    /// Full resource id, e.g. `/subscriptions/<sub>/resourceGroups/<rg>/providers/...`
    pub id: String,
    pub name: String,
    pub location: String,
    pub resource_group: String,
    pub tags: HashMap<String, String>,
    /// Data-plane endpoint, e.g. `https://myvault.vault.azure.net/`
    pub vault_uri: String,
}

impl Vault {
    /// Lower-cased resource id used for labels and filter lookups
    pub fn resource_id(&self) -> String {
        self.id.to_lowercase()
    }
}

/// The three kinds of entries stored in a vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Keys,
    Secrets,
    Certificates,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Keys, ItemKind::Secrets, ItemKind::Certificates];

    /// Scope label value, also the path segment of the data-plane listing
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Keys => "keys",
            ItemKind::Secrets => "secrets",
            ItemKind::Certificates => "certificates",
        }
    }

    /// Singular noun used in label names (`keyID`, `secretName`, ...)
    pub fn singular(&self) -> &'static str {
        match self {
            ItemKind::Keys => "key",
            ItemKind::Secrets => "secret",
            ItemKind::Certificates => "certificate",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle timestamps of a vault item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTimestamps {
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
}

/// A key, secret or certificate entry inside a vault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub tags: HashMap<String, String>,
    pub timestamps: ItemTimestamps,
}

/// A vault together with the subscription it was listed under
#[derive(Debug, Clone)]
pub struct VaultTarget {
    pub subscription: Subscription,
    pub vault: Vault,
}

/// Extract the resource group segment from an Azure resource id
pub fn resource_group_from_id(resource_id: &str) -> Option<&str> {
    let mut segments = resource_id.split('/');
    while let Some(segment) = segments.next() {
        if segment.eq_ignore_ascii_case("resourceGroups") {
            return segments.next().filter(|rg| !rg.is_empty());
        }
    }
    None
}

/// Last path segment of a resource or item id
pub fn name_from_id(id: &str) -> Option<&str> {
    id.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}
