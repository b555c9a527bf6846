//! Error types shared by the collaborator clients and the collection engine

use std::time::Duration;

/// Failure of a single remote call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// True for authorization failures (401/403), which usually mean the
    /// exporter identity lacks a vault access policy
    pub fn is_access_denied(&self) -> bool {
        matches!(self, ClientError::Status { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Request(err.to_string())
        }
    }
}

/// Reasons a whole collection cycle is abandoned
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("failed to acquire credentials: {0}")]
    Credentials(#[source] ClientError),
    #[error("failed to list subscriptions: {0}")]
    Subscriptions(#[source] ClientError),
    #[error("failed to resolve vault filter: {0}")]
    Filter(#[source] ClientError),
    #[error("failed to publish metrics: {0}")]
    Registry(#[from] prometheus::Error),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
