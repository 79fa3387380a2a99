//! External apply/delete capability. The engine never talks to a cluster or
//! cloud API directly; it is handed an implementation of this trait.

use async_trait::async_trait;
use rekon_core::{ObservedStatus, Resource, ResourceId};

/// Failure classification drives the retry policy: transient errors
/// (network, timeout, 5xx-equivalent) are retried with backoff, permanent
/// ones (spec rejected by the external system) surface immediately.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Live object state as the external system reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveObject {
    pub spec: serde_json::Value,
    pub status: ObservedStatus,
}

/// Injected external API surface, one implementation per target system.
/// Apply is declarative (create-or-update to the given spec); observe feeds
/// drift detection.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn apply(&self, resource: &Resource) -> Result<ObservedStatus, ClientError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError>;

    /// Fetch current live state; `Ok(None)` means the object does not exist.
    async fn observe(&self, id: &ResourceId) -> Result<Option<LiveObject>, ClientError>;
}
