//! Storage errors

use thiserror::Error;

/// Errors that can occur when talking to the key-value store
#[derive(Debug, Error)]
pub enum KvError {
    /// etcd RPC error
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The leader key no longer exists; this replica lost leadership
    #[error("Not leader: {0}")]
    NotLeader(String),

    /// A conditional write lost a race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Watch stream failed or was compacted
    #[error("Watch error: {0}")]
    Watch(String),

    /// Lease expired or could not be kept alive
    #[error("Session error: {0}")]
    Session(String),

    /// Request rejected before reaching the store
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl KvError {
    /// Whether the key does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
