//! Engine error types.
//!
//! Errors from the storage, node agent and credential broker layers are
//! wrapped here so commanders and the controller share one result type.

use crate::broker::BrokerError;
use cluster_spec::SpecError;
use kv_store::KvError;
use node_agent::AgentError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the cluster engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage error
    #[error("Storage error: {0}")]
    Kv(#[from] KvError),

    /// Cluster document or constraint error
    #[error("Specification error: {0}")]
    Spec(#[from] SpecError),

    /// Remote command or container engine error
    #[error("Node agent error: {0}")]
    Agent(#[from] AgentError),

    /// Credential broker error
    #[error("Credential broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Managed etcd API error
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// HTTP error from a health probe
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A locally executed command failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// An operation did not finish in time
    #[error("Timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// The reconcile pass was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// A node required by a command has no connection this pass
    #[error("Node not connected: {0}")]
    NotConnected(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background task panicked or was aborted
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// This replica no longer holds leadership
    #[error("Leadership lost")]
    NotLeader,
}

impl EngineError {
    /// Whether the error means leadership is gone and the election must restart
    #[must_use]
    pub fn is_leadership_lost(&self) -> bool {
        matches!(
            self,
            Self::NotLeader | Self::Kv(KvError::NotLeader(_) | KvError::Session(_))
        )
    }
}
