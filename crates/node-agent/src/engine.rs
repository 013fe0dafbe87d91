//! Container engine trait for mocking
//!
//! System containers are started detached and carry a label with the
//! parameters they were started with. Drift detection compares that label
//! against the parameters the engine would use now.

use crate::error::AgentError;
use cluster_spec::{Mount, ServiceParams};
use std::collections::HashMap;

/// Observed state of one system container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Whether the container is running
    pub running: bool,
    /// Image the container was started from
    pub image: String,
    /// Parameters the engine generated
    pub builtin_params: ServiceParams,
    /// Parameters added by the cluster declaration
    pub extra_params: ServiceParams,

    /// Filled in by health probes after inspection
    pub is_healthy: bool,
}

/// Trait for the container runtime on a node
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull an image unless it is already present
    async fn pull_image(&self, image: &str) -> Result<(), AgentError>;

    /// Run a transient container in the foreground
    async fn run(&self, image: &str, binds: &[Mount], command: &[String]) -> Result<(), AgentError>;

    /// Run a transient container, feeding `input` on stdin
    async fn run_with_input(
        &self,
        image: &str,
        binds: &[Mount],
        command: &[String],
        input: &str,
    ) -> Result<(), AgentError>;

    /// Run a transient container and capture its stdout
    async fn run_with_output(
        &self,
        image: &str,
        binds: &[Mount],
        command: &[String],
    ) -> Result<String, AgentError>;

    /// Start a detached system container
    ///
    /// `params.extra_args` starts with the program to run. `opts` are
    /// additional runtime flags such as `--privileged`.
    async fn run_system(
        &self,
        name: &str,
        image: &str,
        opts: &[String],
        params: &ServiceParams,
        extra: &ServiceParams,
    ) -> Result<(), AgentError>;

    /// Whether a container named `name` exists
    async fn exists(&self, name: &str) -> Result<bool, AgentError>;

    /// Stop a running container
    async fn stop(&self, name: &str) -> Result<(), AgentError>;

    /// Kill a running container
    async fn kill(&self, name: &str) -> Result<(), AgentError>;

    /// Remove a stopped container
    async fn remove(&self, name: &str) -> Result<(), AgentError>;

    /// Inspect system containers; absent containers are left out of the map
    async fn inspect(&self, names: &[&str]) -> Result<HashMap<String, ServiceStatus>, AgentError>;

    /// Create a named volume
    async fn volume_create(&self, name: &str) -> Result<(), AgentError>;

    /// Remove a named volume
    async fn volume_remove(&self, name: &str) -> Result<(), AgentError>;

    /// Whether a named volume exists
    async fn volume_exists(&self, name: &str) -> Result<bool, AgentError>;
}
