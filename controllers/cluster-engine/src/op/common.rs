//! Commanders shared by the service, etcd and upgrade operators.

use super::Commander;
use super::certs::{self, FileSet};
use crate::error::EngineError;
use crate::infrastructure::Infrastructure;
use async_trait::async_trait;
use cluster_spec::names::{CONFIG_VERSION, ENGINE_DIRS};
use cluster_spec::{Cluster, Command, Node, ServiceParams};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use node_agent::shell;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout of the etcd and Kubernetes readiness waits
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Addresses of nodes
#[must_use]
pub fn addresses(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| n.address.clone()).collect()
}

/// Sleep unless cancelled first
///
/// # Errors
///
/// Returns `EngineError::Cancelled` when `ctx` fires.
pub async fn sleep_or_cancel(ctx: &CancellationToken, duration: Duration) -> Result<(), EngineError> {
    tokio::select! {
        () = ctx.cancelled() => Err(EngineError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run a local command, retrying `retries` more times on failure
///
/// # Errors
///
/// Returns the last failure, or `EngineError::Cancelled`.
pub async fn run_local_with_retries(
    ctx: &CancellationToken,
    inf: &Infrastructure,
    argv: &[String],
    timeout: Duration,
    retries: u32,
    interval: Duration,
) -> Result<String, EngineError> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            () = ctx.cancelled() => return Err(EngineError::Cancelled),
            result = inf.run_local(argv, timeout) => result,
        };
        match result {
            Ok(stdout) => return Ok(stdout),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!("{} failed (attempt {}/{}): {}", argv.join(" "), attempt, retries + 1, e);
                sleep_or_cancel(ctx, interval).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `f` for every address concurrently and fail on the first error
async fn each<'a, F, Fut>(ctx: &CancellationToken, targets: &'a [String], f: F) -> Result<(), EngineError>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<(), EngineError>>,
{
    tokio::select! {
        () = ctx.cancelled() => Err(EngineError::Cancelled),
        result = try_join_all(targets.iter().map(|t| f(t.as_str()))) => result.map(|_| ()),
    }
}

/// Pull an image on nodes
#[derive(Debug, Clone)]
pub struct ImagePull {
    /// Target addresses
    pub nodes: Vec<String>,
    /// Image reference
    pub image: &'static str,
}

#[async_trait]
impl Commander for ImagePull {
    fn command(&self) -> Command {
        Command::new("image-pull", self.nodes.join(",")).with_detail(self.image)
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        each(ctx, &self.nodes, |address| async move {
            inf.engine(address)?.pull_image(self.image).await?;
            Ok::<_, EngineError>(())
        })
        .await
    }
}

/// Write a file set on nodes; contents are built per node at run time
#[derive(Debug, Clone)]
pub struct MakeFiles {
    /// Cluster the files are built for
    pub cluster: Arc<Cluster>,
    /// Target nodes
    pub nodes: Vec<Node>,
    /// Files to write
    pub set: FileSet,
}

#[async_trait]
impl Commander for MakeFiles {
    fn command(&self) -> Command {
        Command::new("make-files", addresses(&self.nodes).join(",")).with_detail(self.set.as_str())
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let targets = addresses(&self.nodes);
        each(ctx, &targets, |address| async move {
            let node = self
                .nodes
                .iter()
                .find(|n| n.address == address)
                .ok_or_else(|| EngineError::NotConnected(address.to_string()))?;
            let agent = inf
                .agent(address)
                .ok_or_else(|| EngineError::NotConnected(address.to_string()))?;
            let files = certs::build(inf, &self.cluster, node, self.set).await?;
            debug!("Writing {} {} files on {}", files.len(), self.set.as_str(), address);
            certs::write_files(agent.as_ref(), &files).await
        })
        .await
    }
}

/// Start a system container on nodes, replacing any existing one
#[derive(Debug, Clone)]
pub struct RunContainer {
    /// Container name
    pub name: &'static str,
    /// Image reference
    pub image: &'static str,
    /// Extra runtime flags
    pub opts: Vec<String>,
    /// Built-in parameters per address
    pub params: Vec<(String, ServiceParams)>,
    /// Parameters from the cluster declaration
    pub extra: ServiceParams,
}

#[async_trait]
impl Commander for RunContainer {
    fn command(&self) -> Command {
        let targets: Vec<&str> = self.params.iter().map(|(a, _)| a.as_str()).collect();
        Command::new("run-container", targets.join(",")).with_detail(self.name)
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let targets: Vec<String> = self.params.iter().map(|(a, _)| a.clone()).collect();
        each(ctx, &targets, |address| async move {
            let params = self
                .params
                .iter()
                .find(|(a, _)| a == address)
                .map(|(_, p)| p)
                .ok_or_else(|| EngineError::NotConnected(address.to_string()))?;
            let engine = inf.engine(address)?;
            if engine.exists(self.name).await? {
                engine.stop(self.name).await?;
                engine.remove(self.name).await?;
            }
            engine
                .run_system(self.name, self.image, &self.opts, params, &self.extra)
                .await?;
            info!("Started {} on {}", self.name, address);
            Ok::<_, EngineError>(())
        })
        .await
    }
}

/// Stop and remove containers on nodes
#[derive(Debug, Clone)]
pub struct StopContainers {
    /// Target addresses
    pub nodes: Vec<String>,
    /// Container names
    pub names: Vec<&'static str>,
    /// Kill instead of a graceful stop
    pub kill: bool,
}

#[async_trait]
impl Commander for StopContainers {
    fn command(&self) -> Command {
        let name = if self.kill { "kill-containers" } else { "stop-containers" };
        Command::new(name, self.nodes.join(",")).with_detail(self.names.join(","))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        each(ctx, &self.nodes, |address| async move {
            let engine = inf.engine(address)?;
            for name in &self.names {
                if !engine.exists(name).await? {
                    continue;
                }
                if self.kill {
                    engine.kill(name).await?;
                } else {
                    engine.stop(name).await?;
                }
                engine.remove(name).await?;
            }
            Ok::<_, EngineError>(())
        })
        .await
    }
}

/// Create a volume on nodes
#[derive(Debug, Clone)]
pub struct VolumeCreate {
    /// Target addresses
    pub nodes: Vec<String>,
    /// Volume name
    pub name: String,
}

#[async_trait]
impl Commander for VolumeCreate {
    fn command(&self) -> Command {
        Command::new("volume-create", self.nodes.join(",")).with_detail(&self.name)
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        each(ctx, &self.nodes, |address| async move {
            let engine = inf.engine(address)?;
            if !engine.volume_exists(&self.name).await? {
                engine.volume_create(&self.name).await?;
            }
            Ok::<_, EngineError>(())
        })
        .await
    }
}

/// Remove volumes on nodes; missing volumes are skipped
#[derive(Debug, Clone)]
pub struct VolumeRemove {
    /// Target addresses
    pub nodes: Vec<String>,
    /// Volume names
    pub names: Vec<String>,
}

#[async_trait]
impl Commander for VolumeRemove {
    fn command(&self) -> Command {
        Command::new("volume-remove", self.nodes.join(",")).with_detail(self.names.join(","))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        each(ctx, &self.nodes, |address| async move {
            let engine = inf.engine(address)?;
            for name in &self.names {
                if engine.volume_exists(name).await? {
                    engine.volume_remove(name).await?;
                }
            }
            Ok::<_, EngineError>(())
        })
        .await
    }
}

/// Create the host directories the engine writes to
#[derive(Debug, Clone)]
pub struct SetupHostDirs {
    /// Target addresses
    pub nodes: Vec<String>,
}

#[async_trait]
impl Commander for SetupHostDirs {
    fn command(&self) -> Command {
        Command::new("setup-host-dirs", self.nodes.join(","))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let command = format!("mkdir -p {}", shell::join(&ENGINE_DIRS));
        each(ctx, &self.nodes, |address| {
            let command = command.clone();
            async move {
                let agent = inf
                    .agent(address)
                    .ok_or_else(|| EngineError::NotConnected(address.to_string()))?;
                agent.run(&command).await?;
                Ok::<_, EngineError>(())
            }
        })
        .await
    }
}

/// Record the layout version the nodes now follow
#[derive(Debug, Clone, Default)]
pub struct UpdateConfigVersion;

#[async_trait]
impl Commander for UpdateConfigVersion {
    fn command(&self) -> Command {
        Command::new("update-config-version", CONFIG_VERSION)
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        inf.storage()
            .put_config_version(leader_key, CONFIG_VERSION)
            .await?;
        Ok(())
    }
}

/// Wait until the managed etcd grants a lease
#[derive(Debug, Clone)]
pub struct WaitEtcd {
    /// Client endpoints of the managed etcd
    pub endpoints: Vec<String>,
    /// Give up after this long
    pub timeout: Duration,
}

#[async_trait]
impl Commander for WaitEtcd {
    fn command(&self) -> Command {
        Command::new("wait-etcd", self.endpoints.join(","))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let last = match inf.etcd(&self.endpoints).await {
                Ok(admin) => match admin.grant_revision().await {
                    Ok(_) => return Ok(()),
                    Err(e) => e,
                },
                Err(e) => e,
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(self.timeout, format!("etcd not ready: {last}")));
            }
            debug!("etcd not ready yet: {}", last);
            sleep_or_cancel(ctx, WAIT_INTERVAL).await?;
        }
    }
}

/// Wait until the API server on a node serves requests
#[derive(Debug, Clone)]
pub struct WaitKubernetes {
    /// Node running the API server
    pub node: Node,
    /// Give up after this long
    pub timeout: Duration,
}

#[async_trait]
impl Commander for WaitKubernetes {
    fn command(&self) -> Command {
        Command::new("wait-kubernetes", &self.node.address)
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let last = match inf.kube(&self.node).await {
                Ok(client) => {
                    let api: Api<Namespace> = Api::all(client);
                    match api.get_opt("kube-system").await {
                        Ok(Some(_)) => return Ok(()),
                        Ok(None) => EngineError::CommandFailed("kube-system not created yet".to_string()),
                        Err(e) => e.into(),
                    }
                }
                Err(e) => e,
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(
                    self.timeout,
                    format!("kubernetes not ready: {last}"),
                ));
            }
            debug!("Kubernetes not ready yet: {}", last);
            sleep_or_cancel(ctx, WAIT_INTERVAL).await?;
        }
    }
}
