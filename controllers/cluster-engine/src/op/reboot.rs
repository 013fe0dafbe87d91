//! Reboot queue operators.
//!
//! Entries move Queued → Draining → Rebooting and are dequeued once the
//! boot check reports the node back. A failed or timed-out drain sends the
//! entry back to Queued with an exponential back-off.

use super::common::run_local_with_retries;
use super::{Commander, Operator, Sequence};
use crate::backoff::DrainBackoff;
use crate::error::EngineError;
use crate::infrastructure::Infrastructure;
use crate::k8s::{self, EvictPolicy};
use async_trait::async_trait;
use chrono::Utc;
use cluster_spec::{Cluster, Command, Node, RebootQueueEntry, RebootSpec, RebootStatus};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams};
use kv_store::KvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cordon marker of nodes drained for a reboot
pub const REBOOT_MARKER: &str = "reboot";

/// Write an entry back; `false` when it was cancelled or dequeued meanwhile
async fn save(inf: &Infrastructure, leader_key: &str, entry: &RebootQueueEntry) -> Result<bool, EngineError> {
    match inf.storage().update_reboots_entry(leader_key, entry).await {
        Ok(()) => Ok(true),
        Err(e @ (KvError::Conflict(_) | KvError::NotFound(_))) => {
            warn!("Reboot entry for {} changed meanwhile: {}", entry.node, e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// A queue entry with the Kubernetes name of its node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootTarget {
    /// Queue entry
    pub entry: RebootQueueEntry,
    /// Name of the Node object
    pub nodename: String,
}

impl RebootTarget {
    /// Target for `entry`, falling back to the address as node name
    #[must_use]
    pub fn new(cluster: &Cluster, entry: &RebootQueueEntry) -> Self {
        let nodename = cluster
            .node(&entry.node)
            .map_or(entry.node.as_str(), Node::nodename)
            .to_string();
        Self {
            entry: entry.clone(),
            nodename,
        }
    }
}

fn target_addresses(targets: &[RebootTarget]) -> Vec<String> {
    targets.iter().map(|t| t.entry.node.clone()).collect()
}

/// Cordon, then evict every evictable pod of a node
///
/// # Errors
///
/// Returns the first eviction that could not be completed.
pub(crate) async fn drain(
    ctx: &CancellationToken,
    client: &kube::Client,
    nodename: &str,
    marker: &str,
    protected: Option<&LabelSelector>,
    policy: EvictPolicy,
) -> Result<(), EngineError> {
    k8s::cordon(client, nodename, marker).await?;
    let protected = k8s::protected_namespaces(client, protected).await?;
    let pods = k8s::pods_on_node(client, nodename).await?;
    k8s::evict_or_delete(ctx, client, &pods, &protected, policy).await
}

/// Which kind of entry removal to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Cancel,
    Dequeue,
}

/// Remove entries from the reboot queue
pub struct RemoveEntries {
    removal: Removal,
    entries: Vec<RebootQueueEntry>,
}

#[async_trait]
impl Commander for RemoveEntries {
    fn command(&self) -> Command {
        let name = match self.removal {
            Removal::Cancel => "reboot-cancel",
            Removal::Dequeue => "reboot-dequeue",
        };
        let nodes: Vec<&str> = self.entries.iter().map(|e| e.node.as_str()).collect();
        Command::new(name, nodes.join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        for entry in &self.entries {
            inf.storage()
                .delete_reboots_entry(leader_key, entry.index)
                .await?;
            info!("Removed reboot entry {} for {}", entry.index, entry.node);
        }
        Ok(())
    }
}

/// Drop cancelled entries
#[must_use]
pub fn cancel(entries: Vec<RebootQueueEntry>) -> Box<dyn Operator> {
    let targets = entries.iter().map(|e| e.node.clone()).collect();
    Sequence::new("reboot-cancel", targets)
        .then(RemoveEntries {
            removal: Removal::Cancel,
            entries,
        })
        .boxed()
}

/// Drop entries of rebooted or removed nodes
#[must_use]
pub fn dequeue(entries: Vec<RebootQueueEntry>) -> Box<dyn Operator> {
    let targets = entries.iter().map(|e| e.node.clone()).collect();
    Sequence::new("reboot-dequeue", targets)
        .then(RemoveEntries {
            removal: Removal::Dequeue,
            entries,
        })
        .boxed()
}

/// Delete pods of `OnDelete` DaemonSets, which eviction leaves behind
pub struct DeleteDaemonSetPods {
    api_server: Node,
    targets: Vec<RebootTarget>,
}

fn is_on_delete(daemon_set: &DaemonSet) -> bool {
    daemon_set
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        == Some("OnDelete")
}

#[async_trait]
impl Commander for DeleteDaemonSetPods {
    fn command(&self) -> Command {
        Command::new("delete-daemonset-pod", target_addresses(&self.targets).join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let client = inf.kube(&self.api_server).await?;
        for target in &self.targets {
            let pods = k8s::pods_on_node(&client, &target.nodename).await?;
            for pod in pods.iter().filter(|p| k8s::is_daemonset_pod(p)) {
                let namespace = pod.metadata.namespace.clone().unwrap_or_default();
                let name = pod.metadata.name.clone().unwrap_or_default();
                let Some(owner) = pod
                    .metadata
                    .owner_references
                    .iter()
                    .flatten()
                    .find(|o| o.kind == "DaemonSet")
                else {
                    continue;
                };
                let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
                let Some(daemon_set) = daemon_sets.get_opt(&owner.name).await? else {
                    continue;
                };
                if !is_on_delete(&daemon_set) {
                    continue;
                }
                let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
                match pods.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => info!("Deleted DaemonSet pod {}/{} on {}", namespace, name, target.nodename),
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

/// Delete DaemonSet pods of nodes about to reboot
#[must_use]
pub fn delete_daemonset_pods(api_server: Node, targets: Vec<RebootTarget>) -> Box<dyn Operator> {
    Sequence::new("reboot-delete-daemonset-pod", target_addresses(&targets))
        .then(DeleteDaemonSetPods { api_server, targets })
        .boxed()
}

/// Run the reboot command for drained nodes
pub struct Reboot {
    spec: RebootSpec,
    targets: Vec<RebootTarget>,
}

#[async_trait]
impl Commander for Reboot {
    fn command(&self) -> Command {
        Command::new("reboot", target_addresses(&self.targets).join(","))
            .with_detail(self.spec.reboot_command.join(" "))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        for target in &self.targets {
            let address = &target.entry.node;
            inf.release_agent(address);

            let mut argv = self.spec.reboot_command.clone();
            argv.push(address.clone());
            run_local_with_retries(
                ctx,
                inf,
                &argv,
                self.spec.command_timeout(),
                self.spec.command_retries.unwrap_or(0),
                self.spec.command_interval(),
            )
            .await?;

            let mut entry = target.entry.clone();
            entry.status = RebootStatus::Rebooting;
            entry.last_transition_time = Some(Utc::now());
            if save(inf, leader_key, &entry).await? {
                info!("Rebooting node {}", address);
            }
        }
        Ok(())
    }
}

/// Run the reboot command on drained nodes and mark them rebooting
#[must_use]
pub fn reboot(spec: RebootSpec, targets: Vec<RebootTarget>) -> Box<dyn Operator> {
    Sequence::new("reboot-reboot", target_addresses(&targets))
        .then(Reboot { spec, targets })
        .boxed()
}

async fn back_off(
    inf: &Infrastructure,
    leader_key: &str,
    entry: &RebootQueueEntry,
    backoff: DrainBackoff,
) -> Result<(), EngineError> {
    let now = Utc::now();
    let (count, expire) = backoff.next(entry.drain_backoff_count, now);
    let mut entry = entry.clone();
    entry.status = RebootStatus::Queued;
    entry.last_transition_time = Some(now);
    entry.drain_backoff_count = count;
    entry.drain_backoff_expire = Some(expire);
    if save(inf, leader_key, &entry).await? {
        info!(
            "Reboot entry for {} back to queue, next drain after {}",
            entry.node, expire
        );
    }
    Ok(())
}

/// Mark entries draining, cordon their nodes and evict pods
///
/// A drain failure is recorded as back-off on the entry, not as a command
/// failure.
pub struct DrainStart {
    api_server: Node,
    spec: RebootSpec,
    targets: Vec<RebootTarget>,
    backoff: DrainBackoff,
}

#[async_trait]
impl Commander for DrainStart {
    fn command(&self) -> Command {
        Command::new("drain-start", target_addresses(&self.targets).join(","))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        for target in &self.targets {
            let mut entry = target.entry.clone();
            entry.status = RebootStatus::Draining;
            entry.last_transition_time = Some(Utc::now());
            if !save(inf, leader_key, &entry).await? {
                continue;
            }

            let policy = EvictPolicy {
                retries: self.spec.evict_retries.unwrap_or(0),
                interval: self.spec.evict_interval(),
            };
            let result = match inf.kube(&self.api_server).await {
                Ok(client) => {
                    drain(
                        ctx,
                        &client,
                        &target.nodename,
                        REBOOT_MARKER,
                        self.spec.protected_namespaces.as_ref(),
                        policy,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => info!("Draining node {}", entry.node),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    warn!("Drain of {} failed: {}", entry.node, e);
                    back_off(inf, leader_key, &entry, self.backoff).await?;
                }
            }
        }
        Ok(())
    }
}

/// Cordon nodes, evict their pods and mark them draining
#[must_use]
pub fn drain_start(api_server: Node, spec: RebootSpec, targets: Vec<RebootTarget>) -> Box<dyn Operator> {
    Sequence::new("reboot-drain-start", target_addresses(&targets))
        .then(DrainStart {
            api_server,
            spec,
            targets,
            backoff: DrainBackoff::default(),
        })
        .boxed()
}

/// Send entries whose drain took too long back to the queue
pub struct DrainTimeout {
    entries: Vec<RebootQueueEntry>,
    backoff: DrainBackoff,
}

#[async_trait]
impl Commander for DrainTimeout {
    fn command(&self) -> Command {
        let nodes: Vec<&str> = self.entries.iter().map(|e| e.node.as_str()).collect();
        Command::new("drain-timeout", nodes.join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, leader_key: &str) -> Result<(), EngineError> {
        for entry in &self.entries {
            back_off(inf, leader_key, entry, self.backoff).await?;
        }
        Ok(())
    }
}

/// Back off entries whose eviction timed out
#[must_use]
pub fn drain_timeout(entries: Vec<RebootQueueEntry>) -> Box<dyn Operator> {
    let targets = entries.iter().map(|e| e.node.clone()).collect();
    Sequence::new("reboot-drain-timeout", targets)
        .then(DrainTimeout {
            entries,
            backoff: DrainBackoff::default(),
        })
        .boxed()
}

/// Uncordon nodes left cordoned by the engine
pub struct Uncordon {
    api_server: Node,
    nodenames: Vec<String>,
}

#[async_trait]
impl Commander for Uncordon {
    fn command(&self) -> Command {
        Command::new("uncordon", self.nodenames.join(","))
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let client = inf.kube(&self.api_server).await?;
        for nodename in &self.nodenames {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            k8s::uncordon(&client, nodename).await?;
        }
        Ok(())
    }
}

/// Uncordon nodes left cordoned by the engine
#[must_use]
pub fn uncordon(api_server: Node, nodenames: Vec<String>) -> Box<dyn Operator> {
    Sequence::new("reboot-uncordon", nodenames.clone())
        .then(Uncordon {
            api_server,
            nodenames,
        })
        .boxed()
}
