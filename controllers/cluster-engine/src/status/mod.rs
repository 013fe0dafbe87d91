//! Cluster status snapshot.
//!
//! The gatherer collects node containers, etcd membership, Kubernetes
//! objects and queue contents in parallel and freezes them into one
//! [`ClusterStatus`] value. Strategy code only reads the snapshot.

mod etcd;
mod kubernetes;
mod node;

pub use etcd::gather_etcd;
pub use kubernetes::gather_kubernetes;
pub use node::{KubeletConfig, gather_node, parse_kubelet_config};

use crate::error::EngineError;
use crate::etcd_admin::EtcdMember;
use crate::infrastructure::Infrastructure;
use cluster_spec::{
    Cluster, RebootQueueEntry, RepairQueueEntry, RepairStatus, RepairStepStatus, ResourceDefinition,
    ResourceStatus,
};
use futures::future::join_all;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use node_agent::ServiceStatus;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Observed etcd container of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdStatus {
    /// etcd container
    pub service: ServiceStatus,
    /// The data volume exists
    pub has_data: bool,
    /// The member marker volume exists
    pub is_added_member: bool,
}

/// Observed kubelet container and its configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeletStatus {
    /// kubelet container
    pub service: ServiceStatus,
    /// Settings read from the kubelet config file
    pub config: Option<KubeletConfig>,
}

/// Per-node status for one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    /// An SSH connection was established
    pub ssh_connected: bool,
    /// API server load balancer
    pub rivers: ServiceStatus,
    /// etcd load balancer
    pub etcd_rivers: ServiceStatus,
    /// etcd member
    pub etcd: EtcdStatus,
    /// kube-apiserver
    pub api_server: ServiceStatus,
    /// kube-controller-manager
    pub controller_manager: ServiceStatus,
    /// kube-scheduler
    pub scheduler: ServiceStatus,
    /// kube-proxy
    pub proxy: ServiceStatus,
    /// kubelet
    pub kubelet: KubeletStatus,
}

impl NodeStatus {
    /// Whether any control plane container is running
    #[must_use]
    pub fn runs_control_plane(&self) -> bool {
        self.etcd_rivers.running
            || self.etcd.service.running
            || self.api_server.running
            || self.controller_manager.running
            || self.scheduler.running
    }
}

/// Membership and health of the managed etcd cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdClusterStatus {
    /// The cluster granted a lease
    pub is_healthy: bool,
    /// Members keyed by member name
    pub members: BTreeMap<String, EtcdMember>,
    /// Whether each member caught up with the cluster revision
    pub in_sync_members: BTreeMap<String, bool>,
}

impl EtcdClusterStatus {
    /// Healthy and every member in sync
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.is_healthy
            && self.members.len() == self.in_sync_members.len()
            && self.in_sync_members.values().all(|v| *v)
    }

    /// Whether member `name` caught up; unknown members are not
    #[must_use]
    pub fn is_in_sync(&self, name: &str) -> bool {
        self.in_sync_members.get(name).copied().unwrap_or(false)
    }
}

/// Cluster DNS objects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterDnsStatus {
    /// Corefile ConfigMap
    pub config_map: Option<ConfigMap>,
    /// ClusterIP of the cluster DNS Service
    pub cluster_ip: String,
}

/// Node-local DNS objects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDnsStatus {
    /// Corefile ConfigMap
    pub config_map: Option<ConfigMap>,
}

/// Observed state of the managed Kubernetes cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubernetesClusterStatus {
    /// The `kube-system` namespace could be read
    pub is_control_plane_ready: bool,
    /// Node objects
    pub nodes: Vec<Node>,
    /// Service named by `Cluster::dns_service`
    pub dns_service: Option<Service>,
    /// Cluster DNS
    pub cluster_dns: ClusterDnsStatus,
    /// Node-local DNS
    pub node_dns: NodeDnsStatus,
    /// Endpoints of `default/kubernetes`
    pub master_endpoints: Option<Endpoints>,
    /// EndpointSlice of `default/kubernetes`
    pub master_endpoint_slice: Option<EndpointSlice>,
    /// Service of the managed etcd
    pub etcd_service: Option<Service>,
    /// Endpoints of the managed etcd
    pub etcd_endpoints: Option<Endpoints>,
    /// EndpointSlice of the managed etcd
    pub etcd_endpoint_slice: Option<EndpointSlice>,
    /// Applied resource definitions keyed by storage key
    pub resource_statuses: HashMap<String, ResourceStatus>,
}

impl KubernetesClusterStatus {
    /// Kubernetes Node by name
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
    }
}

/// Reboot queue as seen by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootQueueStatus {
    /// Processing is not disabled in storage
    pub enabled: bool,
    /// Queue entries in order
    pub entries: Vec<RebootQueueEntry>,
    /// Addresses of draining nodes with nothing left to evict
    pub drain_completed: BTreeSet<String>,
}

/// Repair queue as seen by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairQueueStatus {
    /// Processing is not disabled in storage
    pub enabled: bool,
    /// Queue entries in order
    pub entries: Vec<RepairQueueEntry>,
    /// Addresses whose health check reports the repair done
    pub repair_completed: BTreeSet<String>,
    /// Addresses of draining machines with nothing left to evict
    pub drain_completed: BTreeSet<String>,
}

/// Everything observed in one reconcile pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterStatus {
    /// Layout version the nodes follow
    pub config_version: String,
    /// Node status keyed by address
    pub nodes: BTreeMap<String, NodeStatus>,
    /// Managed etcd
    pub etcd: EtcdClusterStatus,
    /// Managed Kubernetes
    pub kubernetes: KubernetesClusterStatus,
    /// Reboot queue
    pub reboot_queue: RebootQueueStatus,
    /// Repair queue
    pub repair_queue: RepairQueueStatus,
}

impl ClusterStatus {
    /// Status of a node; unknown nodes read as unreachable
    #[must_use]
    pub fn node(&self, address: &str) -> NodeStatus {
        self.nodes.get(address).cloned().unwrap_or_default()
    }
}

/// Run repair health checks for entries watching a machine
async fn gather_repair_completion(
    inf: &Infrastructure,
    cluster: &Cluster,
    entries: &[RepairQueueEntry],
) -> BTreeSet<String> {
    let checks = entries
        .iter()
        .filter(|e| e.status == RepairStatus::Processing && e.step_status == RepairStepStatus::Watching)
        .filter_map(|e| {
            let operation = e.get_matched_operation(&cluster.repair).ok()?;
            if operation.health_check_command.is_empty() {
                return None;
            }
            let mut argv = operation.health_check_command.clone();
            argv.push(e.address.clone());
            Some((e.address.clone(), argv, operation.health_check_timeout()))
        })
        .map(|(address, argv, timeout)| async move {
            match inf.run_local(&argv, timeout).await {
                Ok(stdout) => (address, stdout.trim_end() == "true"),
                Err(e) => {
                    warn!("Repair health check for {} failed: {}", address, e);
                    (address, false)
                }
            }
        });

    join_all(checks)
        .await
        .into_iter()
        .filter_map(|(address, done)| done.then_some(address))
        .collect()
}

/// Gather the status of the whole cluster
///
/// Unreachable nodes and unavailable services are reported in the snapshot;
/// only storage failures abort the gather.
///
/// # Errors
///
/// Returns storage errors.
pub async fn gather(
    inf: &Infrastructure,
    cluster: &Cluster,
    resources: &[ResourceDefinition],
) -> Result<ClusterStatus, EngineError> {
    let storage = inf.storage();
    let config_version = storage.get_config_version().await?;

    let reboot_queue = RebootQueueStatus {
        enabled: !storage.is_reboot_queue_disabled().await?,
        entries: storage.get_reboots_entries().await?,
        drain_completed: BTreeSet::new(),
    };
    let repair_entries = storage.get_repairs_entries().await?;
    let repair_queue = RepairQueueStatus {
        enabled: !storage.is_repair_queue_disabled().await?,
        repair_completed: gather_repair_completion(inf, cluster, &repair_entries).await,
        entries: repair_entries,
        drain_completed: BTreeSet::new(),
    };

    let statuses = join_all(cluster.nodes.iter().map(|node| gather_node(inf, cluster, node))).await;
    let nodes: BTreeMap<String, NodeStatus> = cluster
        .nodes
        .iter()
        .map(|n| n.address.clone())
        .zip(statuses)
        .collect();

    let mut status = ClusterStatus {
        config_version,
        nodes,
        etcd: EtcdClusterStatus::default(),
        kubernetes: KubernetesClusterStatus::default(),
        reboot_queue,
        repair_queue,
    };

    status.etcd = gather_etcd(inf, cluster, &status.nodes).await;
    for (address, node) in &mut status.nodes {
        node.etcd.service.is_healthy = node.etcd.service.running && status.etcd.is_in_sync(address);
    }

    gather_kubernetes(inf, cluster, resources, &mut status).await;

    debug!(
        "Gathered status: {} nodes, {} etcd members, control plane ready: {}",
        status.nodes.len(),
        status.etcd.members.len(),
        status.kubernetes.is_control_plane_ready
    );
    Ok(status)
}
