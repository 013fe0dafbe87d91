//! Cluster and status builders shared by the decision tests.

use crate::etcd_admin::EtcdMember;
use crate::op::dns::{cluster_dns_config_map, node_dns_config_map, upstream_servers};
use crate::op::k8s::{
    EndpointAddresses, desired_node, etcd_endpoint_slice, etcd_endpoints, etcd_service,
    master_endpoint_slice, master_endpoints,
};
use crate::op::params::{SystemService, desired_kubelet_config, etcd_params};
use crate::static_resources::static_resources;
use crate::status::{
    ClusterDnsStatus, ClusterStatus, EtcdClusterStatus, EtcdStatus, KubeletStatus,
    KubernetesClusterStatus, NodeDnsStatus, NodeStatus, RebootQueueStatus, RepairQueueStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use cluster_spec::images::ETCD_IMAGE;
use cluster_spec::names::{ANNOTATION_REVISION, CONFIG_VERSION};
use cluster_spec::{
    Cluster, Node, RebootSpec, RepairOperation, RepairProcedure, RepairSpec, RepairStep,
    ResourceDefinition, ResourceStatus,
};
use k8s_openapi::api::core::v1::{Node as KubeNode, NodeCondition, NodeStatus as KubeNodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use node_agent::ServiceStatus;
use async_trait::async_trait;
use futures::StreamExt;
use kv_store::{Compare, KeyValue, KvClient, KvError, MockKv, TxnOp, WatchStream};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

pub(crate) const CLUSTER_DNS_IP: &str = "10.68.0.10";

/// Address of the n-th node, counting from 1
pub(crate) fn address(n: usize) -> String {
    format!("10.0.0.{}", 10 + n)
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn repair_spec() -> RepairSpec {
    RepairSpec {
        repair_procedures: vec![RepairProcedure {
            machine_types: vec!["type1".to_string()],
            repair_operations: vec![RepairOperation {
                operation: "op1".to_string(),
                repair_steps: vec![
                    RepairStep {
                        repair_command: vec!["touch".to_string(), "/tmp/repair-done".to_string()],
                        need_drain: true,
                        watch_seconds: 300,
                        ..Default::default()
                    },
                    RepairStep {
                        repair_command: vec!["power-cycle".to_string()],
                        watch_seconds: 600,
                        ..Default::default()
                    },
                ],
                health_check_command: vec!["check-repair".to_string()],
                command_timeout_seconds: None,
            }],
        }],
        ..Default::default()
    }
}

/// `cps` control planes followed by `workers` workers named node1, node2, ...
pub(crate) fn cluster(cps: usize, workers: usize) -> Cluster {
    let nodes = (1..=cps + workers)
        .map(|n| Node {
            address: address(n),
            hostname: format!("node{n}"),
            control_plane: n <= cps,
            ..Default::default()
        })
        .collect();
    Cluster {
        name: "prod".to_string(),
        nodes,
        service_subnet: "10.68.0.0/16".to_string(),
        dns_servers: vec!["8.8.8.8".to_string()],
        reboot: RebootSpec {
            reboot_command: vec!["reboot-node".to_string()],
            boot_check_command: vec!["check-boot".to_string()],
            ..Default::default()
        },
        repair: repair_spec(),
        ..Default::default()
    }
}

/// A running, healthy container started with today's parameters
pub(crate) fn running(cluster: &Cluster, service: SystemService, node: &Node) -> ServiceStatus {
    ServiceStatus {
        running: true,
        image: service.image().to_string(),
        builtin_params: service.builtin_params(cluster, node),
        extra_params: service.extra_params(cluster),
        is_healthy: true,
    }
}

pub(crate) fn running_etcd(cluster: &Cluster, node: &Node) -> EtcdStatus {
    EtcdStatus {
        service: ServiceStatus {
            running: true,
            image: ETCD_IMAGE.to_string(),
            builtin_params: etcd_params(cluster, node, &[], "new"),
            extra_params: cluster.options.etcd.service.clone(),
            is_healthy: true,
        },
        has_data: true,
        is_added_member: true,
    }
}

/// Reachable node with nothing running
pub(crate) fn bare_node() -> NodeStatus {
    NodeStatus {
        ssh_connected: true,
        ..Default::default()
    }
}

/// Reachable node running everything it should
pub(crate) fn steady_node(cluster: &Cluster, node: &Node) -> NodeStatus {
    let mut status = NodeStatus {
        ssh_connected: true,
        rivers: running(cluster, SystemService::Rivers, node),
        proxy: running(cluster, SystemService::Proxy, node),
        kubelet: KubeletStatus {
            service: running(cluster, SystemService::Kubelet, node),
            config: Some(desired_kubelet_config(cluster)),
        },
        ..Default::default()
    };
    if node.control_plane {
        status.etcd_rivers = running(cluster, SystemService::EtcdRivers, node);
        status.etcd = running_etcd(cluster, node);
        status.api_server = running(cluster, SystemService::ApiServer, node);
        status.controller_manager = running(cluster, SystemService::ControllerManager, node);
        status.scheduler = running(cluster, SystemService::Scheduler, node);
    }
    status
}

pub(crate) fn member(id: u64, address: &str) -> EtcdMember {
    EtcdMember {
        id,
        name: address.to_string(),
        peer_urls: vec![format!("https://{address}:2380")],
        client_urls: vec![format!("https://{address}:2379")],
    }
}

/// Healthy etcd whose members are exactly the declared control planes
pub(crate) fn etcd_of(cluster: &Cluster) -> EtcdClusterStatus {
    let mut etcd = EtcdClusterStatus {
        is_healthy: true,
        ..Default::default()
    };
    for (i, node) in cluster.control_plane().enumerate() {
        etcd.members.insert(node.address.clone(), member(i as u64 + 1, &node.address));
        etcd.in_sync_members.insert(node.address.clone(), true);
    }
    etcd
}

/// Kubernetes Node registered with its declared attributes and Ready
pub(crate) fn kube_node(cluster: &Cluster, node: &Node) -> KubeNode {
    let registered = KubeNode {
        metadata: ObjectMeta {
            name: Some(node.nodename().to_string()),
            ..Default::default()
        },
        status: Some(KubeNodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    desired_node(cluster, node, &registered)
}

pub(crate) fn applied(resources: &[ResourceDefinition]) -> Vec<(String, ResourceStatus)> {
    resources
        .iter()
        .map(|r| {
            let status = ResourceStatus {
                annotations: BTreeMap::from([(ANNOTATION_REVISION.to_string(), r.revision.to_string())]),
                has_been_ssa: true,
            };
            (r.key.clone(), status)
        })
        .collect()
}

/// Kubernetes objects as the engine leaves them once converged
pub(crate) fn steady_kubernetes(cluster: &Cluster) -> KubernetesClusterStatus {
    let domain = &cluster.options.kubelet.domain;
    let upstreams = upstream_servers(&cluster.dns_servers, None);
    let cps = EndpointAddresses {
        ready: cluster.control_plane().map(|n| n.address.clone()).collect(),
        not_ready: Vec::new(),
    };
    KubernetesClusterStatus {
        is_control_plane_ready: true,
        nodes: cluster.nodes.iter().map(|n| kube_node(cluster, n)).collect(),
        dns_service: None,
        cluster_dns: ClusterDnsStatus {
            config_map: Some(cluster_dns_config_map(domain, &upstreams)),
            cluster_ip: CLUSTER_DNS_IP.to_string(),
        },
        node_dns: NodeDnsStatus {
            config_map: Some(node_dns_config_map(domain, CLUSTER_DNS_IP, &upstreams)),
        },
        master_endpoints: Some(master_endpoints(&cps)),
        master_endpoint_slice: Some(master_endpoint_slice(&cps)),
        etcd_service: Some(etcd_service()),
        etcd_endpoints: Some(etcd_endpoints(&cps)),
        etcd_endpoint_slice: Some(etcd_endpoint_slice(&cps)),
        resource_statuses: applied(&static_resources().unwrap()).into_iter().collect(),
    }
}

/// A converged cluster with empty queues
pub(crate) fn steady_status(cluster: &Cluster) -> ClusterStatus {
    ClusterStatus {
        config_version: CONFIG_VERSION.to_string(),
        nodes: cluster
            .nodes
            .iter()
            .map(|n| (n.address.clone(), steady_node(cluster, n)))
            .collect(),
        etcd: etcd_of(cluster),
        kubernetes: steady_kubernetes(cluster),
        reboot_queue: RebootQueueStatus {
            enabled: true,
            ..Default::default()
        },
        repair_queue: RepairQueueStatus {
            enabled: true,
            ..Default::default()
        },
    }
}

/// Every node reachable, nothing running, no Kubernetes
pub(crate) fn cold_status(cluster: &Cluster) -> ClusterStatus {
    ClusterStatus {
        config_version: CONFIG_VERSION.to_string(),
        nodes: cluster
            .nodes
            .iter()
            .map(|n| (n.address.clone(), bare_node()))
            .collect(),
        reboot_queue: RebootQueueStatus {
            enabled: true,
            ..Default::default()
        },
        repair_queue: RepairQueueStatus {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn set(addresses: &[&str]) -> BTreeSet<String> {
    addresses.iter().map(ToString::to_string).collect()
}

/// In-memory store whose first `closing` watches end right away
pub(crate) struct ClosingWatch {
    inner: MockKv,
    closing: usize,
    pub(crate) watches: AtomicUsize,
}

impl ClosingWatch {
    pub(crate) fn new(closing: usize) -> Self {
        Self {
            inner: MockKv::new(),
            closing,
            watches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KvClient for ClosingWatch {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.delete(key).await
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, KvError> {
        self.inner.txn(compares, ops).await
    }

    async fn revision(&self) -> Result<i64, KvError> {
        self.inner.revision().await
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, KvError> {
        if self.watches.fetch_add(1, Ordering::SeqCst) < self.closing {
            return Ok(futures::stream::empty().boxed());
        }
        self.inner.watch(prefix, start_revision).await
    }

    async fn grant_lease(&self, ttl_seconds: i64) -> Result<i64, KvError> {
        self.inner.grant_lease(ttl_seconds).await
    }

    async fn keep_alive(&self, lease: i64, cancel: CancellationToken) -> Result<(), KvError> {
        self.inner.keep_alive(lease, cancel).await
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError> {
        self.inner.revoke_lease(lease).await
    }

    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String, KvError> {
        self.inner.campaign(election, value, lease).await
    }
}
