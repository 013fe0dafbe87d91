//! Queries over the declared cluster and its observed status.
//!
//! Everything here is pure; the strategy combines these queries into
//! operators.

use crate::etcd_admin::EtcdMember;
use crate::k8s::node_is_marked;
use crate::op::k8s::{EndpointAddresses, node_needs_update};
use crate::op::params::{SystemService, etcd_is_outdated};
use crate::status::{ClusterStatus, NodeStatus};
use cluster_spec::{Cluster, Node};
use k8s_openapi::api::core::v1::Node as KubeNode;
use std::collections::BTreeSet;

/// Read-only view over a cluster and its status
#[derive(Debug, Clone, Copy)]
pub struct NodeFilter<'a> {
    cluster: &'a Cluster,
    status: &'a ClusterStatus,
}

impl<'a> NodeFilter<'a> {
    /// View over `cluster` and its `status`
    #[must_use]
    pub fn new(cluster: &'a Cluster, status: &'a ClusterStatus) -> Self {
        Self { cluster, status }
    }

    fn node_status(&self, address: &str) -> Option<&'a NodeStatus> {
        self.status.nodes.get(address)
    }

    /// Whether the node at `address` has an SSH connection
    #[must_use]
    pub fn is_reachable(&self, address: &str) -> bool {
        self.node_status(address).is_some_and(|s| s.ssh_connected)
    }

    /// Control plane nodes
    #[must_use]
    pub fn control_planes(&self) -> Vec<&'a Node> {
        self.cluster.control_plane().collect()
    }

    /// Nodes without an SSH connection
    #[must_use]
    pub fn unreachable_nodes(&self) -> Vec<&'a Node> {
        self.cluster
            .nodes
            .iter()
            .filter(|n| !self.is_reachable(&n.address))
            .collect()
    }

    /// Whether every node in `nodes` is reachable
    #[must_use]
    pub fn all_reachable(&self, nodes: &[&Node]) -> bool {
        nodes.iter().all(|n| self.is_reachable(&n.address))
    }

    fn reachable(self, nodes: impl Iterator<Item = &'a Node>) -> impl Iterator<Item = &'a Node> {
        nodes.filter(move |n| self.is_reachable(&n.address))
    }

    /// Nodes a service belongs on
    fn service_nodes(&self, service: SystemService) -> Vec<&'a Node> {
        match service {
            SystemService::Rivers | SystemService::Kubelet | SystemService::Proxy => {
                self.reachable(self.cluster.nodes.iter()).collect()
            }
            SystemService::EtcdRivers => self.reachable(self.cluster.control_plane()).collect(),
            SystemService::ApiServer | SystemService::ControllerManager | SystemService::Scheduler => self
                .reachable(self.cluster.control_plane())
                .filter(|n| self.node_status(&n.address).is_some_and(|s| s.etcd.is_added_member))
                .collect(),
        }
    }

    /// Reachable nodes where `service` should run but does not
    #[must_use]
    pub fn service_stopped_nodes(&self, service: SystemService) -> Vec<Node> {
        self.service_nodes(service)
            .into_iter()
            .filter(|n| {
                self.node_status(&n.address)
                    .is_some_and(|s| !service.status(s).running)
            })
            .cloned()
            .collect()
    }

    /// Reachable nodes where `service` runs with another image or parameters
    #[must_use]
    pub fn service_outdated_nodes(&self, service: SystemService) -> Vec<Node> {
        self.service_nodes(service)
            .into_iter()
            .filter(|n| {
                self.node_status(&n.address).is_some_and(|s| {
                    service.status(s).running && service.is_outdated(self.cluster, n, s)
                })
            })
            .cloned()
            .collect()
    }

    /// Whether any control plane keeps etcd data
    #[must_use]
    pub fn etcd_bootstrapped(&self) -> bool {
        self.cluster
            .control_plane()
            .any(|n| self.node_status(&n.address).is_some_and(|s| s.etcd.has_data))
    }

    /// Reachable control planes whose marked member is stopped with its data
    #[must_use]
    pub fn etcd_stopped_members(&self) -> Vec<Node> {
        self.reachable(self.cluster.control_plane())
            .filter(|n| {
                self.node_status(&n.address).is_some_and(|s| {
                    !s.etcd.service.running && s.etcd.has_data && s.etcd.is_added_member
                })
            })
            .cloned()
            .collect()
    }

    fn members(&self) -> impl Iterator<Item = (&'a String, &'a EtcdMember)> {
        self.status.etcd.members.iter()
    }

    fn member_ids(members: Vec<(&String, &EtcdMember)>) -> Vec<(String, u64)> {
        members
            .into_iter()
            .map(|(name, m)| (name.clone(), m.id))
            .collect()
    }

    /// Members on addresses absent from the cluster, filtered by sync state
    #[must_use]
    pub fn etcd_non_cluster_members(&self, in_sync: bool) -> Vec<(String, u64)> {
        Self::member_ids(
            self.members()
                .filter(|(name, _)| self.cluster.node(name).is_none())
                .filter(|(name, _)| self.status.etcd.is_in_sync(name) == in_sync)
                .collect(),
        )
    }

    /// Members on nodes declared as workers, filtered by sync state
    #[must_use]
    pub fn etcd_worker_members(&self, in_sync: bool) -> Vec<(String, u64)> {
        Self::member_ids(
            self.members()
                .filter(|(name, _)| self.cluster.node(name).is_some_and(|n| !n.control_plane))
                .filter(|(name, _)| self.status.etcd.is_in_sync(name) == in_sync)
                .collect(),
        )
    }

    /// Control planes whose member was added but never started
    #[must_use]
    pub fn etcd_unstarted_members(&self) -> Vec<Node> {
        self.reachable(self.cluster.control_plane())
            .filter(|n| {
                self.status
                    .etcd
                    .members
                    .get(&n.address)
                    .is_some_and(|m| m.name.is_empty())
            })
            .cloned()
            .collect()
    }

    /// Control planes with an in-sync member that is not yet marked
    #[must_use]
    pub fn etcd_unmarked_members(&self) -> Vec<String> {
        self.reachable(self.cluster.control_plane())
            .filter(|n| self.status.etcd.is_in_sync(&n.address))
            .filter(|n| self.node_status(&n.address).is_some_and(|s| !s.etcd.is_added_member))
            .map(|n| n.address.clone())
            .collect()
    }

    /// Reachable control planes not yet members
    #[must_use]
    pub fn etcd_new_members(&self) -> Vec<Node> {
        self.reachable(self.cluster.control_plane())
            .filter(|n| !self.status.etcd.members.contains_key(&n.address))
            .cloned()
            .collect()
    }

    /// Running control plane members whose container drifted
    #[must_use]
    pub fn etcd_outdated_members(&self) -> Vec<Node> {
        self.reachable(self.cluster.control_plane())
            .filter(|n| {
                self.node_status(&n.address).is_some_and(|s| {
                    s.etcd.service.running && etcd_is_outdated(self.cluster, n, s)
                })
            })
            .cloned()
            .collect()
    }

    /// First control plane whose API server answers
    #[must_use]
    pub fn healthy_api_server(&self) -> Option<&'a Node> {
        self.cluster
            .control_plane()
            .find(|n| self.node_status(&n.address).is_some_and(|s| s.api_server.is_healthy))
    }

    fn split_held(addresses: Vec<String>, held: &BTreeSet<String>) -> EndpointAddresses {
        let (not_ready, ready) = addresses.into_iter().partition(|a| held.contains(a));
        EndpointAddresses { ready, not_ready }
    }

    /// Healthy API servers; held nodes are listed as not ready
    #[must_use]
    pub fn master_endpoint_addresses(&self, held: &BTreeSet<String>) -> EndpointAddresses {
        let healthy = self
            .cluster
            .control_plane()
            .filter(|n| self.node_status(&n.address).is_some_and(|s| s.api_server.is_healthy))
            .map(|n| n.address.clone())
            .collect();
        Self::split_held(healthy, held)
    }

    /// Healthy etcd members; held nodes are listed as not ready
    #[must_use]
    pub fn etcd_endpoint_addresses(&self, held: &BTreeSet<String>) -> EndpointAddresses {
        let healthy = self
            .cluster
            .control_plane()
            .filter(|n| self.node_status(&n.address).is_some_and(|s| s.etcd.service.is_healthy))
            .map(|n| n.address.clone())
            .collect();
        Self::split_held(healthy, held)
    }

    /// Kubernetes Nodes whose labels, annotations or taints drifted
    #[must_use]
    pub fn outdated_kube_nodes(&self) -> Vec<(&'a Node, &'a KubeNode)> {
        self.cluster
            .nodes
            .iter()
            .filter_map(|n| self.status.kubernetes.node(n.nodename()).map(|k| (n, k)))
            .filter(|(n, k)| node_needs_update(self.cluster, n, k))
            .collect()
    }

    /// Kubernetes Nodes of machines absent from the cluster
    #[must_use]
    pub fn non_cluster_kube_nodes(&self) -> Vec<String> {
        self.status
            .kubernetes
            .nodes
            .iter()
            .filter_map(|k| k.metadata.name.clone())
            .filter(|name| self.cluster.node_by_name(name).is_none())
            .collect()
    }

    /// Reachable workers still running control plane containers
    #[must_use]
    pub fn demoted_control_planes(&self) -> Vec<String> {
        self.cluster
            .workers()
            .filter(|n| {
                self.node_status(&n.address)
                    .is_some_and(|s| s.ssh_connected && s.runs_control_plane())
            })
            .map(|n| n.address.clone())
            .collect()
    }

    /// Nodes cordoned by the engine whose address is not in `held`
    #[must_use]
    pub fn cordoned_nodes(&self, held: &BTreeSet<String>) -> Vec<String> {
        self.status
            .kubernetes
            .nodes
            .iter()
            .filter(|k| node_is_marked(k))
            .filter_map(|k| k.metadata.name.clone())
            .filter(|name| {
                let address = self
                    .cluster
                    .node_by_name(name)
                    .map_or(name.as_str(), |n| n.address.as_str());
                !held.contains(address)
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "nodefilter_test.rs"]
mod nodefilter_test;
