//! Desired cluster document
//!
//! The engine reads a single [`Cluster`] from storage every tick and drives the
//! nodes toward it.

use crate::options::Options;
use crate::reboot::RebootSpec;
use crate::repair::RepairSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired state of the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster name, also used as the etcd cluster token
    pub name: String,

    /// Nodes in declaration order
    pub nodes: Vec<Node>,

    /// Taint control plane nodes with `PreferNoSchedule`
    #[serde(default)]
    pub taint_control_plane: bool,

    /// Service CIDR
    pub service_subnet: String,

    /// Pod CIDR handed to kube-proxy and the controller manager
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_subnet: String,

    /// Upstream DNS servers
    #[serde(default)]
    pub dns_servers: Vec<String>,

    /// `namespace/name` of a Service whose ClusterIPs replace `dns_servers`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_service: Option<String>,

    /// Reboot queue policy
    #[serde(default)]
    pub reboot: RebootSpec,

    /// Repair queue policy
    #[serde(default)]
    pub repair: RepairSpec,

    /// Per-service parameters
    #[serde(default)]
    pub options: Options,

    /// REST mappings used instead of discovery for these kinds
    #[serde(default)]
    pub trusted_rest_mappings: Vec<RestMapping>,
}

impl Cluster {
    /// Control plane nodes in declaration order
    pub fn control_plane(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.control_plane)
    }

    /// Worker nodes in declaration order
    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.control_plane)
    }

    /// Find a node by address
    #[must_use]
    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Find a node by its Kubernetes node name
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.nodename() == name)
    }
}

/// A machine managed by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Stable IP address
    pub address: String,

    /// Host name; the Kubernetes node name when set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// SSH user (falls back to the engine default)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Whether the node runs etcd and the control plane
    #[serde(default)]
    pub control_plane: bool,

    /// Labels set on the Kubernetes Node
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations set on the Kubernetes Node
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Taints set on the Kubernetes Node
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl Node {
    /// Name of the Kubernetes Node object for this machine
    #[must_use]
    pub fn nodename(&self) -> &str {
        if self.hostname.is_empty() {
            &self.address
        } else {
            &self.hostname
        }
    }
}

/// Node taint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key
    pub key: String,

    /// Taint value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    /// Scheduling effect
    pub effect: TaintEffect,
}

/// Effect of a node taint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum TaintEffect {
    /// New pods are not scheduled
    NoSchedule,
    /// The scheduler avoids the node
    PreferNoSchedule,
    /// Running pods without a toleration are evicted
    NoExecute,
}

impl TaintEffect {
    /// Name as used by the Kubernetes API
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        }
    }
}

/// Trusted mapping from a kind to its REST resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestMapping {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Object kind
    pub kind: String,
    /// Plural resource name
    pub resource: String,
    /// Whether objects of this kind live in a namespace
    #[serde(default = "default_true")]
    pub namespaced: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodename_prefers_hostname() {
        let mut node = Node {
            address: "10.0.0.11".to_string(),
            ..Default::default()
        };
        assert_eq!(node.nodename(), "10.0.0.11");

        node.hostname = "cp1".to_string();
        assert_eq!(node.nodename(), "cp1");
    }

    #[test]
    fn test_parse_cluster_document() {
        let doc = r#"{
            "name": "prod",
            "nodes": [
                {"address": "10.0.0.11", "controlPlane": true},
                {"address": "10.0.0.12", "taints": [{"key": "gpu", "effect": "NoSchedule"}]}
            ],
            "serviceSubnet": "10.68.0.0/16"
        }"#;

        let cluster: Cluster = serde_json::from_str(doc).expect("parse");
        assert_eq!(cluster.control_plane().count(), 1);
        assert_eq!(cluster.workers().count(), 1);
        assert_eq!(cluster.nodes[1].taints[0].effect, TaintEffect::NoSchedule);
        assert!(cluster.node("10.0.0.12").is_some());
    }
}
