//! Kubernetes objects the engine always keeps applied.
//!
//! Cluster DNS (CoreDNS) and node DNS (unbound) workloads plus their RBAC.
//! Their configuration lives in the ConfigMaps reconciled by `op::dns`.

use crate::error::EngineError;
use crate::op::dns::CLUSTER_DNS_PORT;
use cluster_spec::images::{COREDNS_IMAGE, UNBOUND_IMAGE};
use cluster_spec::names::{
    CLUSTER_DNS_CONFIG_KEY, CLUSTER_DNS_NAME, CLUSTER_DNS_NAMESPACE, DOMAIN_PREFIX,
    NODE_DNS_CONFIG_KEY, NODE_DNS_NAME,
};
use cluster_spec::ResourceDefinition;
use serde_json::{Value, json};

/// Revision of every static resource; bump when a definition changes
pub const STATIC_REVISION: i64 = 1;

fn app_label(name: &str) -> Value {
    json!({ "app.kubernetes.io/name": name })
}

fn cluster_dns() -> Vec<Value> {
    let labels = app_label(CLUSTER_DNS_NAME);
    vec![
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": CLUSTER_DNS_NAME, "namespace": CLUSTER_DNS_NAMESPACE},
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": format!("system:{CLUSTER_DNS_NAME}")},
            "rules": [
                {
                    "apiGroups": [""],
                    "resources": ["endpoints", "services", "pods", "namespaces"],
                    "verbs": ["list", "watch"],
                },
                {
                    "apiGroups": ["discovery.k8s.io"],
                    "resources": ["endpointslices"],
                    "verbs": ["list", "watch"],
                },
            ],
        }),
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": format!("system:{CLUSTER_DNS_NAME}")},
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": format!("system:{CLUSTER_DNS_NAME}"),
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": CLUSTER_DNS_NAME,
                "namespace": CLUSTER_DNS_NAMESPACE,
            }],
        }),
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": CLUSTER_DNS_NAME, "namespace": CLUSTER_DNS_NAMESPACE},
            "spec": {
                "selector": labels,
                "ports": [
                    {"name": "dns", "port": 53, "protocol": "UDP", "targetPort": CLUSTER_DNS_PORT},
                    {"name": "dns-tcp", "port": 53, "protocol": "TCP", "targetPort": CLUSTER_DNS_PORT},
                ],
            },
        }),
        json!({
            "apiVersion": "policy/v1",
            "kind": "PodDisruptionBudget",
            "metadata": {"name": CLUSTER_DNS_NAME, "namespace": CLUSTER_DNS_NAMESPACE},
            "spec": {"maxUnavailable": 1, "selector": {"matchLabels": labels}},
        }),
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": CLUSTER_DNS_NAME, "namespace": CLUSTER_DNS_NAMESPACE},
            "spec": {
                "replicas": 2,
                "selector": {"matchLabels": labels},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "serviceAccountName": CLUSTER_DNS_NAME,
                        "priorityClassName": "system-cluster-critical",
                        "containers": [{
                            "name": "coredns",
                            "image": COREDNS_IMAGE,
                            "args": ["-conf", format!("/etc/coredns/{CLUSTER_DNS_CONFIG_KEY}")],
                            "ports": [
                                {"name": "dns", "containerPort": CLUSTER_DNS_PORT, "protocol": "UDP"},
                                {"name": "dns-tcp", "containerPort": CLUSTER_DNS_PORT, "protocol": "TCP"},
                            ],
                            "readinessProbe": {"httpGet": {"path": "/health", "port": 8080}},
                            "volumeMounts": [{"name": "config", "mountPath": "/etc/coredns", "readOnly": true}],
                        }],
                        "volumes": [{
                            "name": "config",
                            "configMap": {"name": CLUSTER_DNS_NAME},
                        }],
                    },
                },
            },
        }),
    ]
}

fn node_dns() -> Vec<Value> {
    let labels = app_label(NODE_DNS_NAME);
    vec![
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": NODE_DNS_NAME, "namespace": CLUSTER_DNS_NAMESPACE},
        }),
        json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {
                "name": NODE_DNS_NAME,
                "namespace": CLUSTER_DNS_NAMESPACE,
                "annotations": {format!("{DOMAIN_PREFIX}managed"): "true"},
            },
            "spec": {
                "selector": {"matchLabels": labels},
                "updateStrategy": {"type": "RollingUpdate"},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "serviceAccountName": NODE_DNS_NAME,
                        "priorityClassName": "system-node-critical",
                        "hostNetwork": true,
                        "tolerations": [{"operator": "Exists"}],
                        "containers": [{
                            "name": "unbound",
                            "image": UNBOUND_IMAGE,
                            "args": ["-c", format!("/etc/unbound/{NODE_DNS_CONFIG_KEY}")],
                            "volumeMounts": [{"name": "config", "mountPath": "/etc/unbound", "readOnly": true}],
                        }],
                        "volumes": [{
                            "name": "config",
                            "configMap": {"name": NODE_DNS_NAME},
                        }],
                    },
                },
            },
        }),
    ]
}

/// Static resource definitions in apply order
///
/// # Errors
///
/// Fails only if a built-in definition is malformed.
pub fn static_resources() -> Result<Vec<ResourceDefinition>, EngineError> {
    let mut resources = cluster_dns()
        .into_iter()
        .chain(node_dns())
        .map(|value| -> Result<ResourceDefinition, EngineError> {
            let bytes = serde_json::to_vec(&value)?;
            Ok(ResourceDefinition::parse(&bytes, STATIC_REVISION)?)
        })
        .collect::<Result<Vec<_>, _>>()?;
    cluster_spec::sort_resources(&mut resources);
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resources_parse_in_order() {
        let resources = static_resources().expect("static resources");
        let keys: Vec<&str> = resources.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "/resource/ServiceAccount/kube-system/cluster-dns",
                "/resource/ServiceAccount/kube-system/node-dns",
                "/resource/ClusterRole/system:cluster-dns",
                "/resource/ClusterRoleBinding/system:cluster-dns",
                "/resource/Service/kube-system/cluster-dns",
                "/resource/PodDisruptionBudget/kube-system/cluster-dns",
                "/resource/DaemonSet/kube-system/node-dns",
                "/resource/Deployment/kube-system/cluster-dns",
            ]
        );
        assert!(resources.iter().all(|r| r.revision == STATIC_REVISION));
    }
}
