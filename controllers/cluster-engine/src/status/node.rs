use super::{EtcdStatus, KubeletStatus, NodeStatus};
use crate::infrastructure::Infrastructure;
use cluster_spec::names::{
    APISERVER_CONTAINER, ALL_CONTAINERS, CONTROLLER_MANAGER_CONTAINER, CONTROLLER_MANAGER_HEALTH_PORT,
    ETCD_CONTAINER, ETCD_RIVERS_CONTAINER, KUBELET_CONFIG_PATH, KUBELET_CONTAINER, KUBELET_HEALTH_PORT,
    PROXY_CONTAINER, RIVERS_CONTAINER, SCHEDULER_CONTAINER, SCHEDULER_HEALTH_PORT,
};
use cluster_spec::{Cluster, Node};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use node_agent::ServiceStatus;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Kubelet settings that require a restart when changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeletConfig {
    /// Cluster domain
    pub domain: String,
    /// Whether the kubelet tolerates swap
    pub allow_swap: bool,
    /// Rotation size of container logs
    pub container_log_max_size: String,
    /// Rotated container logs kept
    pub container_log_max_files: i32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    #[serde(default)]
    cluster_domain: String,
    #[serde(default = "default_fail_swap_on")]
    fail_swap_on: bool,
    #[serde(default)]
    container_log_max_size: String,
    #[serde(default)]
    container_log_max_files: i32,
}

fn default_fail_swap_on() -> bool {
    true
}

/// Read the settings back from a kubelet configuration file
#[must_use]
pub fn parse_kubelet_config(yaml: &str) -> Option<KubeletConfig> {
    let doc: KubeletConfiguration = match serde_yaml::from_str(yaml) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("Unreadable kubelet configuration: {}", e);
            return None;
        }
    };
    Some(KubeletConfig {
        domain: doc.cluster_domain,
        allow_swap: !doc.fail_swap_on,
        container_log_max_size: doc.container_log_max_size,
        container_log_max_files: doc.container_log_max_files,
    })
}

async fn http_ok(inf: &Infrastructure, url: &str) -> bool {
    match inf.http().get(url).send().await {
        Ok(resp) if resp.status().is_success() => resp
            .text()
            .await
            .is_ok_and(|body| body.trim() == "ok"),
        Ok(resp) => {
            debug!("Health check {} returned {}", url, resp.status());
            false
        }
        Err(e) => {
            debug!("Health check {} failed: {}", url, e);
            false
        }
    }
}

async fn api_server_ok(inf: &Infrastructure, node: &Node) -> bool {
    let client = match inf.kube(node).await {
        Ok(client) => client,
        Err(e) => {
            debug!("No API client for {}: {}", node.address, e);
            return false;
        }
    };
    let namespaces: Api<Namespace> = Api::all(client);
    namespaces.list(&ListParams::default().limit(1)).await.is_ok()
}

fn take(containers: &mut HashMap<String, ServiceStatus>, name: &str) -> ServiceStatus {
    containers.remove(name).unwrap_or_default()
}

/// Inspect the containers, volumes and health endpoints of one node
///
/// An unreachable node yields a status with `ssh_connected == false`.
pub async fn gather_node(inf: &Infrastructure, cluster: &Cluster, node: &Node) -> NodeStatus {
    let (Some(agent), Ok(engine)) = (inf.agent(&node.address), inf.engine(&node.address)) else {
        return NodeStatus::default();
    };

    let mut containers = match engine.inspect(&ALL_CONTAINERS).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!("Failed to inspect containers on {}: {}", node.address, e);
            return NodeStatus::default();
        }
    };

    let etcd_params = &cluster.options.etcd;
    let has_data = engine
        .volume_exists(&etcd_params.volume_name)
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to check etcd volume on {}: {}", node.address, e);
            false
        });
    let is_added_member = has_data
        && engine
            .volume_exists(&etcd_params.marker_volume())
            .await
            .unwrap_or(false);

    let kubelet_config = match agent
        .run(&format!("cat {KUBELET_CONFIG_PATH} 2>/dev/null || true"))
        .await
    {
        Ok(content) if !content.trim().is_empty() => parse_kubelet_config(&content),
        Ok(_) => None,
        Err(e) => {
            warn!("Failed to read kubelet configuration on {}: {}", node.address, e);
            None
        }
    };

    let mut status = NodeStatus {
        ssh_connected: true,
        rivers: take(&mut containers, RIVERS_CONTAINER),
        etcd_rivers: take(&mut containers, ETCD_RIVERS_CONTAINER),
        etcd: EtcdStatus {
            service: take(&mut containers, ETCD_CONTAINER),
            has_data,
            is_added_member,
        },
        api_server: take(&mut containers, APISERVER_CONTAINER),
        controller_manager: take(&mut containers, CONTROLLER_MANAGER_CONTAINER),
        scheduler: take(&mut containers, SCHEDULER_CONTAINER),
        proxy: take(&mut containers, PROXY_CONTAINER),
        kubelet: KubeletStatus {
            service: take(&mut containers, KUBELET_CONTAINER),
            config: kubelet_config,
        },
    };

    let address = &node.address;
    status.rivers.is_healthy = status.rivers.running;
    status.etcd_rivers.is_healthy = status.etcd_rivers.running;
    status.proxy.is_healthy = status.proxy.running;
    if status.api_server.running {
        status.api_server.is_healthy = api_server_ok(inf, node).await;
    }
    if status.controller_manager.running {
        status.controller_manager.is_healthy = http_ok(
            inf,
            &format!("https://{address}:{CONTROLLER_MANAGER_HEALTH_PORT}/healthz"),
        )
        .await;
    }
    if status.scheduler.running {
        status.scheduler.is_healthy =
            http_ok(inf, &format!("http://{address}:{SCHEDULER_HEALTH_PORT}/healthz")).await;
    }
    if status.kubelet.service.running {
        status.kubelet.service.is_healthy =
            http_ok(inf, &format!("http://{address}:{KUBELET_HEALTH_PORT}/healthz")).await;
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::tests::{MockConnector, mock_infrastructure};
    use cluster_spec::ServiceParams;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn cluster() -> Cluster {
        Cluster {
            name: "test".to_string(),
            nodes: vec![
                Node {
                    address: "10.0.0.11".to_string(),
                    control_plane: true,
                    ..Default::default()
                },
                Node {
                    address: "10.0.0.14".to_string(),
                    ..Default::default()
                },
            ],
            service_subnet: "10.68.0.0/16".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_kubelet_config() {
        let yaml = "apiVersion: kubelet.config.k8s.io/v1beta1\n\
                    kind: KubeletConfiguration\n\
                    clusterDomain: cluster.local\n\
                    failSwapOn: false\n\
                    containerLogMaxSize: 10Mi\n\
                    containerLogMaxFiles: 5\n";
        let config = parse_kubelet_config(yaml).unwrap();
        assert_eq!(config.domain, "cluster.local");
        assert!(config.allow_swap);
        assert_eq!(config.container_log_max_files, 5);

        assert!(parse_kubelet_config("clusterDomain: [").is_none());
    }

    #[tokio::test]
    async fn test_gather_node_reads_containers_and_volumes() {
        let connector = Arc::new(MockConnector::default());
        let engine = connector.engine_for("10.0.0.11");
        engine.add_container(ETCD_CONTAINER, "etcd:1", ServiceParams::default(), ServiceParams::default(), true);
        engine.add_container(RIVERS_CONTAINER, "tools:1", ServiceParams::default(), ServiceParams::default(), false);
        engine.add_volume("etcd-clusterops");
        engine.add_volume("etcd-clusterops-member");

        let cluster = cluster();
        let (inf, _) = mock_infrastructure(&cluster, connector).await;
        let status = gather_node(&inf, &cluster, &cluster.nodes[0]).await;

        assert!(status.ssh_connected);
        assert!(status.etcd.service.running);
        assert!(status.etcd.has_data);
        assert!(status.etcd.is_added_member);
        assert!(!status.rivers.running);
        assert!(!status.rivers.is_healthy);
        assert!(!status.api_server.running);
        assert!(status.kubelet.config.is_none());
    }

    #[tokio::test]
    async fn test_gather_unreachable_node() {
        let connector = Arc::new(MockConnector {
            unreachable: HashSet::from(["10.0.0.14".to_string()]),
            ..Default::default()
        });
        let cluster = cluster();
        let (inf, _) = mock_infrastructure(&cluster, connector).await;

        let status = gather_node(&inf, &cluster, &cluster.nodes[1]).await;
        assert_eq!(status, NodeStatus::default());
    }
}
