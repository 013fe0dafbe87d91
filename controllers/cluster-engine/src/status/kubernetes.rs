use super::{ClusterStatus, KubernetesClusterStatus};
use crate::infrastructure::Infrastructure;
use crate::k8s::{self, Mapper};
use cluster_spec::names::{
    CLUSTER_DNS_NAME, CLUSTER_DNS_NAMESPACE, ETCD_SERVICE_NAME, ETCD_SERVICE_NAMESPACE, NODE_DNS_NAME,
};
use cluster_spec::{Cluster, RebootStatus, RepairStatus, RepairStepStatus, ResourceDefinition, ResourceStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams};
use std::collections::HashMap;
use tracing::{debug, warn};

async fn gather_resources(
    client: &kube::Client,
    cluster: &Cluster,
    resources: &[ResourceDefinition],
) -> Result<HashMap<String, ResourceStatus>, kube::Error> {
    let mapper = Mapper::new(client, &cluster.trusted_rest_mappings).await;
    let mut statuses = HashMap::new();
    for res in resources {
        let Some((resource, namespaced)) = mapper.resolve(&res.api_version, &res.kind) else {
            warn!("No REST mapping for {} {}, skipping", res.api_version, res.kind);
            continue;
        };
        let api = k8s::dynamic_api(client, &resource, namespaced, &res.namespace);
        if let Some(obj) = api.get_opt(&res.name).await? {
            statuses.insert(
                res.key.clone(),
                ResourceStatus {
                    annotations: obj.metadata.annotations.clone().unwrap_or_default(),
                    has_been_ssa: k8s::has_been_applied(&obj.metadata),
                },
            );
        }
    }
    Ok(statuses)
}

async fn drain_complete(client: &kube::Client, nodename: &str) -> bool {
    match k8s::pods_on_node(client, nodename).await {
        Ok(pods) => k8s::is_drain_complete(&pods),
        Err(e) => {
            warn!("Failed to list pods on {}: {}", nodename, e);
            false
        }
    }
}

/// Read the cluster-level objects the strategy maintains
///
/// Absent objects come back as `None`; any other API failure fails the
/// whole observation so that a transient error never looks like a missing
/// object.
pub(crate) async fn observe(
    client: &kube::Client,
    cluster: &Cluster,
    resources: &[ResourceDefinition],
) -> Result<KubernetesClusterStatus, kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let mut ks = KubernetesClusterStatus {
        is_control_plane_ready: namespaces.get_opt("kube-system").await?.is_some(),
        ..Default::default()
    };

    let nodes: Api<Node> = Api::all(client.clone());
    ks.nodes = nodes.list(&ListParams::default()).await?.items;

    if let Some((ns, name)) = cluster.dns_service.as_deref().and_then(|s| s.split_once('/')) {
        let services: Api<Service> = Api::namespaced(client.clone(), ns);
        ks.dns_service = services.get_opt(name).await?;
    }

    let dns_config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), CLUSTER_DNS_NAMESPACE);
    ks.cluster_dns.config_map = dns_config_maps.get_opt(CLUSTER_DNS_NAME).await?;
    ks.node_dns.config_map = dns_config_maps.get_opt(NODE_DNS_NAME).await?;
    let dns_services: Api<Service> = Api::namespaced(client.clone(), CLUSTER_DNS_NAMESPACE);
    ks.cluster_dns.cluster_ip = dns_services
        .get_opt(CLUSTER_DNS_NAME)
        .await?
        .and_then(|svc| svc.spec)
        .and_then(|spec| spec.cluster_ip)
        .unwrap_or_default();

    let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), "default");
    let slices: Api<EndpointSlice> = Api::namespaced(client.clone(), "default");
    ks.master_endpoints = endpoints.get_opt("kubernetes").await?;
    ks.master_endpoint_slice = slices.get_opt("kubernetes").await?;

    let services: Api<Service> = Api::namespaced(client.clone(), ETCD_SERVICE_NAMESPACE);
    let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), ETCD_SERVICE_NAMESPACE);
    let slices: Api<EndpointSlice> = Api::namespaced(client.clone(), ETCD_SERVICE_NAMESPACE);
    ks.etcd_service = services.get_opt(ETCD_SERVICE_NAME).await?;
    ks.etcd_endpoints = endpoints.get_opt(ETCD_SERVICE_NAME).await?;
    ks.etcd_endpoint_slice = slices.get_opt(ETCD_SERVICE_NAME).await?;

    if ks.is_control_plane_ready {
        ks.resource_statuses = gather_resources(client, cluster, resources).await?;
    }
    Ok(ks)
}

/// Observe the managed Kubernetes cluster through a healthy API server
///
/// Also fills in drain completion of the reboot and repair queues, which
/// is why it takes the partially built snapshot. When the API server
/// answers with errors, the Kubernetes part stays empty and not ready, so
/// the pass only waits for Kubernetes.
pub async fn gather_kubernetes(
    inf: &Infrastructure,
    cluster: &Cluster,
    resources: &[ResourceDefinition],
    status: &mut ClusterStatus,
) {
    let Some(api_server) = cluster
        .control_plane()
        .find(|n| status.nodes.get(&n.address).is_some_and(|s| s.api_server.is_healthy))
    else {
        debug!("No healthy API server, skipping Kubernetes status");
        return;
    };
    let client = match inf.kube(api_server).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to create Kubernetes client for {}: {}", api_server.address, e);
            return;
        }
    };

    match observe(&client, cluster, resources).await {
        Ok(ks) => status.kubernetes = ks,
        Err(e) => warn!(
            "Failed to read Kubernetes through {}: {}; skipping Kubernetes maintenance",
            api_server.address, e
        ),
    }

    for entry in &status.reboot_queue.entries {
        if entry.status != RebootStatus::Draining {
            continue;
        }
        let Some(node) = cluster.node(&entry.node) else {
            continue;
        };
        if drain_complete(&client, node.nodename()).await {
            status.reboot_queue.drain_completed.insert(entry.node.clone());
        }
    }
    for entry in &status.repair_queue.entries {
        if entry.status != RepairStatus::Processing || entry.step_status != RepairStepStatus::Draining {
            continue;
        }
        let nodename = cluster
            .node(&entry.address)
            .map_or(entry.nodename.as_str(), |n| n.nodename());
        if drain_complete(&client, nodename).await {
            status.repair_queue.drain_completed.insert(entry.address.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    fn failure(code: StatusCode, reason: &str) -> (StatusCode, Json<Value>) {
        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code.as_u16(),
        });
        (code, Json(body))
    }

    async fn api_server(app: Router) -> kube::Client {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move { axum::serve(listener, app).await });
        let config = kube::Config::new(format!("http://{addr}").parse().expect("url"));
        kube::Client::try_from(config).expect("client")
    }

    #[tokio::test]
    async fn test_missing_objects_are_none() {
        let app = Router::new()
            .route(
                "/api/v1/nodes",
                get(|| async { Json(json!({"kind": "NodeList", "apiVersion": "v1", "metadata": {}, "items": []})) }),
            )
            .fallback(|| async { failure(StatusCode::NOT_FOUND, "NotFound") });
        let client = api_server(app).await;

        let ks = observe(&client, &Cluster::default(), &[]).await.expect("observe");

        assert!(!ks.is_control_plane_ready);
        assert!(ks.nodes.is_empty());
        assert!(ks.master_endpoints.is_none());
        assert!(ks.etcd_service.is_none());
    }

    #[tokio::test]
    async fn test_server_errors_are_not_absence() {
        let app = Router::new()
            .route(
                "/api/v1/namespaces/kube-system",
                get(|| async {
                    Json(json!({"kind": "Namespace", "apiVersion": "v1", "metadata": {"name": "kube-system"}}))
                }),
            )
            .fallback(|| async { failure(StatusCode::INTERNAL_SERVER_ERROR, "InternalError") });
        let client = api_server(app).await;

        let err = observe(&client, &Cluster::default(), &[])
            .await
            .expect_err("server error");

        assert!(matches!(err, kube::Error::Api(ref ae) if ae.code == 500), "{err}");
    }
}
