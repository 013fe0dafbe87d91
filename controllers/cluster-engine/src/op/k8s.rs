//! Operators writing Kubernetes objects.

use super::common::{WAIT_TIMEOUT, WaitKubernetes};
use super::{Commander, Operator, Sequence};
use crate::error::EngineError;
use crate::infrastructure::Infrastructure;
use crate::k8s::{Mapper, dynamic_api};
use async_trait::async_trait;
use cluster_spec::names::{
    ANNOTATION_REBOOT, ANNOTATION_REVISION, APISERVER_PORT, DOMAIN_PREFIX, ETCD_CLIENT_PORT,
    ETCD_SERVICE_NAME, ETCD_SERVICE_NAMESPACE, FIELD_MANAGER, LABEL_MASTER,
};
use cluster_spec::{Cluster, Command, Node, ResourceDefinition, RestMapping, TaintEffect};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node as KubeNode, Service,
    ServicePort, ServiceSpec, Taint as KubeTaint,
};
use k8s_openapi::api::discovery::v1::{
    Endpoint, EndpointConditions, EndpointPort as SlicePort, EndpointSlice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Label linking an EndpointSlice to its Service
pub const LABEL_SERVICE_NAME: &str = "kubernetes.io/service-name";
const LABEL_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";

/// Wait until the API server on `node` serves requests
#[must_use]
pub fn wait_kubernetes(node: Node) -> Box<dyn Operator> {
    Sequence::new("wait-kubernetes", vec![node.address.clone()])
        .then(WaitKubernetes {
            node,
            timeout: WAIT_TIMEOUT,
        })
        .boxed()
}

/// Server-side apply of a resource definition
#[must_use]
pub fn resource_apply(
    api_server: Node,
    resource: ResourceDefinition,
    trusted: Vec<RestMapping>,
) -> Box<dyn Operator> {
    Sequence::new("apply-resource", vec![resource.key.clone()])
        .then(ResourceApply {
            api_server,
            resource,
            trusted,
        })
        .boxed()
}

/// Applies one resource definition with the revision annotation set
pub struct ResourceApply {
    api_server: Node,
    resource: ResourceDefinition,
    trusted: Vec<RestMapping>,
}

#[async_trait]
impl Commander for ResourceApply {
    fn command(&self) -> Command {
        Command::new("apply-resource", &self.resource.key)
            .with_detail(format!("revision {}", self.resource.revision))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let resource = &self.resource;
        let mut object: DynamicObject = serde_json::from_slice(&resource.definition)?;
        object
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_REVISION.to_string(), resource.revision.to_string());

        let client = inf.kube(&self.api_server).await?;
        let mapper = Mapper::new(&client, &self.trusted).await;
        let Some((api_resource, namespaced)) = mapper.resolve(&resource.api_version, &resource.kind)
        else {
            warn!(
                "No REST mapping for {} {}, skipping {}",
                resource.api_version, resource.kind, resource.key
            );
            return Ok(());
        };

        let api = dynamic_api(&client, &api_resource, namespaced, &resource.namespace);
        api.patch(
            &resource.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&object),
        )
        .await?;
        info!("Applied {} at revision {}", resource.key, resource.revision);
        Ok(())
    }
}

/// Server-side apply of a namespaced typed object
pub struct ApplyObject<K> {
    /// Node whose API server is used
    pub api_server: Node,
    /// Object to apply
    pub object: K,
}

#[async_trait]
impl<K> Commander for ApplyObject<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn command(&self) -> Command {
        let meta = self.object.meta();
        Command::new(
            "apply-object",
            format!(
                "{}/{}",
                meta.namespace.as_deref().unwrap_or_default(),
                meta.name.as_deref().unwrap_or_default()
            ),
        )
        .with_detail(K::kind(&()).into_owned())
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let meta = self.object.meta();
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        let client = inf.kube(&self.api_server).await?;
        let api: Api<K> = Api::namespaced(client, &namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&self.object),
        )
        .await?;
        Ok(())
    }
}

/// Operator applying one namespaced object
pub fn apply_object<K>(name: &str, api_server: Node, object: K) -> Box<dyn Operator>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let meta = object.meta();
    let target = format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    );
    Sequence::new(name, vec![target])
        .then(ApplyObject { api_server, object })
        .boxed()
}

/// Addresses of an endpoints object, split by readiness
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointAddresses {
    /// Addresses of ready members
    pub ready: Vec<String>,
    /// Addresses of members not ready
    pub not_ready: Vec<String>,
}

impl EndpointAddresses {
    /// Same addresses ignoring order
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        let sorted = |v: &[String]| {
            let mut v = v.to_vec();
            v.sort();
            v
        };
        sorted(&self.ready) == sorted(&other.ready) && sorted(&self.not_ready) == sorted(&other.not_ready)
    }
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn endpoint_addresses(addresses: &[String]) -> Option<Vec<EndpointAddress>> {
    if addresses.is_empty() {
        return None;
    }
    Some(
        addresses
            .iter()
            .map(|ip| EndpointAddress {
                ip: ip.clone(),
                ..Default::default()
            })
            .collect(),
    )
}

/// Desired Endpoints object
#[must_use]
pub fn endpoints(namespace: &str, name: &str, port_name: &str, port: u16, addresses: &EndpointAddresses) -> Endpoints {
    Endpoints {
        metadata: object_meta(namespace, name),
        subsets: Some(vec![EndpointSubset {
            addresses: endpoint_addresses(&addresses.ready),
            not_ready_addresses: endpoint_addresses(&addresses.not_ready),
            ports: Some(vec![EndpointPort {
                name: Some(port_name.to_string()),
                port: i32::from(port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
        }]),
    }
}

/// Desired EndpointSlice for a Service
#[must_use]
pub fn endpoint_slice(
    namespace: &str,
    service: &str,
    port_name: &str,
    port: u16,
    addresses: &EndpointAddresses,
) -> EndpointSlice {
    let mut metadata = object_meta(namespace, service);
    metadata.labels = Some(BTreeMap::from([
        (LABEL_SERVICE_NAME.to_string(), service.to_string()),
        (LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
    ]));

    let endpoint = |ip: &String, ready: bool| Endpoint {
        addresses: vec![ip.clone()],
        conditions: Some(EndpointConditions {
            ready: Some(ready),
            ..Default::default()
        }),
        ..Default::default()
    };
    let endpoints = addresses
        .ready
        .iter()
        .map(|ip| endpoint(ip, true))
        .chain(addresses.not_ready.iter().map(|ip| endpoint(ip, false)))
        .collect();

    EndpointSlice {
        metadata,
        address_type: "IPv4".to_string(),
        endpoints,
        ports: Some(vec![SlicePort {
            name: Some(port_name.to_string()),
            port: Some(i32::from(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
    }
}

/// Ready and not-ready addresses recorded in an Endpoints object
#[must_use]
pub fn observed_endpoints(endpoints: &Endpoints) -> EndpointAddresses {
    let subsets = endpoints.subsets.as_deref().unwrap_or_default();
    let collect = |f: fn(&EndpointSubset) -> Option<&Vec<EndpointAddress>>| -> Vec<String> {
        subsets
            .iter()
            .filter_map(f)
            .flatten()
            .map(|a| a.ip.clone())
            .collect()
    };
    EndpointAddresses {
        ready: collect(|s| s.addresses.as_ref()),
        not_ready: collect(|s| s.not_ready_addresses.as_ref()),
    }
}

/// Ready and not-ready addresses recorded in an EndpointSlice
#[must_use]
pub fn observed_slice(slice: &EndpointSlice) -> EndpointAddresses {
    let mut observed = EndpointAddresses::default();
    for endpoint in &slice.endpoints {
        let ready = endpoint
            .conditions
            .as_ref()
            .and_then(|c| c.ready)
            .unwrap_or(false);
        for address in &endpoint.addresses {
            if ready {
                observed.ready.push(address.clone());
            } else {
                observed.not_ready.push(address.clone());
            }
        }
    }
    observed
}

/// Endpoints of `default/kubernetes`
#[must_use]
pub fn master_endpoints(addresses: &EndpointAddresses) -> Endpoints {
    endpoints("default", "kubernetes", "https", APISERVER_PORT, addresses)
}

/// EndpointSlice of `default/kubernetes`
#[must_use]
pub fn master_endpoint_slice(addresses: &EndpointAddresses) -> EndpointSlice {
    endpoint_slice("default", "kubernetes", "https", APISERVER_PORT, addresses)
}

/// Endpoints of the etcd service
#[must_use]
pub fn etcd_endpoints(addresses: &EndpointAddresses) -> Endpoints {
    endpoints(
        ETCD_SERVICE_NAMESPACE,
        ETCD_SERVICE_NAME,
        "etcd",
        ETCD_CLIENT_PORT,
        addresses,
    )
}

/// EndpointSlice of the etcd service
#[must_use]
pub fn etcd_endpoint_slice(addresses: &EndpointAddresses) -> EndpointSlice {
    endpoint_slice(
        ETCD_SERVICE_NAMESPACE,
        ETCD_SERVICE_NAME,
        "etcd",
        ETCD_CLIENT_PORT,
        addresses,
    )
}

/// Headless Service fronting etcd
#[must_use]
pub fn etcd_service() -> Service {
    Service {
        metadata: object_meta(ETCD_SERVICE_NAMESPACE, ETCD_SERVICE_NAME),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("etcd".to_string()),
                port: i32::from(ETCD_CLIENT_PORT),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether an observed etcd Service still has the expected shape
#[must_use]
pub fn etcd_service_is_current(service: &Service) -> bool {
    let Some(spec) = service.spec.as_ref() else {
        return false;
    };
    let ports_match = spec.ports.as_ref().is_some_and(|ports| {
        ports.len() == 1 && ports[0].port == i32::from(ETCD_CLIENT_PORT)
    });
    spec.cluster_ip.as_deref() == Some("None") && spec.selector.is_none() && ports_match
}

/// Create the etcd Service, deleting a drifted one first
#[must_use]
pub fn etcd_service_op(api_server: Node, recreate: bool) -> Box<dyn Operator> {
    let name = if recreate {
        "recreate-etcd-service"
    } else {
        "create-etcd-service"
    };
    Sequence::new(name, vec![format!("{ETCD_SERVICE_NAMESPACE}/{ETCD_SERVICE_NAME}")])
        .then(CreateEtcdService {
            api_server,
            recreate,
        })
        .boxed()
}

/// Create the headless etcd service, replacing it when `recreate` is set
pub struct CreateEtcdService {
    api_server: Node,
    recreate: bool,
}

#[async_trait]
impl Commander for CreateEtcdService {
    fn command(&self) -> Command {
        Command::new("create-etcd-service", ETCD_SERVICE_NAME)
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let client = inf.kube(&self.api_server).await?;
        let api: Api<Service> = Api::namespaced(client, ETCD_SERVICE_NAMESPACE);
        if self.recreate {
            match api.delete(ETCD_SERVICE_NAME, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        api.create(&PostParams::default(), &etcd_service()).await?;
        Ok(())
    }
}

fn is_engine_key(key: &str) -> bool {
    key.starts_with(DOMAIN_PREFIX)
}

fn desired_taints(cluster: &Cluster, node: &Node) -> Vec<KubeTaint> {
    let mut taints: Vec<KubeTaint> = node
        .taints
        .iter()
        .map(|t| KubeTaint {
            key: t.key.clone(),
            value: (!t.value.is_empty()).then(|| t.value.clone()),
            effect: t.effect.as_str().to_string(),
            time_added: None,
        })
        .collect();
    if node.control_plane && cluster.taint_control_plane {
        taints.push(KubeTaint {
            key: LABEL_MASTER.to_string(),
            value: None,
            effect: TaintEffect::PreferNoSchedule.as_str().to_string(),
            time_added: None,
        });
    }
    taints
}

/// The Kubernetes Node with declared labels, annotations and taints applied
///
/// Keys outside the engine's prefix are never removed.
#[must_use]
pub fn desired_node(cluster: &Cluster, node: &Node, current: &KubeNode) -> KubeNode {
    let mut desired = current.clone();
    let metadata = &mut desired.metadata;

    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.retain(|k, _| !is_engine_key(k) || node.labels.contains_key(k));
    labels.extend(node.labels.clone());
    labels.insert(LABEL_MASTER.to_string(), node.control_plane.to_string());

    let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.retain(|k, _| !is_engine_key(k) || k == ANNOTATION_REBOOT || node.annotations.contains_key(k));
    annotations.extend(node.annotations.clone());
    if annotations.is_empty() && current.metadata.annotations.is_none() {
        metadata.annotations = None;
    }

    let declared = desired_taints(cluster, node);
    let spec = desired.spec.get_or_insert_with(Default::default);
    let mut taints: Vec<KubeTaint> = spec
        .taints
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|t| !is_engine_key(&t.key))
        .filter(|t| !declared.iter().any(|d| d.key == t.key && d.effect == t.effect))
        .collect();
    taints.extend(declared);
    spec.taints = if taints.is_empty() && current.spec.as_ref().and_then(|s| s.taints.as_ref()).is_none() {
        None
    } else {
        Some(taints)
    };
    desired
}

/// Whether the observed Node differs from what the engine declares
#[must_use]
pub fn node_needs_update(cluster: &Cluster, node: &Node, current: &KubeNode) -> bool {
    let desired = desired_node(cluster, node, current);
    desired.metadata.labels != current.metadata.labels
        || desired.metadata.annotations != current.metadata.annotations
        || desired.spec.as_ref().and_then(|s| s.taints.clone())
            != current.spec.as_ref().and_then(|s| s.taints.clone())
}

/// Replace Node objects with their declared attributes
#[must_use]
pub fn update_node(api_server: Node, nodes: Vec<KubeNode>) -> Box<dyn Operator> {
    let targets = nodes
        .iter()
        .filter_map(|n| n.metadata.name.clone())
        .collect();
    Sequence::new("update-node", targets)
        .then(UpdateNodes { api_server, nodes })
        .boxed()
}

/// Replace Node objects with the given versions
pub struct UpdateNodes {
    api_server: Node,
    nodes: Vec<KubeNode>,
}

#[async_trait]
impl Commander for UpdateNodes {
    fn command(&self) -> Command {
        let names: Vec<&str> = self
            .nodes
            .iter()
            .filter_map(|n| n.metadata.name.as_deref())
            .collect();
        Command::new("update-node", names.join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let client = inf.kube(&self.api_server).await?;
        let api: Api<KubeNode> = Api::all(client);
        for node in &self.nodes {
            let name = node.metadata.name.clone().unwrap_or_default();
            api.replace(&name, &PostParams::default(), node).await?;
            info!("Updated node {}", name);
        }
        Ok(())
    }
}

/// Delete Node objects of machines no longer declared
#[must_use]
pub fn remove_node(api_server: Node, names: Vec<String>) -> Box<dyn Operator> {
    Sequence::new("remove-node", names.clone())
        .then(RemoveNodes { api_server, names })
        .boxed()
}

/// Delete Node objects by name
pub struct RemoveNodes {
    api_server: Node,
    names: Vec<String>,
}

#[async_trait]
impl Commander for RemoveNodes {
    fn command(&self) -> Command {
        Command::new("remove-node", self.names.join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let client = inf.kube(&self.api_server).await?;
        let api: Api<KubeNode> = Api::all(client);
        for name in &self.names {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!("Removed node {}", name),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_spec::Taint;
    use k8s_openapi::api::core::v1::NodeSpec;

    fn kube_node(labels: &[(&str, &str)], taints: Vec<KubeTaint>) -> KubeNode {
        KubeNode {
            metadata: ObjectMeta {
                name: Some("cp1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(taints),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_desired_node_keeps_foreign_keys() {
        let cluster = Cluster {
            taint_control_plane: true,
            ..Default::default()
        };
        let node = Node {
            address: "10.0.0.11".to_string(),
            hostname: "cp1".to_string(),
            control_plane: true,
            labels: BTreeMap::from([("rack".to_string(), "a1".to_string())]),
            taints: vec![Taint {
                key: "gpu".to_string(),
                value: "true".to_string(),
                effect: TaintEffect::NoSchedule,
            }],
            ..Default::default()
        };
        let current = kube_node(
            &[
                ("kubernetes.io/hostname", "cp1"),
                ("clusterops.microscaler.io/stale", "x"),
            ],
            vec![KubeTaint {
                key: "node.kubernetes.io/unschedulable".to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }],
        );

        assert!(node_needs_update(&cluster, &node, &current));
        let desired = desired_node(&cluster, &node, &current);
        let labels = desired.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("kubernetes.io/hostname").map(String::as_str), Some("cp1"));
        assert_eq!(labels.get("rack").map(String::as_str), Some("a1"));
        assert_eq!(labels.get(LABEL_MASTER).map(String::as_str), Some("true"));
        assert!(!labels.contains_key("clusterops.microscaler.io/stale"));

        let taints = desired.spec.clone().unwrap().taints.unwrap();
        let keys: Vec<&str> = taints.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["node.kubernetes.io/unschedulable", "gpu", LABEL_MASTER]);

        assert!(!node_needs_update(&cluster, &node, &desired));
    }

    #[test]
    fn test_endpoints_split_ready_and_not_ready() {
        let addresses = EndpointAddresses {
            ready: vec!["10.0.0.11".to_string(), "10.0.0.12".to_string()],
            not_ready: vec!["10.0.0.13".to_string()],
        };
        let ep = master_endpoints(&addresses);
        assert_eq!(observed_endpoints(&ep), addresses);

        let slice = master_endpoint_slice(&addresses);
        assert_eq!(observed_slice(&slice), addresses);
        assert_eq!(
            slice.metadata.labels.unwrap().get(LABEL_SERVICE_NAME).map(String::as_str),
            Some("kubernetes")
        );
    }

    #[test]
    fn test_etcd_service_shape() {
        let mut service = etcd_service();
        assert!(etcd_service_is_current(&service));

        service.spec.as_mut().unwrap().cluster_ip = Some("10.68.0.10".to_string());
        assert!(!etcd_service_is_current(&service));
    }
}
