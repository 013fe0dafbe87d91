//! Kubernetes helpers shared by the status gatherer and the operators.
//!
//! Covers dynamic REST mapping of resource definitions, node cordoning and
//! pod eviction for drains.

use crate::error::EngineError;
use cluster_spec::RestMapping;
use cluster_spec::names::{ANNOTATION_REBOOT, FIELD_MANAGER};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, DynamicObject, EvictParams, ListParams, Patch, PatchParams};
use kube::core::{GroupVersionKind, Selector};
use kube::discovery::{ApiResource, Discovery, Scope};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Split `group/version` (or a core `version`) into its parts
#[must_use]
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

/// Maps kinds to REST resources, preferring trusted mappings over discovery
pub struct Mapper {
    trusted: Vec<RestMapping>,
    discovery: Option<Discovery>,
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("trusted", &self.trusted.len())
            .field("discovered", &self.discovery.is_some())
            .finish()
    }
}

impl Mapper {
    /// Run discovery; on failure only trusted mappings resolve
    pub async fn new(client: &kube::Client, trusted: &[RestMapping]) -> Self {
        let discovery = match Discovery::new(client.clone()).run().await {
            Ok(discovery) => Some(discovery),
            Err(e) => {
                warn!("API discovery failed, using trusted mappings only: {}", e);
                None
            }
        };
        Self {
            trusted: trusted.to_vec(),
            discovery,
        }
    }

    /// Mapper that only knows `trusted`
    #[must_use]
    pub fn trusted_only(trusted: &[RestMapping]) -> Self {
        Self {
            trusted: trusted.to_vec(),
            discovery: None,
        }
    }

    /// Resolve a kind to its resource and whether it is namespaced
    #[must_use]
    pub fn resolve(&self, api_version: &str, kind: &str) -> Option<(ApiResource, bool)> {
        let (group, version) = split_api_version(api_version);

        if let Some(mapping) = self
            .trusted
            .iter()
            .find(|m| m.group == group && m.version == version && m.kind == kind)
        {
            let resource = ApiResource {
                group: mapping.group.clone(),
                version: mapping.version.clone(),
                api_version: api_version.to_string(),
                kind: mapping.kind.clone(),
                plural: mapping.resource.clone(),
            };
            return Some((resource, mapping.namespaced));
        }

        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = self.discovery.as_ref()?.resolve_gvk(&gvk)?;
        Some((resource, caps.scope == Scope::Namespaced))
    }
}

/// Dynamic API for one resource
#[must_use]
pub fn dynamic_api(
    client: &kube::Client,
    resource: &ApiResource,
    namespaced: bool,
    namespace: &str,
) -> Api<DynamicObject> {
    if namespaced && !namespace.is_empty() {
        Api::namespaced_with(client.clone(), namespace, resource)
    } else {
        Api::all_with(client.clone(), resource)
    }
}

/// Whether the engine's apply manager owns fields of the object
#[must_use]
pub fn has_been_applied(meta: &ObjectMeta) -> bool {
    meta.managed_fields.as_ref().is_some_and(|fields| {
        fields.iter().any(|f| {
            f.manager.as_deref() == Some(FIELD_MANAGER) && f.operation.as_deref() == Some("Apply")
        })
    })
}

/// Whether a Kubernetes Node reports Ready
#[must_use]
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the node carries the engine's cordon marker
#[must_use]
pub fn node_is_marked(node: &Node) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_REBOOT))
}

/// Pods scheduled on a node
///
/// # Errors
///
/// Returns the Kubernetes API error.
pub async fn pods_on_node(client: &kube::Client, nodename: &str) -> Result<Vec<Pod>, EngineError> {
    let pods: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().fields(&format!("spec.nodeName={nodename}"));
    Ok(pods.list(&params).await?.items)
}

fn owner_kind_is(pod: &Pod, kind: &str) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == kind))
}

/// DaemonSet pods are not evicted
#[must_use]
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    owner_kind_is(pod, "DaemonSet")
}

/// Static pods mirrored by the kubelet cannot be evicted
#[must_use]
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
}

/// Pods of a Job that already ran to completion or failure
#[must_use]
pub fn is_finished_job_pod(pod: &Pod) -> bool {
    owner_kind_is(pod, "Job")
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
}

/// Pods a drain has to evict
#[must_use]
pub fn pods_to_evict(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter()
        .filter(|p| !is_daemonset_pod(p) && !is_mirror_pod(p) && !is_finished_job_pod(p))
        .collect()
}

/// A drain is complete once nothing evictable is left on the node
#[must_use]
pub fn is_drain_complete(pods: &[Pod]) -> bool {
    pods_to_evict(pods).is_empty()
}

/// Mark a node unschedulable and annotate it with the cordon marker
///
/// # Errors
///
/// Returns the Kubernetes API error.
pub async fn cordon(client: &kube::Client, nodename: &str, marker: &str) -> Result<(), EngineError> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {"annotations": {ANNOTATION_REBOOT: marker}},
        "spec": {"unschedulable": true},
    });
    nodes
        .patch(nodename, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!("Cordoned node {}", nodename);
    Ok(())
}

/// Clear `unschedulable` and the cordon marker
///
/// # Errors
///
/// Returns the Kubernetes API error; a missing node is not an error.
pub async fn uncordon(client: &kube::Client, nodename: &str) -> Result<(), EngineError> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {"annotations": {ANNOTATION_REBOOT: null}},
        "spec": {"unschedulable": false},
    });
    match nodes
        .patch(nodename, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            info!("Uncordoned node {}", nodename);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Convert a protection selector into a list query selector
///
/// # Errors
///
/// Returns [`EngineError::InvalidConfig`] for an unknown operator.
pub fn namespace_selector(selector: &LabelSelector) -> Result<Selector, EngineError> {
    Selector::try_from(selector.clone())
        .map_err(|e| EngineError::InvalidConfig(format!("protected namespace selector: {e}")))
}

/// Namespaces matched by a protection selector
///
/// # Errors
///
/// Returns the Kubernetes API error.
pub async fn protected_namespaces(
    client: &kube::Client,
    selector: Option<&LabelSelector>,
) -> Result<HashSet<String>, EngineError> {
    let Some(selector) = selector else {
        return Ok(HashSet::new());
    };
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let params = ListParams::default().labels_from(&namespace_selector(selector)?);
    Ok(namespaces
        .list(&params)
        .await?
        .items
        .into_iter()
        .filter_map(|ns| ns.metadata.name)
        .collect())
}

/// Eviction retry settings
#[derive(Debug, Clone, Copy)]
pub struct EvictPolicy {
    /// Attempts per pod before giving up
    pub retries: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

/// Evict every evictable pod of a node
///
/// A pod whose eviction is refused by a disruption budget (HTTP 429) is
/// deleted instead, unless its namespace is protected; protected pods are
/// retried and finally reported as an error.
///
/// # Errors
///
/// Returns the first pod that could not be evicted.
pub async fn evict_or_delete(
    ctx: &CancellationToken,
    client: &kube::Client,
    pods: &[Pod],
    protected: &HashSet<String>,
    policy: EvictPolicy,
) -> Result<(), EngineError> {
    for pod in pods_to_evict(pods) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);

        let mut attempt = 0;
        loop {
            match api.evict(&name, &EvictParams::default()).await {
                Ok(_) => {
                    debug!("Evicted pod {}/{}", namespace, name);
                    break;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => break,
                Err(kube::Error::Api(e)) if e.code == 429 => {
                    if !protected.contains(&namespace) {
                        warn!(
                            "Eviction of {}/{} blocked by a disruption budget, deleting",
                            namespace, name
                        );
                        match api.delete(&name, &DeleteParams::default()).await {
                            Ok(_) => break,
                            Err(kube::Error::Api(e)) if e.code == 404 => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if attempt >= policy.retries {
                        return Err(EngineError::CommandFailed(format!(
                            "eviction of {namespace}/{name} in a protected namespace is blocked: {}",
                            e.message
                        )));
                    }
                    attempt += 1;
                    tokio::select! {
                        () = ctx.cancelled() => return Err(EngineError::Cancelled),
                        () = tokio::time::sleep(policy.interval) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, OwnerReference};
    use kube::core::SelectorExt;
    use std::collections::BTreeMap;

    fn pod(name: &str, owner: Option<&str>, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: owner.map(|kind| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: "owner".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_drain_ignores_daemonset_and_finished_job_pods() {
        let pods = vec![
            pod("node-dns-x", Some("DaemonSet"), "Running"),
            pod("backup-1", Some("Job"), "Succeeded"),
            pod("backup-2", Some("Job"), "Failed"),
        ];
        assert!(is_drain_complete(&pods));

        let mut pods = pods;
        pods.push(pod("web-1", Some("ReplicaSet"), "Running"));
        pods.push(pod("backup-3", Some("Job"), "Running"));
        pods.push(pod("crashed", None, "Failed"));
        assert!(!is_drain_complete(&pods));
        let names: Vec<_> = pods_to_evict(&pods)
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["web-1".to_string(), "backup-3".to_string(), "crashed".to_string()]);
    }

    #[test]
    fn test_protected_selector_converts() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("team".to_string(), "infra".to_string())])),
            ..Default::default()
        };
        let selector = namespace_selector(&selector).expect("selector");
        assert!(selector.matches(&BTreeMap::from([("team".to_string(), "infra".to_string())])));
        assert!(!selector.matches(&BTreeMap::from([("team".to_string(), "web".to_string())])));
    }

    #[test]
    fn test_mirror_pods_are_not_evicted() {
        let mut mirror = pod("static", None, "Running");
        mirror.metadata.annotations = Some(BTreeMap::from([(
            "kubernetes.io/config.mirror".to_string(),
            "x".to_string(),
        )]));
        assert!(is_drain_complete(&[mirror]));
    }

    #[test]
    fn test_has_been_applied_requires_apply_by_engine() {
        let mut meta = ObjectMeta::default();
        assert!(!has_been_applied(&meta));

        meta.managed_fields = Some(vec![ManagedFieldsEntry {
            manager: Some(FIELD_MANAGER.to_string()),
            operation: Some("Update".to_string()),
            ..Default::default()
        }]);
        assert!(!has_been_applied(&meta));

        meta.managed_fields = Some(vec![ManagedFieldsEntry {
            manager: Some(FIELD_MANAGER.to_string()),
            operation: Some("Apply".to_string()),
            ..Default::default()
        }]);
        assert!(has_been_applied(&meta));
    }

    #[test]
    fn test_trusted_mapping_resolves_without_discovery() {
        let mapper = Mapper::trusted_only(&[RestMapping {
            group: "example.com".to_string(),
            version: "v1".to_string(),
            kind: "Widget".to_string(),
            resource: "widgets".to_string(),
            namespaced: false,
        }]);

        let (resource, namespaced) = mapper.resolve("example.com/v1", "Widget").expect("mapped");
        assert_eq!(resource.plural, "widgets");
        assert!(!namespaced);
        assert!(mapper.resolve("v1", "ConfigMap").is_none());
    }

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }
}
