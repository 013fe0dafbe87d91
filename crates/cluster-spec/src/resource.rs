//! Resource definitions applied to the managed Kubernetes cluster
//!
//! Definitions are kept as opaque JSON plus a parsed header. The engine only
//! looks at the key and the revision annotation of the live object.

use crate::error::{Result, SpecError};
use crate::names::ANNOTATION_REVISION;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Storage prefix of user resource definitions
pub const RESOURCE_PREFIX: &str = "/resource/";

/// A Kubernetes object the engine keeps applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefinition {
    /// Storage key below the resource prefix, `Kind/name` or `Kind/namespace/name`
    pub key: String,
    /// `group/version` of the object
    pub api_version: String,
    /// Object kind
    pub kind: String,
    /// Empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Store revision of the definition, written to the revision annotation
    pub revision: i64,
    /// JSON document
    pub definition: Vec<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    api_version: String,
    kind: String,
    metadata: HeaderMetadata,
}

#[derive(Deserialize)]
struct HeaderMetadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

impl ResourceDefinition {
    /// Parse a JSON definition; `revision` is its storage revision
    pub fn parse(definition: &[u8], revision: i64) -> Result<Self> {
        let header: Header = serde_json::from_slice(definition)
            .map_err(|e| SpecError::InvalidResource(e.to_string()))?;
        if header.kind.is_empty() || header.metadata.name.is_empty() {
            return Err(SpecError::InvalidResource(
                "kind and metadata.name are required".to_string(),
            ));
        }

        let namespace = header.metadata.namespace.unwrap_or_default();
        Ok(Self {
            key: Self::key_for(&header.kind, &namespace, &header.metadata.name),
            api_version: header.api_version,
            kind: header.kind,
            namespace,
            name: header.metadata.name,
            revision,
            definition: definition.to_vec(),
        })
    }

    /// Storage key of an object
    #[must_use]
    pub fn key_for(kind: &str, namespace: &str, name: &str) -> String {
        if namespace.is_empty() {
            format!("{RESOURCE_PREFIX}{kind}/{name}")
        } else {
            format!("{RESOURCE_PREFIX}{kind}/{namespace}/{name}")
        }
    }

    /// Split a storage key into `(kind, namespace, name)`
    pub fn parse_key(key: &str) -> Result<(String, String, String)> {
        let rest = key
            .strip_prefix(RESOURCE_PREFIX)
            .ok_or_else(|| SpecError::InvalidResourceKey(key.to_string()))?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                Ok(((*kind).to_string(), String::new(), (*name).to_string()))
            }
            [kind, ns, name] if !kind.is_empty() && !ns.is_empty() && !name.is_empty() => Ok((
                (*kind).to_string(),
                (*ns).to_string(),
                (*name).to_string(),
            )),
            _ => Err(SpecError::InvalidResourceKey(key.to_string())),
        }
    }

    /// Whether the live object must be (re-)applied
    #[must_use]
    pub fn need_update(&self, status: Option<&ResourceStatus>) -> bool {
        let Some(status) = status else {
            return true;
        };
        if !status.has_been_ssa {
            return true;
        }
        status.annotations.get(ANNOTATION_REVISION) != Some(&self.revision.to_string())
    }

    /// Apply order: lower ranks first
    #[must_use]
    pub fn rank(&self) -> u32 {
        kind_rank(&self.kind)
    }
}

fn kind_rank(kind: &str) -> u32 {
    match kind {
        "Namespace" => 10,
        "CustomResourceDefinition" => 20,
        "ServiceAccount" => 30,
        "PodSecurityPolicy" | "PriorityClass" => 40,
        "ClusterRole" => 50,
        "ClusterRoleBinding" => 60,
        "Role" => 70,
        "RoleBinding" => 80,
        "ConfigMap" | "Secret" => 90,
        "NetworkPolicy" => 100,
        "Service" => 110,
        "PodDisruptionBudget" => 120,
        "DaemonSet" => 130,
        "StatefulSet" => 140,
        "Deployment" => 150,
        "CronJob" | "Job" => 160,
        _ => 1000,
    }
}

/// Sort definitions into apply order (rank, then key)
pub fn sort_resources(resources: &mut [ResourceDefinition]) {
    resources.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.key.cmp(&b.key)));
}

/// Observed state of an applied object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Annotations of the live object
    pub annotations: BTreeMap<String, String>,
    /// The object has managed fields owned by the engine's apply manager
    pub has_been_ssa: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"{
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {}
    }"#;

    #[test]
    fn test_parse_and_key() {
        let def = ResourceDefinition::parse(DEPLOYMENT.as_bytes(), 42).unwrap();
        assert_eq!(def.key, "/resource/Deployment/default/web");
        assert_eq!(def.api_version, "apps/v1");

        let (kind, ns, name) = ResourceDefinition::parse_key(&def.key).unwrap();
        assert_eq!((kind.as_str(), ns.as_str(), name.as_str()), ("Deployment", "default", "web"));

        let (kind, ns, name) = ResourceDefinition::parse_key("/resource/ClusterRole/admin").unwrap();
        assert_eq!((kind.as_str(), ns.as_str(), name.as_str()), ("ClusterRole", "", "admin"));

        assert!(ResourceDefinition::parse_key("/resource/Deployment").is_err());
        assert!(ResourceDefinition::parse_key("/cluster").is_err());
    }

    #[test]
    fn test_need_update() {
        let def = ResourceDefinition::parse(DEPLOYMENT.as_bytes(), 42).unwrap();
        assert!(def.need_update(None));

        let mut status = ResourceStatus {
            annotations: BTreeMap::from([(ANNOTATION_REVISION.to_string(), "42".to_string())]),
            has_been_ssa: false,
        };
        assert!(def.need_update(Some(&status)));

        status.has_been_ssa = true;
        assert!(!def.need_update(Some(&status)));

        status
            .annotations
            .insert(ANNOTATION_REVISION.to_string(), "41".to_string());
        assert!(def.need_update(Some(&status)));
    }

    #[test]
    fn test_sort_resources() {
        let ns = r#"{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"web"}}"#;
        let sa = r#"{"apiVersion":"v1","kind":"ServiceAccount","metadata":{"name":"a","namespace":"web"}}"#;
        let mut defs = vec![
            ResourceDefinition::parse(DEPLOYMENT.as_bytes(), 1).unwrap(),
            ResourceDefinition::parse(sa.as_bytes(), 1).unwrap(),
            ResourceDefinition::parse(ns.as_bytes(), 1).unwrap(),
        ];
        sort_resources(&mut defs);
        let kinds: Vec<&str> = defs.iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Namespace", "ServiceAccount", "Deployment"]);
    }
}
