//! Per-service option groups and container parameters

use crate::cluster::Taint;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A bind mount for a system container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Host path
    pub source: String,

    /// Path inside the container
    pub destination: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,

    /// Mount propagation (`rshared`, `rslave`, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub propagation: String,
}

impl Mount {
    /// Read-only bind of a host path at the same location
    #[must_use]
    pub fn read_only(path: &str) -> Self {
        Self {
            source: path.to_string(),
            destination: path.to_string(),
            read_only: true,
            propagation: String::new(),
        }
    }

    /// Read-write bind of a host path at the same location
    #[must_use]
    pub fn read_write(path: &str) -> Self {
        Self {
            read_only: false,
            ..Self::read_only(path)
        }
    }
}

/// Arguments, binds and environment of a system container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParams {
    /// Arguments appended to the built-in ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Bind mounts added to the built-in ones
    #[serde(default)]
    pub extra_binds: Vec<Mount>,

    /// Environment variables of the container
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl ServiceParams {
    /// Compare two parameter sets, skipping arguments that start with any
    /// of `ignored` (e.g. `--initial-` for etcd).
    #[must_use]
    pub fn equal_ignoring(&self, other: &Self, ignored: &[&str]) -> bool {
        let keep = |arg: &&String| !ignored.iter().any(|p| arg.starts_with(p));
        let lhs: Vec<&String> = self.extra_args.iter().filter(keep).collect();
        let rhs: Vec<&String> = other.extra_args.iter().filter(keep).collect();

        lhs == rhs && self.extra_binds == other.extra_binds && self.extra_env == other.extra_env
    }
}

/// Value of the params label attached to every system container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsLabel {
    /// Parameters the engine derives itself
    pub builtin: ServiceParams,
    /// Parameters taken from the cluster options
    pub extra: ServiceParams,
}

impl ParamsLabel {
    /// Serialize to the JSON stored in the container label
    pub fn to_label(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a container label value
    pub fn from_label(value: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// etcd options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdParams {
    /// Common container parameters
    #[serde(flatten)]
    pub service: ServiceParams,

    /// Docker volume holding the etcd data directory
    #[serde(default = "default_etcd_volume")]
    pub volume_name: String,
}

fn default_etcd_volume() -> String {
    "etcd-clusterops".to_string()
}

impl Default for EtcdParams {
    fn default() -> Self {
        Self {
            service: ServiceParams::default(),
            volume_name: default_etcd_volume(),
        }
    }
}

impl EtcdParams {
    /// Companion volume whose existence records that this node's member
    /// joined the cluster
    #[must_use]
    pub fn marker_volume(&self) -> String {
        format!("{}-member", self.volume_name)
    }
}

/// kube-apiserver options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerParams {
    /// Common container parameters
    #[serde(flatten)]
    pub service: ServiceParams,

    /// Enable API server audit logging
    #[serde(default)]
    pub audit_log_enabled: bool,

    /// Audit policy document (YAML)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audit_log_policy: String,

    /// Audit log file; standard output when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audit_log_path: String,
}

/// kubelet options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeletParams {
    /// Common container parameters
    #[serde(flatten)]
    pub service: ServiceParams,

    /// Cluster domain
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Let the kubelet run with swap enabled
    #[serde(default)]
    pub allow_swap: bool,

    /// Size at which container logs are rotated
    #[serde(default = "default_log_max_size")]
    pub container_log_max_size: String,

    /// Rotated container log files kept
    #[serde(default = "default_log_max_files")]
    pub container_log_max_files: i32,

    /// Taints registered with the node on first boot only
    #[serde(default)]
    pub boot_taints: Vec<Taint>,

    /// Container runtime socket
    #[serde(default = "default_cri_endpoint")]
    pub cri_endpoint: String,
}

fn default_domain() -> String {
    "cluster.local".to_string()
}

fn default_log_max_size() -> String {
    "10Mi".to_string()
}

fn default_log_max_files() -> i32 {
    5
}

fn default_cri_endpoint() -> String {
    "unix:///run/containerd/containerd.sock".to_string()
}

impl Default for KubeletParams {
    fn default() -> Self {
        Self {
            service: ServiceParams::default(),
            domain: default_domain(),
            allow_swap: false,
            container_log_max_size: default_log_max_size(),
            container_log_max_files: default_log_max_files(),
            boot_taints: Vec::new(),
            cri_endpoint: default_cri_endpoint(),
        }
    }
}

/// Option groups for every service the engine runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// etcd options
    #[serde(default)]
    pub etcd: EtcdParams,

    /// rivers options
    #[serde(default)]
    pub rivers: ServiceParams,

    /// etcd-rivers options
    #[serde(default)]
    pub etcd_rivers: ServiceParams,

    /// API server options
    #[serde(default)]
    pub kube_api: ApiServerParams,

    /// Controller manager options
    #[serde(default)]
    pub kube_controller_manager: ServiceParams,

    /// Scheduler options
    #[serde(default)]
    pub kube_scheduler: ServiceParams,

    /// kube-proxy options
    #[serde(default)]
    pub kube_proxy: ServiceParams,

    /// kubelet options
    #[serde(default)]
    pub kubelet: KubeletParams,
}
