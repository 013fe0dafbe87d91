//! Server status published by the leader

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the engine decided to do on the last tick
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationPhase {
    /// Node layout is being upgraded
    Upgrade,
    /// Upgrade cannot proceed
    UpgradeAborted,
    /// Proxies are being started
    Rivers,
    /// A new etcd cluster is being bootstrapped
    EtcdBoot,
    /// etcd cannot be bootstrapped
    EtcdBootAborted,
    /// Stopped etcd members are being started
    EtcdStart,
    /// Waiting for etcd to become healthy
    EtcdWait,
    /// Kubernetes services are being started
    #[serde(rename = "k8s-start")]
    K8sStart,
    /// etcd membership is being reconciled
    EtcdMaintain,
    /// Kubernetes objects are being reconciled
    #[serde(rename = "k8s-maintain")]
    K8sMaintain,
    /// Control plane services of removed nodes are being stopped
    StopControlPlane,
    /// Nodes cordoned by a finished drain are released
    UncordonNodes,
    /// The repair queue is being processed
    RepairMachines,
    /// The reboot queue is being processed
    RebootNodes,
    /// Nothing left to do
    #[default]
    Completed,
}

impl OperationPhase {
    /// Phase name as published
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::UpgradeAborted => "upgrade-aborted",
            Self::Rivers => "rivers",
            Self::EtcdBoot => "etcd-boot",
            Self::EtcdBootAborted => "etcd-boot-aborted",
            Self::EtcdStart => "etcd-start",
            Self::EtcdWait => "etcd-wait",
            Self::K8sStart => "k8s-start",
            Self::EtcdMaintain => "etcd-maintain",
            Self::K8sMaintain => "k8s-maintain",
            Self::StopControlPlane => "stop-control-plane",
            Self::UncordonNodes => "uncordon-nodes",
            Self::RepairMachines => "repair-machines",
            Self::RebootNodes => "reboot-nodes",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status the leader publishes after every tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Phase of the last tick
    pub phase: OperationPhase,
    /// When the status was written
    pub timestamp: DateTime<Utc>,
    /// Newest operation record id
    pub revision: i64,
}
