//! Reboot policy and reboot queue entries

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds a drain may take before it is retried later
pub const DEFAULT_EVICTION_TIMEOUT_SECONDS: u64 = 600;
/// Timeout of the reboot and boot check commands
pub const DEFAULT_REBOOT_COMMAND_TIMEOUT_SECONDS: u64 = 1800;
/// Nodes rebooted at the same time
pub const DEFAULT_MAX_CONCURRENT_REBOOTS: usize = 1;
/// Seconds between eviction attempts of a pod
pub const DEFAULT_EVICT_INTERVAL_SECONDS: u64 = 5;

/// How nodes are rebooted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebootSpec {
    /// Command run by the engine; the node address is appended
    #[serde(default)]
    pub reboot_command: Vec<String>,

    /// Command answering `true` once a node is back; node address and
    /// the last transition time (unix seconds) are appended
    #[serde(default)]
    pub boot_check_command: Vec<String>,

    /// Drain timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_timeout_seconds: Option<u64>,

    /// Timeout of one command run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_seconds: Option<u64>,

    /// Extra attempts of a failed command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_retries: Option<u32>,

    /// Seconds between command retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_interval: Option<u64>,

    /// Extra eviction attempts of a pod blocked by a disruption budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evict_retries: Option<u32>,

    /// Seconds between eviction attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evict_interval: Option<u64>,

    /// Worker nodes rebooted at the same time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_reboots: Option<usize>,

    /// Namespaces whose disruption budgets are never bypassed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub protected_namespaces: Option<LabelSelector>,
}

impl RebootSpec {
    /// Drain timeout, defaulted
    #[must_use]
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(
            self.eviction_timeout_seconds
                .unwrap_or(DEFAULT_EVICTION_TIMEOUT_SECONDS),
        )
    }

    /// Command timeout, defaulted
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(
            self.command_timeout_seconds
                .unwrap_or(DEFAULT_REBOOT_COMMAND_TIMEOUT_SECONDS),
        )
    }

    /// Pause between command retries
    #[must_use]
    pub fn command_interval(&self) -> Duration {
        Duration::from_secs(self.command_interval.unwrap_or(0))
    }

    /// Pause between eviction attempts, defaulted
    #[must_use]
    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval.unwrap_or(DEFAULT_EVICT_INTERVAL_SECONDS))
    }

    /// Concurrent reboots, defaulted
    #[must_use]
    pub fn max_concurrent_reboots(&self) -> usize {
        self.max_concurrent_reboots
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REBOOTS)
    }
}

/// Reboot queue entry status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RebootStatus {
    /// Waiting for its turn
    #[default]
    Queued,

    /// Cordoned, pods being evicted
    Draining,

    /// Reboot command issued, waiting for the boot check
    Rebooting,

    /// Cancelled by an operator, removed on the next tick
    Cancelled,
}

/// Entry of the reboot queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebootQueueEntry {
    /// Position in the queue, assigned on enqueue
    pub index: i64,

    /// Node address
    pub node: String,

    /// Progress of the entry
    #[serde(default)]
    pub status: RebootStatus,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Consecutive failed drains
    #[serde(default)]
    pub drain_backoff_count: u32,

    /// Earliest time of the next drain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_backoff_expire: Option<DateTime<Utc>>,
}

impl RebootQueueEntry {
    /// New queued entry; the index is assigned on enqueue
    #[must_use]
    pub fn new(node: &str) -> Self {
        Self {
            index: 0,
            node: node.to_string(),
            status: RebootStatus::Queued,
            last_transition_time: None,
            drain_backoff_count: 0,
            drain_backoff_expire: None,
        }
    }

    /// Whether the entry holds a drained node
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, RebootStatus::Draining | RebootStatus::Rebooting)
    }

    /// Whether the drain back-off window has passed
    #[must_use]
    pub fn backoff_expired(&self, now: DateTime<Utc>) -> bool {
        self.drain_backoff_expire.is_none_or(|t| t <= now)
    }
}
