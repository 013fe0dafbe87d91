//! Repair policy, procedures and repair queue entries
//!
//! A repair entry names an operation and a machine type. The matching
//! [`RepairOperation`] is a list of [`RepairStep`]s run one after another; each
//! step may drain the node first and then watches for the node to recover.

use crate::error::{Result, SpecError};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Machines repaired at the same time
pub const DEFAULT_MAX_CONCURRENT_REPAIRS: usize = 1;
/// Seconds a repair drain may take before it is retried later
pub const DEFAULT_REPAIR_EVICTION_TIMEOUT_SECONDS: u64 = 600;
/// Timeout of one health check run
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS: u64 = 30;

/// Repair policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairSpec {
    /// Procedures by machine type
    #[serde(default)]
    pub repair_procedures: Vec<RepairProcedure>,

    /// Machines repaired at the same time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_repairs: Option<usize>,

    /// Namespaces whose disruption budgets are never bypassed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub protected_namespaces: Option<LabelSelector>,

    /// Extra eviction attempts of a pod blocked by a disruption budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evict_retries: Option<u32>,

    /// Seconds between eviction attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evict_interval: Option<u64>,

    /// Drain timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_timeout_seconds: Option<u64>,
}

impl RepairSpec {
    /// Concurrent repairs, defaulted
    #[must_use]
    pub fn max_concurrent_repairs(&self) -> usize {
        self.max_concurrent_repairs
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REPAIRS)
    }

    /// Drain timeout, defaulted
    #[must_use]
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(
            self.eviction_timeout_seconds
                .unwrap_or(DEFAULT_REPAIR_EVICTION_TIMEOUT_SECONDS),
        )
    }

    /// Pause between eviction attempts, defaulted
    #[must_use]
    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(
            self.evict_interval
                .unwrap_or(crate::reboot::DEFAULT_EVICT_INTERVAL_SECONDS),
        )
    }
}

/// Operations applicable to a set of machine types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairProcedure {
    /// Machine types the procedure applies to
    pub machine_types: Vec<String>,
    /// Operations by name
    pub repair_operations: Vec<RepairOperation>,
}

/// Named sequence of repair steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairOperation {
    /// Operation name requested by the enqueuer
    pub operation: String,

    /// Steps run in order until the machine is healthy
    pub repair_steps: Vec<RepairStep>,

    /// Command printing `true` once the machine is healthy again
    #[serde(default)]
    pub health_check_command: Vec<String>,

    /// Timeout of the health check command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_seconds: Option<u64>,
}

impl RepairOperation {
    /// Health check timeout, defaulted
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(
            self.command_timeout_seconds
                .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS),
        )
    }
}

/// One step of a repair operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairStep {
    /// Command run by the engine; the machine address is appended
    pub repair_command: Vec<String>,

    /// Timeout of one command run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_seconds: Option<u64>,

    /// Extra attempts of a failed command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_retries: Option<u32>,

    /// Seconds between command retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_interval: Option<u64>,

    /// Drain the node before running the command
    #[serde(default)]
    pub need_drain: bool,

    /// Seconds to wait for recovery before moving to the next step
    #[serde(default)]
    pub watch_seconds: u64,
}

/// Repair queue entry status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RepairStatus {
    /// Waiting for its turn
    #[default]
    Queued,
    /// Running its steps
    Processing,
    /// The machine is healthy again
    Succeeded,
    /// A command failed or the steps ran out
    Failed,
}

/// Progress within the current step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RepairStepStatus {
    /// About to start the step, possibly backed off
    #[default]
    Waiting,
    /// Node cordoned, pods being evicted
    Draining,
    /// Command ran, waiting for the health check
    Watching,
}

/// Entry of the repair queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepairQueueEntry {
    /// Position in the queue, assigned on enqueue
    pub index: i64,
    /// Machine address
    pub address: String,

    /// Kubernetes node name, resolved when the entry is enqueued
    #[serde(default)]
    pub nodename: String,

    /// Requested operation
    pub operation: String,
    /// Machine type selecting the procedure
    pub machine_type: String,

    /// Serial number of the machine
    #[serde(default)]
    pub serial: String,

    /// Progress of the entry
    #[serde(default)]
    pub status: RepairStatus,

    /// Index of the current step
    #[serde(default)]
    pub step: usize,

    /// Progress within the current step
    #[serde(default)]
    pub step_status: RepairStepStatus,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Consecutive failed drains
    #[serde(default)]
    pub drain_backoff_count: u32,

    /// Earliest time of the next drain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_backoff_expire: Option<DateTime<Utc>>,

    /// Marked for removal by an operator
    #[serde(default)]
    pub deleted: bool,
}

impl RepairQueueEntry {
    /// New queued entry; the index is assigned on enqueue
    #[must_use]
    pub fn new(operation: &str, machine_type: &str, address: &str, serial: &str) -> Self {
        Self {
            index: 0,
            address: address.to_string(),
            nodename: String::new(),
            operation: operation.to_string(),
            machine_type: machine_type.to_string(),
            serial: serial.to_string(),
            status: RepairStatus::Queued,
            step: 0,
            step_status: RepairStepStatus::Waiting,
            last_transition_time: None,
            drain_backoff_count: 0,
            drain_backoff_expire: None,
            deleted: false,
        }
    }

    /// Succeeded or failed
    #[must_use]
    pub fn has_finished(&self) -> bool {
        matches!(self.status, RepairStatus::Succeeded | RepairStatus::Failed)
    }

    /// Processing and currently holding the node drained or watched
    #[must_use]
    pub fn is_holding_node(&self) -> bool {
        self.status == RepairStatus::Processing
            && matches!(
                self.step_status,
                RepairStepStatus::Draining | RepairStepStatus::Watching
            )
    }

    /// Whether a backed-off drain may be retried at `now`
    #[must_use]
    pub fn backoff_expired(&self, now: DateTime<Utc>) -> bool {
        self.drain_backoff_expire.is_none_or(|t| t <= now)
    }

    /// Operation matching this entry's machine type and operation name
    pub fn get_matched_operation<'a>(&self, spec: &'a RepairSpec) -> Result<&'a RepairOperation> {
        let procedure = spec
            .repair_procedures
            .iter()
            .find(|p| p.machine_types.iter().any(|t| t == &self.machine_type))
            .ok_or_else(|| SpecError::NoRepairProcedure {
                machine_type: self.machine_type.clone(),
            })?;

        procedure
            .repair_operations
            .iter()
            .find(|o| o.operation == self.operation)
            .ok_or_else(|| SpecError::NoRepairOperation {
                machine_type: self.machine_type.clone(),
                operation: self.operation.clone(),
            })
    }

    /// Step at `self.step`, or `None` once the steps are exhausted
    pub fn get_current_repair_step<'a>(&self, spec: &'a RepairSpec) -> Result<Option<&'a RepairStep>> {
        let operation = self.get_matched_operation(spec)?;
        Ok(operation.repair_steps.get(self.step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RepairSpec {
        RepairSpec {
            repair_procedures: vec![RepairProcedure {
                machine_types: vec!["type1".to_string(), "type2".to_string()],
                repair_operations: vec![RepairOperation {
                    operation: "op1".to_string(),
                    repair_steps: vec![
                        RepairStep {
                            repair_command: vec!["touch".to_string(), "/tmp/repair-done".to_string()],
                            need_drain: true,
                            watch_seconds: 300,
                            ..Default::default()
                        },
                        RepairStep {
                            repair_command: vec!["power-cycle".to_string()],
                            watch_seconds: 600,
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_get_current_repair_step() {
        let spec = spec();
        let mut entry = RepairQueueEntry::new("op1", "type2", "10.0.0.15", "SN1234");

        let step = entry.get_current_repair_step(&spec).unwrap().unwrap();
        assert!(step.need_drain);

        entry.step = 1;
        let step = entry.get_current_repair_step(&spec).unwrap().unwrap();
        assert_eq!(step.watch_seconds, 600);

        entry.step = 2;
        assert!(entry.get_current_repair_step(&spec).unwrap().is_none());
    }

    #[test]
    fn test_unknown_operation_or_type() {
        let spec = spec();
        let entry = RepairQueueEntry::new("op9", "type1", "10.0.0.15", "SN1234");
        assert!(matches!(
            entry.get_current_repair_step(&spec),
            Err(SpecError::NoRepairOperation { .. })
        ));

        let entry = RepairQueueEntry::new("op1", "type9", "10.0.0.15", "SN1234");
        assert!(matches!(
            entry.get_matched_operation(&spec),
            Err(SpecError::NoRepairProcedure { .. })
        ));
    }

    #[test]
    fn test_entry_round_trip() {
        let mut entry = RepairQueueEntry::new("op1", "type1", "10.0.0.15", "SN1234");
        entry.index = 3;
        entry.status = RepairStatus::Processing;
        entry.step_status = RepairStepStatus::Watching;
        entry.last_transition_time = Some(Utc::now());

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: RepairQueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
        assert!(parsed.is_holding_node());
    }
}
