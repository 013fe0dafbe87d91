//! Repair queue decisions.
//!
//! Processing entries are served before queued ones and API servers before
//! other machines. At most one API server is repaired at a time and never
//! while an API server reboots.

use crate::op::Operator;
use crate::op::repair as ops;
use crate::status::ClusterStatus;
use chrono::{DateTime, Utc};
use cluster_spec::{
    Cluster, Constraints, Node, RebootQueueEntry, RepairQueueEntry, RepairStatus, RepairStepStatus,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

fn is_api_server(cluster: &Cluster, address: &str) -> bool {
    cluster.node(address).is_some_and(|n| n.control_plane)
}

fn elapsed(since: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    let Some(since) = since else {
        return true;
    };
    chrono::Duration::from_std(window).is_ok_and(|w| since + w <= now)
}

/// Entries to act on this pass, in priority order
fn select_entries<'a>(
    cluster: &Cluster,
    entries: &'a [RepairQueueEntry],
    reboots: &[RebootQueueEntry],
    constraints: &Constraints,
    now: DateTime<Utc>,
) -> Vec<&'a RepairQueueEntry> {
    let live: Vec<&RepairQueueEntry> = entries
        .iter()
        .filter(|e| !e.deleted && !e.has_finished())
        .collect();

    let (processing, queued): (Vec<&RepairQueueEntry>, Vec<&RepairQueueEntry>) = live
        .iter()
        .copied()
        .partition(|e| e.status == RepairStatus::Processing);

    let api_server_rebooting = reboots
        .iter()
        .any(|r| r.is_active() && is_api_server(cluster, &r.node));

    let max = cluster.repair.max_concurrent_repairs();
    let mut selected = Vec::new();
    let mut api_servers = 0;

    let by_priority = |list: Vec<&'a RepairQueueEntry>| {
        let (api, other): (Vec<_>, Vec<_>) = list
            .into_iter()
            .partition(|e| is_api_server(cluster, &e.address));
        api.into_iter().chain(other)
    };

    for entry in by_priority(processing) {
        // A backed-off entry still holds its API server slot.
        if is_api_server(cluster, &entry.address) {
            api_servers += 1;
        }
        if entry.step_status == RepairStepStatus::Waiting && !entry.backoff_expired(now) {
            continue;
        }
        selected.push(entry);
    }

    if live.len() > constraints.maximum_repairs {
        warn!(
            "{} unfinished repairs exceed the maximum of {}, not starting new ones",
            live.len(),
            constraints.maximum_repairs
        );
        return selected;
    }

    let in_flight = live.len() - queued.len();
    let mut slots = max.saturating_sub(in_flight);
    for entry in by_priority(queued) {
        if slots == 0 {
            break;
        }
        if is_api_server(cluster, &entry.address) {
            if api_servers > 0 || api_server_rebooting {
                continue;
            }
            api_servers += 1;
        }
        selected.push(entry);
        slots -= 1;
    }
    selected
}

/// Operators for the repair queue
#[must_use]
pub fn repair_ops(
    cluster: &Cluster,
    status: &ClusterStatus,
    constraints: &Constraints,
    api_server: Option<&Node>,
    now: DateTime<Utc>,
) -> Vec<Box<dyn Operator>> {
    let queue = &status.repair_queue;
    let mut ops: Vec<Box<dyn Operator>> = Vec::new();

    let deleted: Vec<RepairQueueEntry> = queue.entries.iter().filter(|e| e.deleted).cloned().collect();
    if !deleted.is_empty() {
        ops.push(ops::dequeue(deleted));
    }

    for entry in select_entries(cluster, &queue.entries, &status.reboot_queue.entries, constraints, now) {
        if entry.status == RepairStatus::Processing && queue.repair_completed.contains(&entry.address) {
            ops.push(ops::finish(entry.clone(), true));
            continue;
        }
        if let Some(op) = entry_op(cluster, status, api_server, entry.clone(), now) {
            ops.push(op);
        }
    }
    ops
}

fn entry_op(
    cluster: &Cluster,
    status: &ClusterStatus,
    api_server: Option<&Node>,
    mut entry: RepairQueueEntry,
    now: DateTime<Utc>,
) -> Option<Box<dyn Operator>> {
    let queue = &status.repair_queue;
    let spec = &cluster.repair;
    let eviction_timeout = spec.eviction_timeout();

    loop {
        let step = match entry.get_current_repair_step(spec) {
            Ok(Some(step)) => step,
            Ok(None) => {
                info!("Repair of {} ran out of steps", entry.address);
                return Some(ops::finish(entry, false));
            }
            Err(e) => {
                warn!("Repair of {} has no procedure: {}", entry.address, e);
                return Some(ops::finish(entry, false));
            }
        };

        return match entry.step_status {
            RepairStepStatus::Waiting => {
                if !queue.enabled {
                    return None;
                }
                match (step.need_drain, cluster.node(&entry.address)) {
                    (true, Some(node)) => {
                        let api_server = api_server?;
                        let nodename = node.nodename().to_string();
                        Some(ops::drain_start(api_server.clone(), entry, nodename, spec.clone()))
                    }
                    _ => Some(ops::execute(entry, step.clone())),
                }
            }
            RepairStepStatus::Draining => {
                if !queue.enabled {
                    Some(ops::drain_timeout(entry))
                } else if queue.drain_completed.contains(&entry.address) {
                    Some(ops::execute(entry, step.clone()))
                } else if elapsed(entry.last_transition_time, eviction_timeout, now) {
                    Some(ops::drain_timeout(entry))
                } else {
                    None
                }
            }
            RepairStepStatus::Watching => {
                let watch = Duration::from_secs(step.watch_seconds);
                if !elapsed(entry.last_transition_time, watch, now) {
                    return None;
                }
                entry.step += 1;
                entry.step_status = RepairStepStatus::Waiting;
                continue;
            }
        };
    }
}

/// Addresses held out of service by the repair queue
#[must_use]
pub fn held_nodes(entries: &[RepairQueueEntry]) -> BTreeSet<String> {
    entries
        .iter()
        .filter(|e| !e.deleted && e.is_holding_node())
        .map(|e| e.address.clone())
        .collect()
}

#[cfg(test)]
#[path = "repair_test.rs"]
mod repair_test;
