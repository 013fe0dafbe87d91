//! Reboot queue decisions.
//!
//! [`decide_reboot_args`] sorts queue entries into the sets the reboot
//! operators act on. The boot check is the only I/O and runs beforehand in
//! [`check_boot`].

use crate::infrastructure::Infrastructure;
use crate::nodefilter::NodeFilter;
use crate::op::Operator;
use crate::op::reboot::{self as ops, RebootTarget};
use crate::status::ClusterStatus;
use chrono::{DateTime, Utc};
use cluster_spec::{
    Cluster, Constraints, Node, RebootQueueEntry, RebootStatus, RepairQueueEntry, RepairStatus,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout of one boot check
pub const BOOT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Entries grouped by what happens to them this pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootArgs {
    /// Queued entries whose drain starts now
    pub newly_drained: Vec<RebootQueueEntry>,
    /// Draining entries with nothing left to evict
    pub drain_completed: Vec<RebootQueueEntry>,
    /// Draining entries past the eviction timeout
    pub drain_timedout: Vec<RebootQueueEntry>,
    /// Rebooted entries, or entries of removed nodes
    pub reboot_dequeued: Vec<RebootQueueEntry>,
    /// Cancelled entries to remove from the queue
    pub reboot_cancelled: Vec<RebootQueueEntry>,
}

impl RebootArgs {
    /// Whether nothing needs to be done
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.newly_drained.is_empty()
            && self.drain_completed.is_empty()
            && self.drain_timedout.is_empty()
            && self.reboot_dequeued.is_empty()
            && self.reboot_cancelled.is_empty()
    }

    /// Addresses held out of service by the reboot queue this pass
    #[must_use]
    pub fn held_nodes(&self, entries: &[RebootQueueEntry]) -> BTreeSet<String> {
        entries
            .iter()
            .filter(|e| e.is_active())
            .chain(&self.newly_drained)
            .map(|e| e.node.clone())
            .collect()
    }
}

/// Run the boot check for every rebooting entry and return the nodes that are back
pub async fn check_boot(inf: &Infrastructure, cluster: &Cluster, entries: &[RebootQueueEntry]) -> BTreeSet<String> {
    let mut booted = BTreeSet::new();
    if cluster.reboot.boot_check_command.is_empty() {
        return booted;
    }
    for entry in entries.iter().filter(|e| e.status == RebootStatus::Rebooting) {
        let since = entry.last_transition_time.map_or(0, |t| t.timestamp());
        let mut argv = cluster.reboot.boot_check_command.clone();
        argv.push(entry.node.clone());
        argv.push(since.to_string());
        match inf.run_local(&argv, BOOT_CHECK_TIMEOUT).await {
            Ok(stdout) if stdout.trim_end_matches('\n') == "true" => {
                booted.insert(entry.node.clone());
            }
            Ok(stdout) => debug!("Node {} not booted yet: {}", entry.node, stdout.trim_end()),
            Err(e) => warn!("Boot check of {} failed: {}", entry.node, e),
        }
    }
    booted
}

fn is_api_server(cluster: &Cluster, address: &str) -> bool {
    cluster.node(address).is_some_and(|n| n.control_plane)
}

/// Pick queued entries whose drain may start
///
/// API servers go one at a time and never together with workers; nothing
/// new starts while an API server is draining or rebooting.
#[must_use]
pub fn choose_drained_nodes(
    cluster: &Cluster,
    entries: &[RebootQueueEntry],
    repairs: &[RepairQueueEntry],
    now: DateTime<Utc>,
) -> Vec<RebootQueueEntry> {
    let max = cluster.reboot.max_concurrent_reboots();
    let in_progress: Vec<&RebootQueueEntry> = entries.iter().filter(|e| e.is_active()).collect();
    if in_progress.iter().any(|e| is_api_server(cluster, &e.node)) || in_progress.len() >= max {
        return Vec::new();
    }
    let api_server_repairing = repairs
        .iter()
        .any(|r| r.status == RepairStatus::Processing && !r.deleted && is_api_server(cluster, &r.address));

    let (api_servers, workers): (Vec<&RebootQueueEntry>, Vec<&RebootQueueEntry>) = entries
        .iter()
        .filter(|e| e.status == RebootStatus::Queued && e.backoff_expired(now))
        .filter(|e| cluster.node(&e.node).is_some())
        .partition(|e| is_api_server(cluster, &e.node));

    if in_progress.is_empty() && !api_server_repairing {
        if let Some(first) = api_servers.first() {
            return vec![(*first).clone()];
        }
    }
    workers
        .into_iter()
        .take(max - in_progress.len())
        .cloned()
        .collect()
}

fn past(since: Option<DateTime<Utc>>, timeout: Duration, now: DateTime<Utc>) -> bool {
    let Some(since) = since else {
        return false;
    };
    chrono::Duration::from_std(timeout).is_ok_and(|t| since + t < now)
}

/// Sort the reboot queue into this pass's work
#[must_use]
pub fn decide_reboot_args(
    cluster: &Cluster,
    status: &ClusterStatus,
    constraints: &Constraints,
    booted: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> RebootArgs {
    let queue = &status.reboot_queue;
    let mut args = RebootArgs::default();

    for entry in &queue.entries {
        if entry.status == RebootStatus::Cancelled {
            args.reboot_cancelled.push(entry.clone());
            continue;
        }
        if cluster.node(&entry.node).is_none() {
            args.reboot_dequeued.push(entry.clone());
            continue;
        }
        match entry.status {
            RebootStatus::Rebooting if booted.contains(&entry.node) => {
                args.reboot_dequeued.push(entry.clone());
            }
            RebootStatus::Draining if queue.drain_completed.contains(&entry.node) => {
                args.drain_completed.push(entry.clone());
            }
            RebootStatus::Draining
                if past(entry.last_transition_time, cluster.reboot.eviction_timeout(), now) =>
            {
                args.drain_timedout.push(entry.clone());
            }
            _ => {}
        }
    }

    if !queue.enabled {
        return args;
    }
    let filter = NodeFilter::new(cluster, status);
    let unreachable = filter
        .unreachable_nodes()
        .iter()
        .filter(|n| !queue.entries.iter().any(|e| e.is_active() && e.node == n.address))
        .count();
    if unreachable > constraints.reboot_maximum_unreachable {
        warn!(
            "{} nodes are unreachable (maximum {}), not starting reboots",
            unreachable, constraints.reboot_maximum_unreachable
        );
        return args;
    }
    args.newly_drained = choose_drained_nodes(cluster, &queue.entries, &status.repair_queue.entries, now);
    args
}

fn targets(cluster: &Cluster, entries: &[RebootQueueEntry]) -> Vec<RebootTarget> {
    entries.iter().map(|e| RebootTarget::new(cluster, e)).collect()
}

/// Operators for the reboot queue, in execution order
#[must_use]
pub fn reboot_ops(cluster: &Cluster, api_server: &Node, args: &RebootArgs) -> Vec<Box<dyn Operator>> {
    let mut ops: Vec<Box<dyn Operator>> = Vec::new();
    if !args.reboot_cancelled.is_empty() {
        ops.push(ops::cancel(args.reboot_cancelled.clone()));
    }
    if !args.reboot_dequeued.is_empty() {
        ops.push(ops::dequeue(args.reboot_dequeued.clone()));
    }
    if !args.drain_completed.is_empty() {
        let completed = targets(cluster, &args.drain_completed);
        ops.push(ops::delete_daemonset_pods(api_server.clone(), completed.clone()));
        ops.push(ops::reboot(cluster.reboot.clone(), completed));
    }
    if !args.newly_drained.is_empty() {
        ops.push(ops::drain_start(
            api_server.clone(),
            cluster.reboot.clone(),
            targets(cluster, &args.newly_drained),
        ));
    }
    if !args.drain_timedout.is_empty() {
        ops.push(ops::drain_timeout(args.drain_timedout.clone()));
    }
    ops
}

#[cfg(test)]
#[path = "reboot_test.rs"]
mod reboot_test;
