//! The decision function of the reconcile loop.
//!
//! [`decide`] looks at the declared cluster and one status snapshot and
//! returns the operators of the first phase that has work, so every pass
//! repairs one kind of thing. It performs no I/O.

use crate::nodefilter::NodeFilter;
use crate::op::etcd::{self as etcd_ops, MemberAddConfig};
use crate::op::k8s::{
    self as k8s_ops, apply_object, etcd_endpoint_slice, etcd_endpoints, etcd_service_is_current,
    master_endpoint_slice, master_endpoints, observed_endpoints, observed_slice,
};
use crate::op::dns::{
    cluster_dns_config_map, cluster_dns_op, config_map_data, node_dns_config_map, node_dns_op,
    upstream_servers,
};
use crate::op::params::SystemService;
use crate::op::{Operator, services};
use crate::reboot::{RebootArgs, reboot_ops};
use crate::repair::{self, repair_ops};
use crate::status::ClusterStatus;
use chrono::{DateTime, Utc};
use cluster_spec::names::{CLUSTER_DNS_CONFIG_KEY, CONFIG_VERSION, NODE_DNS_CONFIG_KEY};
use cluster_spec::{Cluster, Constraints, Node, OperationPhase, ResourceDefinition};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether the cluster is ready for Deployments
pub type Readiness = fn(&Cluster, &ClusterStatus) -> bool;

/// At least half of the declared nodes are Ready in Kubernetes
#[must_use]
pub fn half_nodes_ready(cluster: &Cluster, status: &ClusterStatus) -> bool {
    let ready = cluster
        .nodes
        .iter()
        .filter(|n| {
            status
                .kubernetes
                .node(n.nodename())
                .is_some_and(crate::k8s::node_is_ready)
        })
        .count();
    ready * 2 >= cluster.nodes.len()
}

/// Tunables of [`decide`]
#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    /// Upper bound of nodes one boot or restart operator touches
    pub max_concurrent_updates: usize,
    /// Decides whether the cluster is ready for Deployments
    pub readiness: Readiness,
    /// Settings of the add-member commander
    pub member_add: MemberAddConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_updates: 10,
            readiness: half_nodes_ready,
            member_add: MemberAddConfig::default(),
        }
    }
}

/// Everything [`decide`] reads besides the cluster and its status
#[derive(Debug, Clone, Copy)]
pub struct DecideInput<'a> {
    /// Cluster constraints
    pub constraints: &'a Constraints,
    /// Static and user resources, in apply order
    pub resources: &'a [ResourceDefinition],
    /// Reboot queue decisions
    pub reboot_args: &'a RebootArgs,
    /// Tunables
    pub config: &'a StrategyConfig,
    /// Time of the pass
    pub now: DateTime<Utc>,
}

type Ops = Vec<Box<dyn Operator>>;

/// Decide the operators of this pass and the phase they belong to
#[must_use]
pub fn decide(cluster: &Arc<Cluster>, status: &ClusterStatus, input: &DecideInput<'_>) -> (Ops, OperationPhase) {
    let filter = NodeFilter::new(cluster, status);
    let config = input.config;

    if status.config_version != CONFIG_VERSION {
        let nodes: Vec<&Node> = cluster.nodes.iter().collect();
        if !filter.all_reachable(&nodes) {
            warn!("Cannot upgrade from config version {}: nodes unreachable", status.config_version);
            return (Vec::new(), OperationPhase::UpgradeAborted);
        }
        let addresses = cluster.nodes.iter().map(|n| n.address.clone()).collect();
        return (vec![services::upgrade(addresses)], OperationPhase::Upgrade);
    }

    let ops = rivers_ops(cluster, &filter, config);
    if !ops.is_empty() {
        return (ops, OperationPhase::Rivers);
    }

    if !filter.etcd_bootstrapped() {
        let cps = filter.control_planes();
        if !filter.all_reachable(&cps) {
            warn!("Cannot bootstrap etcd: control planes unreachable");
            return (Vec::new(), OperationPhase::EtcdBootAborted);
        }
        let cps = cps.into_iter().cloned().collect();
        return (vec![etcd_ops::bootstrap(cluster, cps)], OperationPhase::EtcdBoot);
    }

    let stopped = filter.etcd_stopped_members();
    if !stopped.is_empty() {
        return (vec![etcd_ops::start(cluster, stopped)], OperationPhase::EtcdStart);
    }

    if !status.etcd.is_healthy {
        return (vec![etcd_ops::wait_cluster(cluster)], OperationPhase::EtcdWait);
    }

    let ops = k8s_start_ops(cluster, &filter, config);
    if !ops.is_empty() {
        return (ops, OperationPhase::K8sStart);
    }

    if let Some(op) = etcd_maintenance_op(cluster, status, &filter, config) {
        return (vec![op], OperationPhase::EtcdMaintain);
    }

    let held = held_nodes(status, input.reboot_args);
    let api_server = filter.healthy_api_server();

    if let Some(api_server) = api_server {
        let ops = k8s_maintenance_ops(cluster, status, &filter, api_server, input, &held);
        if !ops.is_empty() {
            return (ops, OperationPhase::K8sMaintain);
        }
    }

    let demoted = filter.demoted_control_planes();
    if !demoted.is_empty() {
        return (vec![services::stop_control_plane(demoted)], OperationPhase::StopControlPlane);
    }

    if let Some(api_server) = api_server {
        let cordoned = filter.cordoned_nodes(&held);
        if !cordoned.is_empty() {
            return (
                vec![crate::op::reboot::uncordon(api_server.clone(), cordoned)],
                OperationPhase::UncordonNodes,
            );
        }
    }

    if !status.etcd.is_good() {
        debug!("etcd is not in sync, skipping repairs and reboots");
        return (Vec::new(), OperationPhase::Completed);
    }

    let ops = repair_ops(cluster, status, input.constraints, api_server, input.now);
    if !ops.is_empty() {
        return (ops, OperationPhase::RepairMachines);
    }

    if let Some(api_server) = api_server {
        let ops = reboot_ops(cluster, api_server, input.reboot_args);
        if !ops.is_empty() {
            return (ops, OperationPhase::RebootNodes);
        }
    }

    (Vec::new(), OperationPhase::Completed)
}

fn held_nodes(status: &ClusterStatus, reboot_args: &RebootArgs) -> BTreeSet<String> {
    let mut held = reboot_args.held_nodes(&status.reboot_queue.entries);
    held.extend(repair::held_nodes(&status.repair_queue.entries));
    held
}

fn bounded(mut nodes: Vec<Node>, max: usize) -> Vec<Node> {
    nodes.truncate(max.max(1));
    nodes
}

fn service_ops(cluster: &Arc<Cluster>, filter: &NodeFilter<'_>, service: SystemService, max: usize) -> Ops {
    let mut ops = Vec::new();
    let stopped = filter.service_stopped_nodes(service);
    if !stopped.is_empty() {
        ops.push(services::bootstrap(cluster, service, bounded(stopped, max)));
    }
    let outdated = filter.service_outdated_nodes(service);
    if !outdated.is_empty() {
        let max = if service == SystemService::ApiServer { 1 } else { max };
        ops.push(services::restart(cluster, service, bounded(outdated, max)));
    }
    ops
}

fn rivers_ops(cluster: &Arc<Cluster>, filter: &NodeFilter<'_>, config: &StrategyConfig) -> Ops {
    [SystemService::Rivers, SystemService::EtcdRivers]
        .into_iter()
        .flat_map(|service| service_ops(cluster, filter, service, config.max_concurrent_updates))
        .collect()
}

fn k8s_start_ops(cluster: &Arc<Cluster>, filter: &NodeFilter<'_>, config: &StrategyConfig) -> Ops {
    SystemService::KUBERNETES
        .into_iter()
        .flat_map(|service| service_ops(cluster, filter, service, config.max_concurrent_updates))
        .collect()
}

/// One membership change at a time; only a re-invite and removal of
/// out-of-sync members proceed while the cluster is not in sync
fn etcd_maintenance_op(
    cluster: &Arc<Cluster>,
    status: &ClusterStatus,
    filter: &NodeFilter<'_>,
    config: &StrategyConfig,
) -> Option<Box<dyn Operator>> {
    let broken = filter.etcd_non_cluster_members(false);
    if !broken.is_empty() {
        return Some(etcd_ops::remove_member(cluster, broken));
    }
    if let Some((address, id)) = filter.etcd_worker_members(false).into_iter().next() {
        return Some(etcd_ops::destroy_member(cluster, &address, vec![(address.clone(), id)]));
    }
    if let Some(node) = filter.etcd_unstarted_members().into_iter().next() {
        return Some(etcd_ops::add_member(cluster, node, config.member_add));
    }

    if !status.etcd.is_good() {
        debug!("etcd is not in sync, skipping membership changes");
        return None;
    }

    let unmarked = filter.etcd_unmarked_members();
    if !unmarked.is_empty() {
        return Some(etcd_ops::mark_member(cluster, unmarked));
    }
    let removed = filter.etcd_non_cluster_members(true);
    if !removed.is_empty() {
        return Some(etcd_ops::remove_member(cluster, removed));
    }
    if let Some((address, id)) = filter.etcd_worker_members(true).into_iter().next() {
        return Some(etcd_ops::destroy_member(cluster, &address, vec![(address.clone(), id)]));
    }
    if let Some(node) = filter.etcd_new_members().into_iter().next() {
        return Some(etcd_ops::add_member(cluster, node, config.member_add));
    }
    filter
        .etcd_outdated_members()
        .into_iter()
        .next()
        .map(|node| etcd_ops::restart(cluster, node))
}

fn config_map_op(
    current: Option<&ConfigMap>,
    desired: ConfigMap,
    key: &str,
    op: fn(Node, bool, ConfigMap) -> Box<dyn Operator>,
    api_server: &Node,
) -> Option<Box<dyn Operator>> {
    match current {
        None => Some(op(api_server.clone(), false, desired)),
        Some(current) if config_map_data(current, key) != config_map_data(&desired, key) => {
            Some(op(api_server.clone(), true, desired))
        }
        Some(_) => None,
    }
}

fn endpoints_op(name: &str, api_server: &Node, current: Option<&Endpoints>, desired: Endpoints) -> Option<Box<dyn Operator>> {
    match current {
        None => Some(apply_object(&format!("create-{name}"), api_server.clone(), desired)),
        Some(current) if !observed_endpoints(current).same_as(&observed_endpoints(&desired)) => {
            Some(apply_object(&format!("update-{name}"), api_server.clone(), desired))
        }
        Some(_) => None,
    }
}

fn slice_op(
    name: &str,
    api_server: &Node,
    current: Option<&EndpointSlice>,
    desired: EndpointSlice,
) -> Option<Box<dyn Operator>> {
    match current {
        None => Some(apply_object(&format!("create-{name}"), api_server.clone(), desired)),
        Some(current) if !observed_slice(current).same_as(&observed_slice(&desired)) => {
            Some(apply_object(&format!("update-{name}"), api_server.clone(), desired))
        }
        Some(_) => None,
    }
}

fn k8s_maintenance_ops(
    cluster: &Arc<Cluster>,
    status: &ClusterStatus,
    filter: &NodeFilter<'_>,
    api_server: &Node,
    input: &DecideInput<'_>,
    held: &BTreeSet<String>,
) -> Ops {
    let ks = &status.kubernetes;
    if !ks.is_control_plane_ready {
        return vec![k8s_ops::wait_kubernetes(api_server.clone())];
    }

    let mut ops: Ops = Vec::new();
    let deployments_allowed = (input.config.readiness)(cluster, status);
    for resource in input.resources {
        if resource.kind == "Deployment" && !deployments_allowed {
            continue;
        }
        if resource.need_update(ks.resource_statuses.get(&resource.key)) {
            ops.push(k8s_ops::resource_apply(
                api_server.clone(),
                resource.clone(),
                cluster.trusted_rest_mappings.clone(),
            ));
        }
    }

    let domain = &cluster.options.kubelet.domain;
    let upstreams = upstream_servers(&cluster.dns_servers, ks.dns_service.as_ref());
    ops.extend(config_map_op(
        ks.cluster_dns.config_map.as_ref(),
        cluster_dns_config_map(domain, &upstreams),
        CLUSTER_DNS_CONFIG_KEY,
        cluster_dns_op,
        api_server,
    ));
    if !ks.cluster_dns.cluster_ip.is_empty() {
        ops.extend(config_map_op(
            ks.node_dns.config_map.as_ref(),
            node_dns_config_map(domain, &ks.cluster_dns.cluster_ip, &upstreams),
            NODE_DNS_CONFIG_KEY,
            node_dns_op,
            api_server,
        ));
    }

    let master = filter.master_endpoint_addresses(held);
    ops.extend(endpoints_op("endpoints", api_server, ks.master_endpoints.as_ref(), master_endpoints(&master)));
    ops.extend(slice_op(
        "endpointslice",
        api_server,
        ks.master_endpoint_slice.as_ref(),
        master_endpoint_slice(&master),
    ));

    match ks.etcd_service.as_ref() {
        None => ops.push(k8s_ops::etcd_service_op(api_server.clone(), false)),
        Some(service) if !etcd_service_is_current(service) => {
            ops.push(k8s_ops::etcd_service_op(api_server.clone(), true));
        }
        Some(_) => {}
    }
    let etcd = filter.etcd_endpoint_addresses(held);
    ops.extend(endpoints_op("etcd-endpoints", api_server, ks.etcd_endpoints.as_ref(), etcd_endpoints(&etcd)));
    ops.extend(slice_op(
        "etcd-endpointslice",
        api_server,
        ks.etcd_endpoint_slice.as_ref(),
        etcd_endpoint_slice(&etcd),
    ));

    let outdated: Vec<_> = filter
        .outdated_kube_nodes()
        .into_iter()
        .map(|(node, current)| k8s_ops::desired_node(cluster, node, current))
        .collect();
    if !outdated.is_empty() {
        ops.push(k8s_ops::update_node(api_server.clone(), outdated));
    }
    let removed = filter.non_cluster_kube_nodes();
    if !removed.is_empty() {
        ops.push(k8s_ops::remove_node(api_server.clone(), removed));
    }
    ops
}

#[cfg(test)]
#[path = "strategy_test.rs"]
mod strategy_test;
