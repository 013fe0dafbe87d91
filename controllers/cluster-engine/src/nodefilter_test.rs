use super::*;
use crate::testing::{address, bare_node, cluster, kube_node, member, set, steady_status};
use cluster_spec::names::ANNOTATION_REBOOT;
use std::collections::BTreeMap;

#[test]
fn test_steady_cluster_has_nothing_to_do() {
    let cluster = cluster(3, 3);
    let status = steady_status(&cluster);
    let filter = NodeFilter::new(&cluster, &status);

    for service in [SystemService::Rivers, SystemService::EtcdRivers]
        .into_iter()
        .chain(SystemService::KUBERNETES)
    {
        assert!(filter.service_stopped_nodes(service).is_empty(), "{service:?} stopped");
        assert!(filter.service_outdated_nodes(service).is_empty(), "{service:?} outdated");
    }
    assert!(filter.etcd_bootstrapped());
    assert!(filter.etcd_stopped_members().is_empty());
    assert!(filter.etcd_new_members().is_empty());
    assert!(filter.etcd_outdated_members().is_empty());
    assert!(filter.outdated_kube_nodes().is_empty());
    assert!(filter.non_cluster_kube_nodes().is_empty());
    assert!(filter.demoted_control_planes().is_empty());
    assert_eq!(filter.healthy_api_server().map(|n| n.address.clone()), Some(address(1)));
}

#[test]
fn test_unreachable_nodes_are_not_targeted() {
    let cluster = cluster(1, 2);
    let mut status = steady_status(&cluster);
    status.nodes.remove(&address(2));
    status.nodes.get_mut(&address(3)).unwrap().rivers.running = false;
    let filter = NodeFilter::new(&cluster, &status);

    assert!(!filter.is_reachable(&address(2)));
    assert_eq!(filter.unreachable_nodes().len(), 1);
    let stopped = filter.service_stopped_nodes(SystemService::Rivers);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].address, address(3));
}

#[test]
fn test_control_plane_services_wait_for_marked_member() {
    let cluster = cluster(3, 0);
    let mut status = steady_status(&cluster);
    for n in [2, 3] {
        status.nodes.get_mut(&address(n)).unwrap().api_server.running = false;
    }
    status.nodes.get_mut(&address(3)).unwrap().etcd.is_added_member = false;
    let filter = NodeFilter::new(&cluster, &status);

    let stopped = filter.service_stopped_nodes(SystemService::ApiServer);
    assert_eq!(stopped.iter().map(|n| n.address.clone()).collect::<Vec<_>>(), vec![address(2)]);
}

#[test]
fn test_outdated_service_is_detected_from_image() {
    let cluster = cluster(1, 1);
    let mut status = steady_status(&cluster);
    status.nodes.get_mut(&address(2)).unwrap().proxy.image = "old".to_string();
    let filter = NodeFilter::new(&cluster, &status);

    let outdated = filter.service_outdated_nodes(SystemService::Proxy);
    assert_eq!(outdated.len(), 1);
    assert_eq!(outdated[0].address, address(2));
}

#[test]
fn test_cold_cluster_is_not_bootstrapped() {
    let cluster = cluster(3, 0);
    let mut status = steady_status(&cluster);
    for node in status.nodes.values_mut() {
        *node = bare_node();
    }
    let filter = NodeFilter::new(&cluster, &status);
    assert!(!filter.etcd_bootstrapped());
    assert_eq!(filter.service_stopped_nodes(SystemService::EtcdRivers).len(), 3);
    // no member is marked yet
    assert!(filter.service_stopped_nodes(SystemService::ApiServer).is_empty());
}

#[test]
fn test_stopped_member_needs_data_and_marker() {
    let cluster = cluster(3, 0);
    let mut status = steady_status(&cluster);
    status.nodes.get_mut(&address(1)).unwrap().etcd.service.running = false;
    let node3 = status.nodes.get_mut(&address(3)).unwrap();
    node3.etcd.service.running = false;
    node3.etcd.has_data = false;
    let filter = NodeFilter::new(&cluster, &status);

    let stopped = filter.etcd_stopped_members();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].address, address(1));
}

#[test]
fn test_membership_queries() {
    let cluster = cluster(2, 1);
    let mut status = steady_status(&cluster);
    // a departed node, a worker and an unstarted control plane
    status.etcd.members.insert("10.0.0.99".to_string(), member(9, "10.0.0.99"));
    status.etcd.in_sync_members.insert("10.0.0.99".to_string(), false);
    status.etcd.members.insert(address(3), member(7, &address(3)));
    status.etcd.in_sync_members.insert(address(3), true);
    let unstarted = EtcdMember {
        name: String::new(),
        ..member(5, &address(2))
    };
    status.etcd.members.insert(address(2), unstarted);
    let filter = NodeFilter::new(&cluster, &status);

    assert_eq!(filter.etcd_non_cluster_members(false), vec![("10.0.0.99".to_string(), 9)]);
    assert!(filter.etcd_non_cluster_members(true).is_empty());
    assert_eq!(filter.etcd_worker_members(true), vec![(address(3), 7)]);
    let unstarted = filter.etcd_unstarted_members();
    assert_eq!(unstarted.len(), 1);
    assert_eq!(unstarted[0].address, address(2));
}

#[test]
fn test_new_and_unmarked_members() {
    let cluster = cluster(3, 0);
    let mut status = steady_status(&cluster);
    status.etcd.members.remove(&address(3));
    status.etcd.in_sync_members.remove(&address(3));
    status.nodes.get_mut(&address(2)).unwrap().etcd.is_added_member = false;
    let filter = NodeFilter::new(&cluster, &status);

    let new = filter.etcd_new_members();
    assert_eq!(new.len(), 1);
    assert_eq!(new[0].address, address(3));
    assert_eq!(filter.etcd_unmarked_members(), vec![address(2)]);
}

#[test]
fn test_held_nodes_are_not_ready_endpoints() {
    let cluster = cluster(3, 0);
    let mut status = steady_status(&cluster);
    status.nodes.get_mut(&address(3)).unwrap().api_server.is_healthy = false;
    let filter = NodeFilter::new(&cluster, &status);

    let endpoints = filter.master_endpoint_addresses(&set(&["10.0.0.12"]));
    assert_eq!(endpoints.ready, vec![address(1)]);
    assert_eq!(endpoints.not_ready, vec![address(2)]);

    let etcd = filter.etcd_endpoint_addresses(&BTreeSet::new());
    assert_eq!(etcd.ready.len(), 3);
    assert!(etcd.not_ready.is_empty());
}

#[test]
fn test_kube_node_drift_and_removal() {
    let mut cluster = cluster(1, 1);
    let mut status = steady_status(&cluster);
    let stranger = Node {
        address: "10.0.0.99".to_string(),
        hostname: "stranger".to_string(),
        ..Default::default()
    };
    status.kubernetes.nodes.push(kube_node(&cluster, &stranger));
    cluster.nodes[1].labels = BTreeMap::from([("rack".to_string(), "r1".to_string())]);
    let filter = NodeFilter::new(&cluster, &status);

    let outdated = filter.outdated_kube_nodes();
    assert_eq!(outdated.len(), 1);
    assert_eq!(outdated[0].0.address, address(2));
    assert_eq!(filter.non_cluster_kube_nodes(), vec!["stranger".to_string()]);
}

#[test]
fn test_demoted_control_plane() {
    let cluster = cluster(1, 1);
    let mut status = steady_status(&cluster);
    status.nodes.get_mut(&address(2)).unwrap().etcd.service.running = true;
    let filter = NodeFilter::new(&cluster, &status);
    assert_eq!(filter.demoted_control_planes(), vec![address(2)]);
}

#[test]
fn test_cordoned_nodes_skip_held() {
    let cluster = cluster(1, 2);
    let mut status = steady_status(&cluster);
    for node in status.kubernetes.nodes.iter_mut().skip(1) {
        node.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_REBOOT.to_string(), "reboot".to_string());
    }
    let filter = NodeFilter::new(&cluster, &status);

    assert_eq!(filter.cordoned_nodes(&set(&["10.0.0.12"])), vec!["node3".to_string()]);
    assert_eq!(filter.cordoned_nodes(&BTreeSet::new()).len(), 2);
}
