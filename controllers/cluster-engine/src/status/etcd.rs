use super::{EtcdClusterStatus, NodeStatus};
use crate::etcd_admin::client_url;
use crate::infrastructure::Infrastructure;
use cluster_spec::Cluster;
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Query membership and health of the managed etcd cluster
///
/// Connects through the control plane nodes that run etcd. A member is in
/// sync when its own revision has reached the revision observed when the
/// health lease was granted.
pub async fn gather_etcd(
    inf: &Infrastructure,
    cluster: &Cluster,
    nodes: &BTreeMap<String, NodeStatus>,
) -> EtcdClusterStatus {
    let endpoints: Vec<String> = cluster
        .control_plane()
        .filter(|n| nodes.get(&n.address).is_some_and(|s| s.etcd.service.running))
        .map(|n| client_url(&n.address))
        .collect();
    if endpoints.is_empty() {
        return EtcdClusterStatus::default();
    }

    let etcd = match inf.etcd(&endpoints).await {
        Ok(etcd) => etcd,
        Err(e) => {
            warn!("Failed to connect to etcd: {}", e);
            return EtcdClusterStatus::default();
        }
    };

    let members = match etcd.member_list().await {
        Ok(members) => members,
        Err(e) => {
            warn!("Failed to list etcd members: {}", e);
            return EtcdClusterStatus::default();
        }
    };
    let members: BTreeMap<String, _> = members.into_iter().map(|m| (m.member_name(), m)).collect();

    let revision = match etcd.grant_revision().await {
        Ok(revision) => revision,
        Err(e) => {
            warn!("etcd cluster is unhealthy: {}", e);
            let in_sync_members = members.keys().map(|name| (name.clone(), false)).collect();
            return EtcdClusterStatus {
                is_healthy: false,
                members,
                in_sync_members,
            };
        }
    };

    let checks = members.iter().map(|(name, member)| {
        let etcd = &etcd;
        let endpoint = member
            .client_urls
            .first()
            .cloned()
            .unwrap_or_else(|| client_url(name));
        async move {
            let in_sync = match etcd.endpoint_revision(&endpoint).await {
                Ok(rev) => rev >= revision,
                Err(e) => {
                    debug!("Member {} did not answer: {}", name, e);
                    false
                }
            };
            (name.clone(), in_sync)
        }
    });
    let in_sync_members = join_all(checks).await.into_iter().collect();

    EtcdClusterStatus {
        is_healthy: true,
        members,
        in_sync_members,
    }
}
