//! Operators of the managed etcd membership.

use super::certs::FileSet;
use super::common::{
    ImagePull, MakeFiles, RunContainer, StopContainers, VolumeCreate, VolumeRemove, WAIT_TIMEOUT,
    WaitEtcd, addresses, sleep_or_cancel,
};
use super::params::{etcd_endpoints, etcd_opts, etcd_params, initial_cluster_member};
use super::{Commander, Operator, Sequence};
use crate::error::EngineError;
use crate::etcd_admin::peer_url;
use crate::infrastructure::Infrastructure;
use async_trait::async_trait;
use cluster_spec::images::ETCD_IMAGE;
use cluster_spec::names::ETCD_CONTAINER;
use cluster_spec::{Cluster, Command, Node};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait before `MemberAdd` so etcd accepts the membership change
pub const MEMBER_ADD_DELAY: Duration = Duration::from_secs(10);

/// Hook run right after `MemberAdd`; an error aborts the commander there
pub type FailureHook = fn() -> Result<(), EngineError>;

/// Tunables of the add-member commander
#[derive(Debug, Clone, Copy)]
pub struct MemberAddConfig {
    /// Wait after adding a member before starting it
    pub delay: Duration,
    /// Hook for failure injection in tests
    pub after_member_add: Option<FailureHook>,
}

impl Default for MemberAddConfig {
    fn default() -> Self {
        Self {
            delay: MEMBER_ADD_DELAY,
            after_member_add: None,
        }
    }
}

fn initial_cluster(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| initial_cluster_member(&n.address)).collect()
}

fn run_etcd(cluster: &Cluster, nodes: &[Node], initial: &[String], state: &str) -> RunContainer {
    RunContainer {
        name: ETCD_CONTAINER,
        image: ETCD_IMAGE,
        opts: etcd_opts(cluster),
        params: nodes
            .iter()
            .map(|n| (n.address.clone(), etcd_params(cluster, n, initial, state)))
            .collect(),
        extra: cluster.options.etcd.service.clone(),
    }
}

/// Build a new etcd cluster on every control plane node
#[must_use]
pub fn bootstrap(cluster: &Arc<Cluster>, nodes: Vec<Node>) -> Box<dyn Operator> {
    let targets = addresses(&nodes);
    let etcd = &cluster.options.etcd;
    Sequence::new("etcd-bootstrap", targets.clone())
        .then(ImagePull {
            nodes: targets.clone(),
            image: ETCD_IMAGE,
        })
        .then(VolumeCreate {
            nodes: targets.clone(),
            name: etcd.volume_name.clone(),
        })
        .then(MakeFiles {
            cluster: Arc::clone(cluster),
            nodes: nodes.clone(),
            set: FileSet::Etcd,
        })
        .then(run_etcd(cluster, &nodes, &initial_cluster(&nodes), "new"))
        .then(VolumeCreate {
            nodes: targets,
            name: etcd.marker_volume(),
        })
        .boxed()
}

/// Start stopped members that keep their data
#[must_use]
pub fn start(cluster: &Arc<Cluster>, nodes: Vec<Node>) -> Box<dyn Operator> {
    let targets = addresses(&nodes);
    let cps: Vec<Node> = cluster.control_plane().cloned().collect();
    Sequence::new("etcd-start", targets.clone())
        .then(ImagePull {
            nodes: targets,
            image: ETCD_IMAGE,
        })
        .then(MakeFiles {
            cluster: Arc::clone(cluster),
            nodes: nodes.clone(),
            set: FileSet::Etcd,
        })
        .then(run_etcd(cluster, &nodes, &initial_cluster(&cps), "existing"))
        .boxed()
}

/// Wait until the cluster grants a lease
#[must_use]
pub fn wait_cluster(cluster: &Cluster) -> Box<dyn Operator> {
    let endpoints = etcd_endpoints(cluster);
    Sequence::new("etcd-wait-cluster", endpoints.clone())
        .then(WaitEtcd {
            endpoints,
            timeout: WAIT_TIMEOUT,
        })
        .boxed()
}

/// Invite a node into the cluster, or re-invite an unstarted member
#[must_use]
pub fn add_member(cluster: &Arc<Cluster>, node: Node, config: MemberAddConfig) -> Box<dyn Operator> {
    let targets = vec![node.address.clone()];
    let etcd = &cluster.options.etcd;
    Sequence::new("etcd-add-member", targets.clone())
        .then(ImagePull {
            nodes: targets.clone(),
            image: ETCD_IMAGE,
        })
        .then(StopContainers {
            nodes: targets.clone(),
            names: vec![ETCD_CONTAINER],
            kill: false,
        })
        .then(VolumeRemove {
            nodes: targets.clone(),
            names: vec![etcd.volume_name.clone(), etcd.marker_volume()],
        })
        .then(VolumeCreate {
            nodes: targets,
            name: etcd.volume_name.clone(),
        })
        .then(MakeFiles {
            cluster: Arc::clone(cluster),
            nodes: vec![node.clone()],
            set: FileSet::Etcd,
        })
        .then(AddMember {
            cluster: Arc::clone(cluster),
            node,
            config,
        })
        .boxed()
}

/// Record that members joined the cluster
#[must_use]
pub fn mark_member(cluster: &Cluster, nodes: Vec<String>) -> Box<dyn Operator> {
    Sequence::new("etcd-mark-member", nodes.clone())
        .then(VolumeCreate {
            nodes,
            name: cluster.options.etcd.marker_volume(),
        })
        .boxed()
}

/// Remove members through the etcd API only
#[must_use]
pub fn remove_member(cluster: &Cluster, members: Vec<(String, u64)>) -> Box<dyn Operator> {
    let targets = members.iter().map(|(name, _)| name.clone()).collect();
    Sequence::new("etcd-remove-member", targets)
        .then(RemoveMembers {
            endpoints: etcd_endpoints(cluster),
            members,
        })
        .boxed()
}

/// Remove a member and wipe its container and data
#[must_use]
pub fn destroy_member(cluster: &Cluster, address: &str, members: Vec<(String, u64)>) -> Box<dyn Operator> {
    let targets = vec![address.to_string()];
    let etcd = &cluster.options.etcd;
    Sequence::new("etcd-destroy-member", targets.clone())
        .then(RemoveMembers {
            endpoints: etcd_endpoints(cluster),
            members,
        })
        .then(StopContainers {
            nodes: targets.clone(),
            names: vec![ETCD_CONTAINER],
            kill: true,
        })
        .then(VolumeRemove {
            nodes: targets,
            names: vec![etcd.volume_name.clone(), etcd.marker_volume()],
        })
        .boxed()
}

/// Restart one member whose image or parameters drifted
#[must_use]
pub fn restart(cluster: &Arc<Cluster>, node: Node) -> Box<dyn Operator> {
    let targets = vec![node.address.clone()];
    let cps: Vec<Node> = cluster.control_plane().cloned().collect();
    let nodes = vec![node];
    Sequence::new("etcd-restart", targets.clone())
        .then(ImagePull {
            nodes: targets,
            image: ETCD_IMAGE,
        })
        .then(MakeFiles {
            cluster: Arc::clone(cluster),
            nodes: nodes.clone(),
            set: FileSet::Etcd,
        })
        .then(run_etcd(cluster, &nodes, &initial_cluster(&cps), "existing"))
        .boxed()
}

/// Add a member through the etcd API and start its container
pub struct AddMember {
    cluster: Arc<Cluster>,
    node: Node,
    config: MemberAddConfig,
}

#[async_trait]
impl Commander for AddMember {
    fn command(&self) -> Command {
        Command::new("add-etcd-member", &self.node.address)
    }

    async fn run(&self, ctx: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let address = &self.node.address;
        let endpoints: Vec<String> = self
            .cluster
            .control_plane()
            .filter(|n| n.address != *address)
            .map(|n| crate::etcd_admin::client_url(&n.address))
            .collect();
        let admin = inf.etcd(&endpoints).await?;

        let peer = peer_url(address);
        let mut members = admin.member_list().await?;
        if members.iter().any(|m| m.peer_urls.contains(&peer)) {
            info!("Re-inviting unstarted etcd member {}", address);
        } else {
            sleep_or_cancel(ctx, self.config.delay).await?;
            members = admin.member_add(vec![peer]).await?;
            info!("Added etcd member {}", address);
        }

        if let Some(hook) = self.config.after_member_add {
            hook()?;
        }

        let initial: Vec<String> = members
            .iter()
            .filter_map(|m| {
                let url = m.peer_urls.first()?;
                Some(format!("{}={url}", m.member_name()))
            })
            .collect();
        let cluster = &self.cluster;
        inf.engine(address)?
            .run_system(
                ETCD_CONTAINER,
                ETCD_IMAGE,
                &etcd_opts(cluster),
                &etcd_params(cluster, &self.node, &initial, "existing"),
                &cluster.options.etcd.service,
            )
            .await?;
        Ok(())
    }
}

/// Remove members by id; members already gone are skipped
pub struct RemoveMembers {
    endpoints: Vec<String>,
    members: Vec<(String, u64)>,
}

#[async_trait]
impl Commander for RemoveMembers {
    fn command(&self) -> Command {
        let names: Vec<&str> = self.members.iter().map(|(n, _)| n.as_str()).collect();
        Command::new("remove-etcd-member", names.join(","))
    }

    async fn run(&self, _: &CancellationToken, inf: &Infrastructure, _: &str) -> Result<(), EngineError> {
        let admin = inf.etcd(&self.endpoints).await?;
        let current = admin.member_list().await?;
        for (name, id) in &self.members {
            if !current.iter().any(|m| m.id == *id) {
                continue;
            }
            admin.member_remove(*id).await?;
            info!("Removed etcd member {} ({:x})", name, id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etcd_admin::EtcdMember;
    use crate::infrastructure::tests::{LEADER_KEY, MockConnector, mock_infrastructure};
    use crate::op::tests::command_names;

    fn cluster() -> Arc<Cluster> {
        Arc::new(Cluster {
            name: "test".to_string(),
            nodes: ["10.0.0.11", "10.0.0.12", "10.0.0.13"]
                .iter()
                .map(|a| Node {
                    address: (*a).to_string(),
                    control_plane: true,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
    }

    fn member(id: u64, address: &str, started: bool) -> EtcdMember {
        EtcdMember {
            id,
            name: if started { address.to_string() } else { String::new() },
            peer_urls: vec![peer_url(address)],
            client_urls: Vec::new(),
        }
    }

    fn no_delay() -> MemberAddConfig {
        MemberAddConfig {
            delay: Duration::ZERO,
            after_member_add: None,
        }
    }

    async fn run_all(op: &mut dyn Operator, inf: &Infrastructure) -> Result<(), EngineError> {
        let ctx = CancellationToken::new();
        while let Some(cmd) = op.next_command() {
            cmd.run(&ctx, inf, LEADER_KEY).await?;
        }
        Ok(())
    }

    #[test]
    fn test_bootstrap_marks_members_last() {
        let cluster = cluster();
        let mut op = bootstrap(&cluster, cluster.nodes.clone());
        assert_eq!(
            command_names(op.as_mut()),
            vec!["image-pull", "volume-create", "make-files", "run-container", "volume-create"]
        );
    }

    #[tokio::test]
    async fn test_add_member_invites_new_node() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::default());
        connector
            .etcd
            .members
            .lock()
            .unwrap()
            .extend([member(1, "10.0.0.11", true), member(2, "10.0.0.12", true)]);
        let engine = connector.engine_for("10.0.0.13");
        engine.add_volume("etcd-clusterops-member");
        let (inf, _) = mock_infrastructure(&cluster, Arc::clone(&connector)).await;

        let mut op = add_member(&cluster, cluster.nodes[2].clone(), no_delay());
        run_all(op.as_mut(), &inf).await.unwrap();

        assert_eq!(connector.etcd.members.lock().unwrap().len(), 3);
        assert!(engine.is_running(ETCD_CONTAINER));
        assert!(engine.has_volume("etcd-clusterops"));
        assert!(!engine.has_volume("etcd-clusterops-member"));
    }

    #[tokio::test]
    async fn test_add_member_reinvites_unstarted_member() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::default());
        connector.etcd.members.lock().unwrap().extend([
            member(1, "10.0.0.11", true),
            member(2, "10.0.0.12", true),
            member(3, "10.0.0.13", false),
        ]);
        let engine = connector.engine_for("10.0.0.13");
        engine.add_container(
            ETCD_CONTAINER,
            ETCD_IMAGE,
            Default::default(),
            Default::default(),
            false,
        );
        let (inf, _) = mock_infrastructure(&cluster, Arc::clone(&connector)).await;

        let mut op = add_member(&cluster, cluster.nodes[2].clone(), no_delay());
        run_all(op.as_mut(), &inf).await.unwrap();

        let members = connector.etcd.members.lock().unwrap().clone();
        assert_eq!(members.len(), 3);
        assert!(members.iter().any(|m| m.id == 3));
        let calls = engine.calls();
        let stop = calls.iter().position(|c| c == "stop etcd").unwrap();
        let create = calls
            .iter()
            .position(|c| c == "volume_create etcd-clusterops")
            .unwrap();
        let run = calls.iter().position(|c| c == "run_system etcd").unwrap();
        assert!(stop < create && create < run);
    }

    #[tokio::test]
    async fn test_add_member_failure_after_member_add() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::default());
        connector
            .etcd
            .members
            .lock()
            .unwrap()
            .extend([member(1, "10.0.0.11", true), member(2, "10.0.0.12", true)]);
        let engine = connector.engine_for("10.0.0.13");
        let (inf, _) = mock_infrastructure(&cluster, Arc::clone(&connector)).await;

        let config = MemberAddConfig {
            delay: Duration::ZERO,
            after_member_add: Some(|| Err(EngineError::CommandFailed("injected".to_string()))),
        };
        let mut op = add_member(&cluster, cluster.nodes[2].clone(), config);
        let err = run_all(op.as_mut(), &inf).await;
        assert!(matches!(err, Err(EngineError::CommandFailed(_))));

        let members = connector.etcd.members.lock().unwrap().clone();
        assert_eq!(members.len(), 3);
        assert_eq!(members[2].member_name(), "10.0.0.13");
        assert!(members[2].name.is_empty());
        assert!(!engine.is_running(ETCD_CONTAINER));
    }

    #[tokio::test]
    async fn test_destroy_member() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::default());
        connector
            .etcd
            .members
            .lock()
            .unwrap()
            .extend([member(1, "10.0.0.11", true), member(3, "10.0.0.13", true)]);
        let engine = connector.engine_for("10.0.0.13");
        engine.add_container(ETCD_CONTAINER, ETCD_IMAGE, Default::default(), Default::default(), true);
        engine.add_volume("etcd-clusterops");
        let (inf, _) = mock_infrastructure(&cluster, Arc::clone(&connector)).await;

        let mut op = destroy_member(&cluster, "10.0.0.13", vec![("10.0.0.13".to_string(), 3)]);
        run_all(op.as_mut(), &inf).await.unwrap();

        assert_eq!(connector.etcd.members.lock().unwrap().len(), 1);
        assert!(engine.calls().contains(&"kill etcd".to_string()));
        assert!(!engine.has_volume("etcd-clusterops"));
    }
}
