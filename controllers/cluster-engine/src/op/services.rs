//! Boot and restart operators of rivers and the Kubernetes components.

use super::common::{
    ImagePull, MakeFiles, RunContainer, SetupHostDirs, StopContainers, UpdateConfigVersion,
    addresses,
};
use super::certs::FileSet;
use super::params::SystemService;
use super::{Operator, Sequence};
use cluster_spec::names::CONTROL_PLANE_CONTAINERS;
use cluster_spec::{Cluster, Node};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Bootstrap,
    Restart,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Restart => "restart",
        }
    }
}

fn service_op(cluster: &Arc<Cluster>, service: SystemService, nodes: Vec<Node>, mode: Mode) -> Box<dyn Operator> {
    let targets = addresses(&nodes);
    let params = nodes
        .iter()
        .map(|n| {
            let params = match mode {
                Mode::Bootstrap => service.boot_params(cluster, n),
                Mode::Restart => service.builtin_params(cluster, n),
            };
            (n.address.clone(), params)
        })
        .collect();

    let mut op = Sequence::new(
        format!("{}-{}", service.op_prefix(), mode.as_str()),
        targets.clone(),
    )
    .then(ImagePull {
        nodes: targets,
        image: service.image(),
    });
    if let Some(set) = FileSet::for_service(service) {
        op = op.then(MakeFiles {
            cluster: Arc::clone(cluster),
            nodes,
            set,
        });
    }
    op.then(RunContainer {
        name: service.container(),
        image: service.image(),
        opts: service.opts(),
        params,
        extra: service.extra_params(cluster),
    })
    .boxed()
}

/// Start a stopped service on nodes
#[must_use]
pub fn bootstrap(cluster: &Arc<Cluster>, service: SystemService, nodes: Vec<Node>) -> Box<dyn Operator> {
    service_op(cluster, service, nodes, Mode::Bootstrap)
}

/// Restart a service whose image or parameters drifted
#[must_use]
pub fn restart(cluster: &Arc<Cluster>, service: SystemService, nodes: Vec<Node>) -> Box<dyn Operator> {
    service_op(cluster, service, nodes, Mode::Restart)
}

/// Stop control plane containers on nodes that are no longer control planes
#[must_use]
pub fn stop_control_plane(nodes: Vec<String>) -> Box<dyn Operator> {
    Sequence::new("stop-control-plane", nodes.clone())
        .then(StopContainers {
            nodes,
            names: CONTROL_PLANE_CONTAINERS.to_vec(),
            kill: false,
        })
        .boxed()
}

/// Migrate host layout and stamp the current config version
#[must_use]
pub fn upgrade(nodes: Vec<String>) -> Box<dyn Operator> {
    Sequence::new("upgrade", nodes.clone())
        .then(SetupHostDirs { nodes })
        .then(UpdateConfigVersion)
        .boxed()
}
