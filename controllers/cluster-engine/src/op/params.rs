//! Parameters of the system containers the engine runs.
//!
//! The same builders are used to start containers and, on later passes, to
//! detect drift against the params label of running containers.

use crate::etcd_admin::{client_url, peer_url};
use crate::status::{KubeletConfig, NodeStatus};
use cluster_spec::images::{ETCD_IMAGE, KUBERNETES_IMAGE, TOOLS_IMAGE};
use cluster_spec::names::{
    APISERVER_CONTAINER, APISERVER_PORT, CONTROLLER_MANAGER_CONTAINER, ETCD_CLIENT_PORT,
    ETCD_RIVERS_CONTAINER, ETCD_RIVERS_LISTEN_PORT, KUBELET_CONFIG_PATH, KUBELET_CONTAINER,
    KUBELET_HEALTH_PORT, PROXY_CONTAINER, RIVERS_CONTAINER, RIVERS_LISTEN_PORT, SCHEDULER_CONTAINER,
};
use cluster_spec::{Cluster, Mount, Node, ServiceParams, Taint};
use node_agent::ServiceStatus;

/// Certificates of the managed etcd
pub const ETCD_PKI_DIR: &str = "/etc/etcd/pki";
/// Certificates of Kubernetes components
pub const K8S_PKI_DIR: &str = "/etc/kubernetes/pki";
/// Audit policy of the API server
pub const AUDIT_POLICY_PATH: &str = "/etc/kubernetes/apiserver/audit-policy.yml";
/// Data directory bound into the etcd container
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";

/// Kubeconfig path of a Kubernetes component
#[must_use]
pub fn kubeconfig_path(component: &str) -> String {
    format!("/etc/kubernetes/{component}/kubeconfig")
}

/// Local endpoint of the rivers proxy in front of the API servers
#[must_use]
pub fn local_api_server() -> String {
    format!("https://127.0.0.1:{RIVERS_LISTEN_PORT}")
}

fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

fn cp_upstreams(cluster: &Cluster, port: u16) -> String {
    cluster
        .control_plane()
        .map(|n| format!("{}:{port}", n.address))
        .collect::<Vec<_>>()
        .join(",")
}

/// Client URLs of the etcd members the cluster declares
#[must_use]
pub fn etcd_endpoints(cluster: &Cluster) -> Vec<String> {
    cluster.control_plane().map(|n| client_url(&n.address)).collect()
}

/// Load balancer in front of the API servers
#[must_use]
pub fn rivers_params(cluster: &Cluster) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "rivers".to_string(),
            format!("--upstreams={}", cp_upstreams(cluster, APISERVER_PORT)),
            format!("--listen=127.0.0.1:{RIVERS_LISTEN_PORT}"),
        ],
        ..Default::default()
    }
}

/// Load balancer in front of the etcd members
#[must_use]
pub fn etcd_rivers_params(cluster: &Cluster) -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "rivers".to_string(),
            format!("--upstreams={}", cp_upstreams(cluster, ETCD_CLIENT_PORT)),
            format!("--listen=127.0.0.1:{ETCD_RIVERS_LISTEN_PORT}"),
        ],
        ..Default::default()
    }
}

/// `--initial-cluster` entry of a member
#[must_use]
pub fn initial_cluster_member(address: &str) -> String {
    format!("{address}={}", peer_url(address))
}

/// Built-in etcd parameters; `initial_cluster` lists `name=peer-url` entries
#[must_use]
pub fn etcd_params(cluster: &Cluster, node: &Node, initial_cluster: &[String], state: &str) -> ServiceParams {
    let address = &node.address;
    let mut extra_args = vec![
        "etcd".to_string(),
        format!("--name={address}"),
        format!("--data-dir={ETCD_DATA_DIR}"),
        "--listen-peer-urls=https://0.0.0.0:2380".to_string(),
        "--listen-client-urls=https://0.0.0.0:2379".to_string(),
        format!("--initial-advertise-peer-urls={}", peer_url(address)),
        format!("--advertise-client-urls={}", client_url(address)),
        format!("--cert-file={ETCD_PKI_DIR}/server.crt"),
        format!("--key-file={ETCD_PKI_DIR}/server.key"),
        "--client-cert-auth=true".to_string(),
        format!("--trusted-ca-file={ETCD_PKI_DIR}/ca-client.crt"),
        format!("--peer-cert-file={ETCD_PKI_DIR}/peer.crt"),
        format!("--peer-key-file={ETCD_PKI_DIR}/peer.key"),
        "--peer-client-cert-auth=true".to_string(),
        format!("--peer-trusted-ca-file={ETCD_PKI_DIR}/ca-peer.crt"),
        "--enable-v2=false".to_string(),
        "--auto-compaction-mode=periodic".to_string(),
        "--auto-compaction-retention=24".to_string(),
    ];
    extra_args.push(format!("--initial-cluster={}", initial_cluster.join(",")));
    extra_args.push(format!("--initial-cluster-token={}", cluster.name));
    extra_args.push(format!("--initial-cluster-state={state}"));

    ServiceParams {
        extra_args,
        extra_binds: vec![Mount::read_only(ETCD_PKI_DIR)],
        ..Default::default()
    }
}

/// Runtime flags of the etcd container
#[must_use]
pub fn etcd_opts(cluster: &Cluster) -> Vec<String> {
    vec![format!(
        "--volume={}:{ETCD_DATA_DIR}",
        cluster.options.etcd.volume_name
    )]
}

/// Arguments that do not force an etcd restart
pub const ETCD_IGNORED_ARGS: &[&str] = &["--initial-"];

/// Flags of the API server on `node`
#[must_use]
pub fn apiserver_params(cluster: &Cluster, node: &Node) -> ServiceParams {
    let mut extra_args = args(&[
        "apiserver",
        "--allow-privileged=true",
        "--bind-address=0.0.0.0",
        "--authorization-mode=Node,RBAC",
        "--enable-admission-plugins=NodeRestriction",
        "--endpoint-reconciler-type=none",
        "--kubelet-preferred-address-types=InternalIP",
        "--service-account-issuer=https://kubernetes.default.svc",
    ]);
    extra_args.extend([
        format!("--secure-port={APISERVER_PORT}"),
        format!("--advertise-address={}", node.address),
        format!("--etcd-servers=https://127.0.0.1:{ETCD_RIVERS_LISTEN_PORT}"),
        format!("--etcd-cafile={K8S_PKI_DIR}/etcd-ca.crt"),
        format!("--etcd-certfile={K8S_PKI_DIR}/apiserver-etcd-client.crt"),
        format!("--etcd-keyfile={K8S_PKI_DIR}/apiserver-etcd-client.key"),
        format!("--client-ca-file={K8S_PKI_DIR}/ca.crt"),
        format!("--tls-cert-file={K8S_PKI_DIR}/apiserver.crt"),
        format!("--tls-private-key-file={K8S_PKI_DIR}/apiserver.key"),
        format!("--kubelet-certificate-authority={K8S_PKI_DIR}/ca.crt"),
        format!("--kubelet-client-certificate={K8S_PKI_DIR}/apiserver-kubelet-client.crt"),
        format!("--kubelet-client-key={K8S_PKI_DIR}/apiserver-kubelet-client.key"),
        format!("--service-account-key-file={K8S_PKI_DIR}/service-account.crt"),
        format!("--service-account-signing-key-file={K8S_PKI_DIR}/service-account.key"),
        format!("--service-cluster-ip-range={}", cluster.service_subnet),
    ]);

    let mut extra_binds = vec![Mount::read_only("/etc/kubernetes")];
    let api = &cluster.options.kube_api;
    if api.audit_log_enabled {
        extra_args.push(format!("--audit-policy-file={AUDIT_POLICY_PATH}"));
        if api.audit_log_path.is_empty() {
            extra_args.push("--audit-log-path=-".to_string());
        } else {
            extra_args.push(format!("--audit-log-path={}", api.audit_log_path));
            extra_binds.push(Mount::read_write("/var/log/kubernetes"));
        }
    }

    ServiceParams {
        extra_args,
        extra_binds,
        ..Default::default()
    }
}

/// Flags of the controller manager
#[must_use]
pub fn controller_manager_params(cluster: &Cluster) -> ServiceParams {
    let kubeconfig = kubeconfig_path("controller-manager");
    let mut extra_args = vec![
        "controller-manager".to_string(),
        format!("--kubeconfig={kubeconfig}"),
        format!("--authentication-kubeconfig={kubeconfig}"),
        format!("--authorization-kubeconfig={kubeconfig}"),
        format!("--cluster-name={}", cluster.name),
        format!("--service-cluster-ip-range={}", cluster.service_subnet),
        format!("--root-ca-file={K8S_PKI_DIR}/ca.crt"),
        format!("--service-account-private-key-file={K8S_PKI_DIR}/service-account.key"),
        "--use-service-account-credentials=true".to_string(),
        "--leader-elect=true".to_string(),
    ];
    if !cluster.pod_subnet.is_empty() {
        extra_args.push("--allocate-node-cidrs=true".to_string());
        extra_args.push(format!("--cluster-cidr={}", cluster.pod_subnet));
    }
    ServiceParams {
        extra_args,
        extra_binds: vec![Mount::read_only("/etc/kubernetes")],
        ..Default::default()
    }
}

/// Flags of the scheduler
#[must_use]
pub fn scheduler_params() -> ServiceParams {
    ServiceParams {
        extra_args: vec![
            "scheduler".to_string(),
            format!("--kubeconfig={}", kubeconfig_path("scheduler")),
            "--leader-elect=true".to_string(),
        ],
        extra_binds: vec![Mount::read_only("/etc/kubernetes")],
        ..Default::default()
    }
}

/// `key=value:Effect` list for `--register-with-taints`
fn taint_list(taints: &[Taint]) -> String {
    taints
        .iter()
        .map(|t| {
            if t.value.is_empty() {
                format!("{}:{}", t.key, t.effect.as_str())
            } else {
                format!("{}={}:{}", t.key, t.value, t.effect.as_str())
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Arguments that do not force a kubelet restart
pub const KUBELET_IGNORED_ARGS: &[&str] = &["--register-with-taints"];

/// Built-in kubelet parameters; boot taints are registered only on first start
#[must_use]
pub fn kubelet_params(cluster: &Cluster, node: &Node, register_taints: bool) -> ServiceParams {
    let kubelet = &cluster.options.kubelet;
    let mut extra_args = vec![
        "kubelet".to_string(),
        format!("--config={KUBELET_CONFIG_PATH}"),
        format!("--kubeconfig={}", kubeconfig_path("kubelet")),
        format!("--hostname-override={}", node.nodename()),
        format!("--node-ip={}", node.address),
        format!("--container-runtime-endpoint={}", kubelet.cri_endpoint),
    ];
    if register_taints && !kubelet.boot_taints.is_empty() {
        extra_args.push(format!("--register-with-taints={}", taint_list(&kubelet.boot_taints)));
    }

    let shared = |path: &str| Mount {
        propagation: "rshared".to_string(),
        ..Mount::read_write(path)
    };
    ServiceParams {
        extra_args,
        extra_binds: vec![
            Mount::read_only("/etc/kubernetes"),
            shared("/var/lib/kubelet"),
            Mount::read_write("/var/log/pods"),
            Mount::read_write("/var/log/containers"),
            Mount::read_write("/run"),
            Mount::read_only("/sys"),
            Mount::read_write("/dev"),
            Mount::read_only("/lib/modules"),
        ],
        ..Default::default()
    }
}

/// Flags of kube-proxy on `node`
#[must_use]
pub fn proxy_params(cluster: &Cluster, node: &Node) -> ServiceParams {
    let mut extra_args = vec![
        "proxy".to_string(),
        format!("--kubeconfig={}", kubeconfig_path("proxy")),
        format!("--hostname-override={}", node.nodename()),
        "--proxy-mode=iptables".to_string(),
    ];
    if !cluster.pod_subnet.is_empty() {
        extra_args.push(format!("--cluster-cidr={}", cluster.pod_subnet));
    }
    ServiceParams {
        extra_args,
        extra_binds: vec![
            Mount::read_only("/etc/kubernetes"),
            Mount::read_only("/lib/modules"),
            Mount::read_write("/run/xtables.lock"),
        ],
        ..Default::default()
    }
}

/// Kubelet settings the engine wants on every node
#[must_use]
pub fn desired_kubelet_config(cluster: &Cluster) -> KubeletConfig {
    let kubelet = &cluster.options.kubelet;
    KubeletConfig {
        domain: kubelet.domain.clone(),
        allow_swap: kubelet.allow_swap,
        container_log_max_size: kubelet.container_log_max_size.clone(),
        container_log_max_files: kubelet.container_log_max_files,
    }
}

/// Kubelet configuration file
///
/// # Errors
///
/// Returns a YAML serialization error.
pub fn kubelet_config_yaml(cluster: &Cluster, node: &Node) -> Result<String, serde_yaml::Error> {
    let kubelet = &cluster.options.kubelet;
    let doc = serde_json::json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "clusterDomain": kubelet.domain,
        "clusterDNS": [node.address],
        "failSwapOn": !kubelet.allow_swap,
        "containerLogMaxSize": kubelet.container_log_max_size,
        "containerLogMaxFiles": kubelet.container_log_max_files,
        "cgroupDriver": "systemd",
        "healthzBindAddress": "0.0.0.0",
        "healthzPort": KUBELET_HEALTH_PORT,
        "tlsCertFile": format!("{K8S_PKI_DIR}/kubelet.crt"),
        "tlsPrivateKeyFile": format!("{K8S_PKI_DIR}/kubelet.key"),
        "authentication": {
            "x509": {"clientCAFile": format!("{K8S_PKI_DIR}/ca.crt")},
            "webhook": {"enabled": true},
            "anonymous": {"enabled": false},
        },
        "authorization": {"mode": "Webhook"},
    });
    serde_yaml::to_string(&doc)
}

/// System services started through the generic boot and restart operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemService {
    /// API server load balancer on every node
    Rivers,
    /// etcd load balancer on control plane nodes
    EtcdRivers,
    /// kube-apiserver
    ApiServer,
    /// kube-controller-manager
    ControllerManager,
    /// kube-scheduler
    Scheduler,
    /// kubelet
    Kubelet,
    /// kube-proxy
    Proxy,
}

impl SystemService {
    /// Kubernetes components, in boot order
    pub const KUBERNETES: [Self; 5] = [
        Self::ApiServer,
        Self::ControllerManager,
        Self::Scheduler,
        Self::Kubelet,
        Self::Proxy,
    ];

    /// Container name on the node
    #[must_use]
    pub fn container(self) -> &'static str {
        match self {
            Self::Rivers => RIVERS_CONTAINER,
            Self::EtcdRivers => ETCD_RIVERS_CONTAINER,
            Self::ApiServer => APISERVER_CONTAINER,
            Self::ControllerManager => CONTROLLER_MANAGER_CONTAINER,
            Self::Scheduler => SCHEDULER_CONTAINER,
            Self::Kubelet => KUBELET_CONTAINER,
            Self::Proxy => PROXY_CONTAINER,
        }
    }

    /// Prefix of the operator names, e.g. `kube-apiserver` in `kube-apiserver-restart`
    #[must_use]
    pub fn op_prefix(self) -> &'static str {
        match self {
            Self::Rivers => "rivers",
            Self::EtcdRivers => "etcd-rivers",
            Self::ApiServer => "kube-apiserver",
            Self::ControllerManager => "kube-controller-manager",
            Self::Scheduler => "kube-scheduler",
            Self::Kubelet => "kubelet",
            Self::Proxy => "kube-proxy",
        }
    }

    /// Image the service runs
    #[must_use]
    pub fn image(self) -> &'static str {
        match self {
            Self::Rivers | Self::EtcdRivers => TOOLS_IMAGE,
            _ => KUBERNETES_IMAGE,
        }
    }

    /// Whether only control plane nodes run the service
    #[must_use]
    pub fn control_plane_only(self) -> bool {
        matches!(
            self,
            Self::EtcdRivers | Self::ApiServer | Self::ControllerManager | Self::Scheduler
        )
    }

    /// Parameters the engine generates for `node`
    #[must_use]
    pub fn builtin_params(self, cluster: &Cluster, node: &Node) -> ServiceParams {
        match self {
            Self::Rivers => rivers_params(cluster),
            Self::EtcdRivers => etcd_rivers_params(cluster),
            Self::ApiServer => apiserver_params(cluster, node),
            Self::ControllerManager => controller_manager_params(cluster),
            Self::Scheduler => scheduler_params(),
            Self::Kubelet => kubelet_params(cluster, node, false),
            Self::Proxy => proxy_params(cluster, node),
        }
    }

    /// Parameters to start the service with
    #[must_use]
    pub fn boot_params(self, cluster: &Cluster, node: &Node) -> ServiceParams {
        match self {
            Self::Kubelet => kubelet_params(cluster, node, true),
            _ => self.builtin_params(cluster, node),
        }
    }

    /// Parameters declared for the service in the cluster options
    #[must_use]
    pub fn extra_params(self, cluster: &Cluster) -> ServiceParams {
        let options = &cluster.options;
        match self {
            Self::Rivers => options.rivers.clone(),
            Self::EtcdRivers => options.etcd_rivers.clone(),
            Self::ApiServer => options.kube_api.service.clone(),
            Self::ControllerManager => options.kube_controller_manager.clone(),
            Self::Scheduler => options.kube_scheduler.clone(),
            Self::Kubelet => options.kubelet.service.clone(),
            Self::Proxy => options.kube_proxy.clone(),
        }
    }

    /// Runtime flags
    #[must_use]
    pub fn opts(self) -> Vec<String> {
        match self {
            Self::Kubelet => vec!["--privileged".to_string(), "--pid=host".to_string()],
            Self::Proxy => vec!["--privileged".to_string()],
            _ => Vec::new(),
        }
    }

    /// Arguments left out of the drift comparison
    #[must_use]
    pub fn ignored_args(self) -> &'static [&'static str] {
        match self {
            Self::Kubelet => KUBELET_IGNORED_ARGS,
            _ => &[],
        }
    }

    /// Observed status of the service on a node
    #[must_use]
    pub fn status(self, node: &NodeStatus) -> &ServiceStatus {
        match self {
            Self::Rivers => &node.rivers,
            Self::EtcdRivers => &node.etcd_rivers,
            Self::ApiServer => &node.api_server,
            Self::ControllerManager => &node.controller_manager,
            Self::Scheduler => &node.scheduler,
            Self::Kubelet => &node.kubelet.service,
            Self::Proxy => &node.proxy,
        }
    }

    /// Whether a running container differs from what the engine would start now
    #[must_use]
    pub fn is_outdated(self, cluster: &Cluster, node: &Node, status: &NodeStatus) -> bool {
        let current = self.status(status);
        if current.image != self.image() {
            return true;
        }
        let ignored = self.ignored_args();
        if !current
            .builtin_params
            .equal_ignoring(&self.builtin_params(cluster, node), ignored)
        {
            return true;
        }
        if !current
            .extra_params
            .equal_ignoring(&self.extra_params(cluster), ignored)
        {
            return true;
        }
        self == Self::Kubelet
            && status.kubelet.config.as_ref() != Some(&desired_kubelet_config(cluster))
    }
}

/// Whether the etcd container of a node drifted
#[must_use]
pub fn etcd_is_outdated(cluster: &Cluster, node: &Node, status: &NodeStatus) -> bool {
    let current = &status.etcd.service;
    current.image != ETCD_IMAGE
        || !current
            .builtin_params
            .equal_ignoring(&etcd_params(cluster, node, &[], "new"), ETCD_IGNORED_ARGS)
        || !current
            .extra_params
            .equal_ignoring(&cluster.options.etcd.service, ETCD_IGNORED_ARGS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_spec::TaintEffect;

    fn cluster() -> Cluster {
        Cluster {
            name: "prod".to_string(),
            nodes: vec![
                Node {
                    address: "10.0.0.11".to_string(),
                    control_plane: true,
                    ..Default::default()
                },
                Node {
                    address: "10.0.0.12".to_string(),
                    control_plane: true,
                    ..Default::default()
                },
                Node {
                    address: "10.0.0.14".to_string(),
                    hostname: "worker1".to_string(),
                    ..Default::default()
                },
            ],
            service_subnet: "10.68.0.0/16".to_string(),
            ..Default::default()
        }
    }

    fn running(service: SystemService, cluster: &Cluster, node: &Node) -> NodeStatus {
        let mut status = NodeStatus::default();
        let svc = ServiceStatus {
            running: true,
            image: service.image().to_string(),
            builtin_params: service.boot_params(cluster, node),
            extra_params: service.extra_params(cluster),
            is_healthy: true,
        };
        match service {
            SystemService::Rivers => status.rivers = svc,
            SystemService::Kubelet => {
                status.kubelet.service = svc;
                status.kubelet.config = Some(desired_kubelet_config(cluster));
            }
            _ => unreachable!(),
        }
        status
    }

    #[test]
    fn test_rivers_upstreams_follow_control_plane() {
        let mut cluster = cluster();
        let params = rivers_params(&cluster);
        assert_eq!(params.extra_args[1], "--upstreams=10.0.0.11:6443,10.0.0.12:6443");

        let node = cluster.nodes[2].clone();
        let status = running(SystemService::Rivers, &cluster, &node);
        assert!(!SystemService::Rivers.is_outdated(&cluster, &node, &status));

        cluster.nodes[2].control_plane = true;
        assert!(SystemService::Rivers.is_outdated(&cluster, &node, &status));
    }

    #[test]
    fn test_kubelet_boot_taints_do_not_cause_restart() {
        let mut cluster = cluster();
        cluster.options.kubelet.boot_taints = vec![Taint {
            key: "gpu".to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        }];
        let node = cluster.nodes[2].clone();

        let boot = SystemService::Kubelet.boot_params(&cluster, &node);
        assert!(boot.extra_args.contains(&"--register-with-taints=gpu:NoSchedule".to_string()));

        let status = running(SystemService::Kubelet, &cluster, &node);
        assert!(!SystemService::Kubelet.is_outdated(&cluster, &node, &status));

        cluster.options.kubelet.container_log_max_files = 10;
        assert!(SystemService::Kubelet.is_outdated(&cluster, &node, &status));
    }

    #[test]
    fn test_etcd_initial_args_are_ignored() {
        let cluster = cluster();
        let node = &cluster.nodes[0];
        let mut status = NodeStatus::default();
        status.etcd.service = ServiceStatus {
            running: true,
            image: ETCD_IMAGE.to_string(),
            builtin_params: etcd_params(
                &cluster,
                node,
                &[initial_cluster_member("10.0.0.11")],
                "existing",
            ),
            extra_params: ServiceParams::default(),
            is_healthy: true,
        };
        assert!(!etcd_is_outdated(&cluster, node, &status));

        status.etcd.service.image = "etcd:old".to_string();
        assert!(etcd_is_outdated(&cluster, node, &status));
    }

    #[test]
    fn test_kubelet_config_round_trip() {
        let cluster = cluster();
        let yaml = kubelet_config_yaml(&cluster, &cluster.nodes[2]).unwrap();
        let parsed = crate::status::parse_kubelet_config(&yaml).unwrap();
        assert_eq!(parsed, desired_kubelet_config(&cluster));
    }
}
