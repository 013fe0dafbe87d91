//! Well-known names shared between the engine and the nodes it manages

/// Prefix of every label, annotation and taint key owned by the engine
pub const DOMAIN_PREFIX: &str = "clusterops.microscaler.io/";

/// Annotation set on a node cordoned by a reboot or repair drain
pub const ANNOTATION_REBOOT: &str = "clusterops.microscaler.io/reboot";
/// Annotation carrying the revision of an applied resource definition
pub const ANNOTATION_REVISION: &str = "clusterops.microscaler.io/revision";
/// Label carrying the parameters a system container was started with
pub const LABEL_PARAMS: &str = "clusterops.microscaler.io/params";
/// Label (and taint key) identifying control plane nodes
pub const LABEL_MASTER: &str = "clusterops.microscaler.io/master";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "clusterops";

/// Layout version of files and containers the engine places on nodes
pub const CONFIG_VERSION: &str = "1";

/// TCP proxy to the API servers on every node
pub const RIVERS_CONTAINER: &str = "rivers";
/// TCP proxy to the etcd members on control plane nodes
pub const ETCD_RIVERS_CONTAINER: &str = "etcd-rivers";
/// etcd member
pub const ETCD_CONTAINER: &str = "etcd";
/// Kubernetes API server
pub const APISERVER_CONTAINER: &str = "kube-apiserver";
/// Kubernetes controller manager
pub const CONTROLLER_MANAGER_CONTAINER: &str = "kube-controller-manager";
/// Kubernetes scheduler
pub const SCHEDULER_CONTAINER: &str = "kube-scheduler";
/// kubelet
pub const KUBELET_CONTAINER: &str = "kubelet";
/// kube-proxy
pub const PROXY_CONTAINER: &str = "kube-proxy";

/// Containers only control plane nodes run
pub const CONTROL_PLANE_CONTAINERS: [&str; 5] = [
    ETCD_RIVERS_CONTAINER,
    ETCD_CONTAINER,
    APISERVER_CONTAINER,
    CONTROLLER_MANAGER_CONTAINER,
    SCHEDULER_CONTAINER,
];

/// Every system container the engine manages
pub const ALL_CONTAINERS: [&str; 8] = [
    RIVERS_CONTAINER,
    ETCD_RIVERS_CONTAINER,
    ETCD_CONTAINER,
    APISERVER_CONTAINER,
    CONTROLLER_MANAGER_CONTAINER,
    SCHEDULER_CONTAINER,
    KUBELET_CONTAINER,
    PROXY_CONTAINER,
];

/// Secure port of the API server
pub const APISERVER_PORT: u16 = 6443;
/// Local port rivers forwards to the API servers
pub const RIVERS_LISTEN_PORT: u16 = 16443;
/// etcd client port
pub const ETCD_CLIENT_PORT: u16 = 2379;
/// etcd peer port
pub const ETCD_PEER_PORT: u16 = 2380;
/// Local port etcd-rivers forwards to the etcd members
pub const ETCD_RIVERS_LISTEN_PORT: u16 = 12379;
/// Health port of the controller manager
pub const CONTROLLER_MANAGER_HEALTH_PORT: u16 = 10257;
/// Health port of the scheduler
pub const SCHEDULER_HEALTH_PORT: u16 = 10251;
/// Health port of the kubelet
pub const KUBELET_HEALTH_PORT: u16 = 10248;

/// Namespace of the headless service fronting etcd
pub const ETCD_SERVICE_NAMESPACE: &str = "kube-system";
/// Name of the etcd headless service
pub const ETCD_SERVICE_NAME: &str = "clusterops-etcd";

/// Namespace of the cluster and node DNS objects
pub const CLUSTER_DNS_NAMESPACE: &str = "kube-system";
/// Name of the cluster DNS ConfigMap, Deployment and Service
pub const CLUSTER_DNS_NAME: &str = "cluster-dns";
/// ConfigMap key holding the cluster DNS configuration
pub const CLUSTER_DNS_CONFIG_KEY: &str = "Corefile";
/// Name of the node-local DNS ConfigMap and DaemonSet
pub const NODE_DNS_NAME: &str = "node-dns";
/// ConfigMap key holding the node DNS configuration
pub const NODE_DNS_CONFIG_KEY: &str = "unbound.conf";

/// etcd configuration and certificate directory
pub const ETCD_CONFIG_DIR: &str = "/etc/etcd";
/// Kubernetes configuration root
pub const KUBERNETES_CONFIG_DIR: &str = "/etc/kubernetes";
/// kubelet configuration file
pub const KUBELET_CONFIG_PATH: &str = "/etc/kubernetes/kubelet/config.yml";
/// Directories created on every node before any service starts
pub const ENGINE_DIRS: [&str; 6] = [
    "/etc/etcd",
    "/etc/kubernetes",
    "/etc/kubernetes/kubelet",
    "/etc/kubernetes/pki",
    "/var/lib/kubelet",
    "/var/log/kubernetes",
];
