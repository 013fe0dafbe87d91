//! Container images run by the engine

/// etcd image
pub const ETCD_IMAGE: &str = "ghcr.io/microscaler/etcd:3.5.17.1";
/// Image with every Kubernetes binary
pub const KUBERNETES_IMAGE: &str = "ghcr.io/microscaler/kubernetes:1.30.6.1";
/// Tools image carrying `rivers` and the helper binaries
pub const TOOLS_IMAGE: &str = "ghcr.io/microscaler/clusterops-tools:1.30.0";
/// Cluster DNS image
pub const COREDNS_IMAGE: &str = "ghcr.io/microscaler/coredns:1.11.3.1";
/// Node-local DNS cache image
pub const UNBOUND_IMAGE: &str = "ghcr.io/microscaler/unbound:1.21.1.1";
/// Pod sandbox image
pub const PAUSE_IMAGE: &str = "ghcr.io/microscaler/pause:3.10.0.1";

/// All images the engine pulls on nodes
#[must_use]
pub fn all_images() -> Vec<&'static str> {
    vec![
        ETCD_IMAGE,
        KUBERNETES_IMAGE,
        TOOLS_IMAGE,
        COREDNS_IMAGE,
        UNBOUND_IMAGE,
        PAUSE_IMAGE,
    ]
}
