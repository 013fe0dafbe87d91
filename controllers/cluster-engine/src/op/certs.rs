//! Certificates, kubeconfigs and configuration files placed on nodes.

use super::params::{
    AUDIT_POLICY_PATH, ETCD_PKI_DIR, K8S_PKI_DIR, SystemService, kubeconfig_path, kubelet_config_yaml,
    local_api_server,
};
use crate::broker::{CA_ETCD_CLIENT, CA_ETCD_PEER, CA_KUBERNETES, CA_SERVER, CertIssuer, CertRequest};
use crate::error::EngineError;
use crate::infrastructure::{ClientCredentials, Infrastructure, kubeconfig_document};
use cluster_spec::names::KUBELET_CONFIG_PATH;
use cluster_spec::{Cluster, Node};
use node_agent::Agent;
use node_agent::shell::quote;
use std::net::Ipv4Addr;
use std::path::Path;

/// A file to write on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFile {
    /// Absolute path on the node
    pub path: String,
    /// File content
    pub content: String,
    /// Octal permission bits
    pub mode: &'static str,
}

impl NodeFile {
    fn public(path: String, content: String) -> Self {
        Self {
            path,
            content,
            mode: "0644",
        }
    }

    fn secret(path: String, content: String) -> Self {
        Self {
            path,
            content,
            mode: "0600",
        }
    }
}

/// Group of files a service needs before it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSet {
    /// etcd server and peer certificates
    Etcd,
    /// API server certificates and config
    ApiServer,
    /// Controller manager kubeconfig
    ControllerManager,
    /// Scheduler kubeconfig
    Scheduler,
    /// Kubelet certificates and config
    Kubelet,
    /// kube-proxy kubeconfig
    Proxy,
}

impl FileSet {
    /// Files of a system service; rivers needs none
    #[must_use]
    pub fn for_service(service: SystemService) -> Option<Self> {
        match service {
            SystemService::Rivers | SystemService::EtcdRivers => None,
            SystemService::ApiServer => Some(Self::ApiServer),
            SystemService::ControllerManager => Some(Self::ControllerManager),
            SystemService::Scheduler => Some(Self::Scheduler),
            SystemService::Kubelet => Some(Self::Kubelet),
            SystemService::Proxy => Some(Self::Proxy),
        }
    }

    /// Name used in command records
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::ApiServer => "kube-apiserver",
            Self::ControllerManager => "kube-controller-manager",
            Self::Scheduler => "kube-scheduler",
            Self::Kubelet => "kubelet",
            Self::Proxy => "kube-proxy",
        }
    }
}

/// First host address of an IPv4 service CIDR, the ClusterIP of `kubernetes`
#[must_use]
pub fn first_service_ip(subnet: &str) -> Option<String> {
    let (network, _) = subnet.split_once('/')?;
    let ip: Ipv4Addr = network.parse().ok()?;
    let first = u32::from(ip).checked_add(1)?;
    Some(Ipv4Addr::from(first).to_string())
}

async fn kubeconfig(
    broker: &dyn CertIssuer,
    component: &str,
    common_name: &str,
) -> Result<NodeFile, EngineError> {
    let issued = broker
        .issue(CA_KUBERNETES, &CertRequest::new("system", common_name))
        .await?;
    let credentials = ClientCredentials {
        ca_pem: issued.ca_certificate,
        cert_pem: issued.certificate,
        key_pem: issued.private_key,
    };
    let doc = kubeconfig_document(&local_api_server(), &credentials);
    Ok(NodeFile::secret(
        kubeconfig_path(component),
        serde_yaml::to_string(&doc)?,
    ))
}

async fn etcd_files(broker: &dyn CertIssuer, node: &Node) -> Result<Vec<NodeFile>, EngineError> {
    let address = &node.address;
    let server = broker
        .issue(
            CA_SERVER,
            &CertRequest::new("system", address)
                .with_ip(address)
                .with_ip("127.0.0.1")
                .with_alt_name("localhost")
                .with_alt_name(node.nodename()),
        )
        .await?;
    let peer = broker
        .issue(
            CA_ETCD_PEER,
            &CertRequest::new("system", address).with_ip(address),
        )
        .await?;

    Ok(vec![
        NodeFile::public(format!("{ETCD_PKI_DIR}/server.crt"), server.certificate),
        NodeFile::secret(format!("{ETCD_PKI_DIR}/server.key"), server.private_key),
        NodeFile::public(format!("{ETCD_PKI_DIR}/peer.crt"), peer.certificate),
        NodeFile::secret(format!("{ETCD_PKI_DIR}/peer.key"), peer.private_key),
        NodeFile::public(format!("{ETCD_PKI_DIR}/ca-peer.crt"), peer.ca_certificate),
        NodeFile::public(
            format!("{ETCD_PKI_DIR}/ca-client.crt"),
            broker.ca_certificate(CA_ETCD_CLIENT).await?,
        ),
    ])
}

async fn apiserver_files(
    inf: &Infrastructure,
    broker: &dyn CertIssuer,
    cluster: &Cluster,
    node: &Node,
) -> Result<Vec<NodeFile>, EngineError> {
    let domain = &cluster.options.kubelet.domain;
    let mut request = CertRequest::new("system", "kube-apiserver")
        .with_ip(&node.address)
        .with_ip("127.0.0.1")
        .with_alt_name("localhost")
        .with_alt_name("kubernetes")
        .with_alt_name("kubernetes.default")
        .with_alt_name("kubernetes.default.svc")
        .with_alt_name(&format!("kubernetes.default.svc.{domain}"));
    if let Some(ip) = first_service_ip(&cluster.service_subnet) {
        request = request.with_ip(&ip);
    }
    let server = broker.issue(CA_KUBERNETES, &request).await?;
    let etcd_client = broker
        .issue(CA_ETCD_CLIENT, &CertRequest::new("system", "kube-apiserver"))
        .await?;
    let kubelet_client = broker
        .issue(
            CA_KUBERNETES,
            &CertRequest::new("admin", "kube-apiserver-kubelet-client"),
        )
        .await?;
    let (sa_cert, sa_key) = inf.storage().get_service_account_data().await?;

    let mut files = vec![
        NodeFile::public(format!("{K8S_PKI_DIR}/ca.crt"), server.ca_certificate),
        NodeFile::public(format!("{K8S_PKI_DIR}/apiserver.crt"), server.certificate),
        NodeFile::secret(format!("{K8S_PKI_DIR}/apiserver.key"), server.private_key),
        NodeFile::public(
            format!("{K8S_PKI_DIR}/etcd-ca.crt"),
            broker.ca_certificate(CA_SERVER).await?,
        ),
        NodeFile::public(
            format!("{K8S_PKI_DIR}/apiserver-etcd-client.crt"),
            etcd_client.certificate,
        ),
        NodeFile::secret(
            format!("{K8S_PKI_DIR}/apiserver-etcd-client.key"),
            etcd_client.private_key,
        ),
        NodeFile::public(
            format!("{K8S_PKI_DIR}/apiserver-kubelet-client.crt"),
            kubelet_client.certificate,
        ),
        NodeFile::secret(
            format!("{K8S_PKI_DIR}/apiserver-kubelet-client.key"),
            kubelet_client.private_key,
        ),
        NodeFile::public(format!("{K8S_PKI_DIR}/service-account.crt"), sa_cert),
        NodeFile::secret(format!("{K8S_PKI_DIR}/service-account.key"), sa_key),
    ];

    let api = &cluster.options.kube_api;
    if api.audit_log_enabled {
        files.push(NodeFile::public(
            AUDIT_POLICY_PATH.to_string(),
            api.audit_log_policy.clone(),
        ));
    }
    Ok(files)
}

async fn kubelet_files(
    broker: &dyn CertIssuer,
    cluster: &Cluster,
    node: &Node,
) -> Result<Vec<NodeFile>, EngineError> {
    let nodename = node.nodename();
    let server = broker
        .issue(
            CA_KUBERNETES,
            &CertRequest::new("system", &format!("system:node:{nodename}"))
                .with_ip(&node.address)
                .with_alt_name(nodename),
        )
        .await?;

    Ok(vec![
        NodeFile::public(format!("{K8S_PKI_DIR}/ca.crt"), server.ca_certificate),
        NodeFile::public(format!("{K8S_PKI_DIR}/kubelet.crt"), server.certificate),
        NodeFile::secret(format!("{K8S_PKI_DIR}/kubelet.key"), server.private_key),
        kubeconfig(broker, "kubelet", &format!("system:node:{nodename}")).await?,
        NodeFile::public(
            KUBELET_CONFIG_PATH.to_string(),
            kubelet_config_yaml(cluster, node)?,
        ),
    ])
}

/// Build the files of `set` for one node
///
/// # Errors
///
/// Returns broker, storage or serialization errors.
pub async fn build(
    inf: &Infrastructure,
    cluster: &Cluster,
    node: &Node,
    set: FileSet,
) -> Result<Vec<NodeFile>, EngineError> {
    let broker = inf.broker()?;
    let broker = broker.as_ref();
    match set {
        FileSet::Etcd => etcd_files(broker, node).await,
        FileSet::ApiServer => apiserver_files(inf, broker, cluster, node).await,
        FileSet::ControllerManager => {
            let (_, sa_key) = inf.storage().get_service_account_data().await?;
            Ok(vec![
                NodeFile::public(
                    format!("{K8S_PKI_DIR}/ca.crt"),
                    broker.ca_certificate(CA_KUBERNETES).await?,
                ),
                NodeFile::secret(format!("{K8S_PKI_DIR}/service-account.key"), sa_key),
                kubeconfig(broker, "controller-manager", "system:kube-controller-manager").await?,
            ])
        }
        FileSet::Scheduler => Ok(vec![
            kubeconfig(broker, "scheduler", "system:kube-scheduler").await?,
        ]),
        FileSet::Kubelet => kubelet_files(broker, cluster, node).await,
        FileSet::Proxy => Ok(vec![kubeconfig(broker, "proxy", "system:kube-proxy").await?]),
    }
}

/// Shell command writing stdin to `file`
#[must_use]
pub fn write_command(file: &NodeFile) -> String {
    let dir = Path::new(&file.path)
        .parent()
        .map_or_else(|| "/".to_string(), |p| p.display().to_string());
    format!(
        "mkdir -p {} && cat > {} && chmod {} {}",
        quote(&dir),
        quote(&file.path),
        file.mode,
        quote(&file.path)
    )
}

/// Write files through an agent
///
/// # Errors
///
/// Returns the first failing write.
pub async fn write_files(agent: &dyn Agent, files: &[NodeFile]) -> Result<(), EngineError> {
    for file in files {
        agent.run_with_input(&write_command(file), &file.content).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::tests::{LEADER_KEY, MockConnector, mock_infrastructure};
    use std::sync::Arc;

    fn cluster() -> Cluster {
        Cluster {
            name: "prod".to_string(),
            nodes: vec![Node {
                address: "10.0.0.11".to_string(),
                hostname: "cp1".to_string(),
                control_plane: true,
                ..Default::default()
            }],
            service_subnet: "10.68.0.0/16".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_service_ip() {
        assert_eq!(first_service_ip("10.68.0.0/16").as_deref(), Some("10.68.0.1"));
        assert_eq!(first_service_ip("fd00::/108"), None);
        assert_eq!(first_service_ip("garbage"), None);
    }

    #[test]
    fn test_write_command_quotes_paths() {
        let file = NodeFile::secret("/etc/kubernetes/pki/apiserver.key".to_string(), String::new());
        assert_eq!(
            write_command(&file),
            "mkdir -p /etc/kubernetes/pki && cat > /etc/kubernetes/pki/apiserver.key && chmod 0600 /etc/kubernetes/pki/apiserver.key"
        );
    }

    #[tokio::test]
    async fn test_kubelet_files() {
        let cluster = cluster();
        let connector = Arc::new(MockConnector::default());
        let (inf, _) = mock_infrastructure(&cluster, connector).await;

        let files = build(&inf, &cluster, &cluster.nodes[0], FileSet::Kubelet)
            .await
            .unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/etc/kubernetes/pki/ca.crt",
                "/etc/kubernetes/pki/kubelet.crt",
                "/etc/kubernetes/pki/kubelet.key",
                "/etc/kubernetes/kubelet/kubeconfig",
                KUBELET_CONFIG_PATH,
            ]
        );
        assert_eq!(files[1].content, "cert:system:node:cp1");
        assert!(files[3].content.contains("https://127.0.0.1:16443"));
    }

    #[tokio::test]
    async fn test_apiserver_files_need_service_account() {
        let mut cluster = cluster();
        cluster.options.kube_api.audit_log_enabled = true;
        cluster.options.kube_api.audit_log_policy = "rules: []".to_string();
        let connector = Arc::new(MockConnector::default());
        let (inf, storage) = mock_infrastructure(&cluster, connector).await;

        let missing = build(&inf, &cluster, &cluster.nodes[0], FileSet::ApiServer).await;
        assert!(missing.is_err());

        storage
            .put_service_account_data(LEADER_KEY, "sa-cert", "sa-key")
            .await
            .unwrap();
        let files = build(&inf, &cluster, &cluster.nodes[0], FileSet::ApiServer)
            .await
            .unwrap();
        let sa = files
            .iter()
            .find(|f| f.path.ends_with("service-account.key"))
            .unwrap();
        assert_eq!(sa.content, "sa-key");
        assert_eq!(sa.mode, "0600");
        assert_eq!(files.last().unwrap().path, AUDIT_POLICY_PATH);
    }

    #[tokio::test]
    async fn test_write_files_through_agent() {
        let agent = node_agent::MockAgent::new("10.0.0.11");
        let files = vec![NodeFile::public(
            "/etc/etcd/pki/ca-peer.crt".to_string(),
            "pem".to_string(),
        )];
        write_files(&agent, &files).await.unwrap();
        assert_eq!(agent.commands(), vec![write_command(&files[0])]);
    }
}
