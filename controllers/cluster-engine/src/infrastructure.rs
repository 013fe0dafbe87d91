//! Per-pass infrastructure.
//!
//! An [`Infrastructure`] is created at the start of each reconcile pass and
//! closed at its end. It owns the SSH agents of reachable nodes and caches
//! the engine's client credentials and Kubernetes clients for the pass.

use crate::broker::{BrokerHandle, CA_ETCD_CLIENT, CA_KUBERNETES, CA_SERVER, CertIssuer, CertRequest};
use crate::error::EngineError;
use crate::etcd_admin::{EtcdAdmin, ManagedEtcd};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cluster_spec::names::APISERVER_PORT;
use cluster_spec::{Cluster, Node};
use futures::future::join_all;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kv_store::{EtcdTls, Storage};
use node_agent::{Agent, AgentError, ContainerEngine, DockerEngine, SshAgent, SshConfig};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Common name of the engine's client certificates
pub const ENGINE_USER: &str = "clusterops";

/// PEM material of a TLS client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    /// CA certificate
    pub ca_pem: String,
    /// Client certificate
    pub cert_pem: String,
    /// Client key
    pub key_pem: String,
}

/// Trait for opening connections to nodes and clusters
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect an agent to a node
    async fn connect_agent(&self, node: &Node) -> Result<Arc<dyn Agent>, AgentError>;

    /// Container engine driven through an agent
    fn engine(&self, agent: Arc<dyn Agent>) -> Arc<dyn ContainerEngine>;

    /// Admin client of the managed etcd
    async fn etcd_admin(
        &self,
        endpoints: &[String],
        tls: Option<EtcdTls>,
    ) -> Result<Arc<dyn EtcdAdmin>, EngineError>;

    /// Kubernetes client talking to `server` directly
    async fn kube_client(
        &self,
        server: &str,
        credentials: &ClientCredentials,
    ) -> Result<kube::Client, EngineError>;

    /// Run a command on the engine host and return its stdout
    async fn run_local(&self, argv: &[String], timeout: Duration) -> Result<String, EngineError>;
}

/// Production connector: SSH, docker, etcd-client and kube
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    ssh: SshConfig,
    default_user: String,
}

impl DefaultConnector {
    /// Connector using `ssh` settings and `default_user` for nodes without a user
    #[must_use]
    pub fn new(ssh: SshConfig, default_user: String) -> Self {
        Self { ssh, default_user }
    }
}

/// Render a kubeconfig document for a client certificate
#[must_use]
pub fn kubeconfig_document(server: &str, credentials: &ClientCredentials) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "cluster",
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(&credentials.ca_pem),
            },
        }],
        "users": [{
            "name": "user",
            "user": {
                "client-certificate-data": STANDARD.encode(&credentials.cert_pem),
                "client-key-data": STANDARD.encode(&credentials.key_pem),
            },
        }],
        "contexts": [{
            "name": "default",
            "context": {"cluster": "cluster", "user": "user"},
        }],
        "current-context": "default",
    })
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect_agent(&self, node: &Node) -> Result<Arc<dyn Agent>, AgentError> {
        let user = if node.user.is_empty() {
            &self.default_user
        } else {
            &node.user
        };
        let agent = SshAgent::connect(&node.address, user, &self.ssh).await?;
        Ok(Arc::new(agent))
    }

    fn engine(&self, agent: Arc<dyn Agent>) -> Arc<dyn ContainerEngine> {
        Arc::new(DockerEngine::new(agent))
    }

    async fn etcd_admin(
        &self,
        endpoints: &[String],
        tls: Option<EtcdTls>,
    ) -> Result<Arc<dyn EtcdAdmin>, EngineError> {
        Ok(Arc::new(ManagedEtcd::connect(endpoints, tls).await?))
    }

    async fn kube_client(
        &self,
        server: &str,
        credentials: &ClientCredentials,
    ) -> Result<kube::Client, EngineError> {
        let kubeconfig: Kubeconfig =
            serde_json::from_value(kubeconfig_document(server, credentials))?;
        let mut config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| EngineError::InvalidConfig(format!("kubeconfig: {e}")))?;
        config.connect_timeout = Some(Duration::from_secs(5));
        config.read_timeout = Some(Duration::from_secs(30));
        Ok(kube::Client::try_from(config)?)
    }

    async fn run_local(&self, argv: &[String], timeout: Duration) -> Result<String, EngineError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::InvalidConfig("empty command".to_string()));
        };
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::CommandFailed(format!("{program}: {e}")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_elapsed| EngineError::Timeout(timeout, argv.join(" ")))?
            .map_err(|e| EngineError::CommandFailed(format!("{program}: {e}")))?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed(format!(
                "{}: {}: {}",
                argv.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resources held for one reconcile pass
pub struct Infrastructure {
    storage: Storage,
    connector: Arc<dyn Connector>,
    broker: BrokerHandle,
    agents: Mutex<HashMap<String, Arc<dyn Agent>>>,
    etcd_credentials: OnceCell<EtcdTls>,
    kube_credentials: OnceCell<ClientCredentials>,
    kube_clients: tokio::sync::Mutex<HashMap<String, kube::Client>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for Infrastructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let agents: Vec<String> = self.lock_agents().keys().cloned().collect();
        f.debug_struct("Infrastructure")
            .field("agents", &agents)
            .finish_non_exhaustive()
    }
}

impl Infrastructure {
    /// Connect to every node of the cluster; unreachable nodes get no agent
    ///
    /// # Errors
    ///
    /// Fails only if the probe HTTP client cannot be built.
    pub async fn new(
        cluster: &Cluster,
        storage: Storage,
        connector: Arc<dyn Connector>,
        broker: BrokerHandle,
    ) -> Result<Self, EngineError> {
        let connections = join_all(cluster.nodes.iter().map(|node| {
            let connector = Arc::clone(&connector);
            async move { (node.address.clone(), connector.connect_agent(node).await) }
        }))
        .await;

        let mut agents = HashMap::new();
        for (address, result) in connections {
            match result {
                Ok(agent) => {
                    agents.insert(address, agent);
                }
                Err(e) => warn!("Failed to connect to {}: {}", address, e),
            }
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            storage,
            connector,
            broker,
            agents: Mutex::new(agents),
            etcd_credentials: OnceCell::new(),
            kube_credentials: OnceCell::new(),
            kube_clients: tokio::sync::Mutex::new(HashMap::new()),
            http,
        })
    }

    fn lock_agents(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Agent>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine storage
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Current certificate issuer
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NotConfigured` when `/vault` has not been set.
    pub fn broker(&self) -> Result<Arc<dyn CertIssuer>, EngineError> {
        Ok(self.broker.get()?)
    }

    /// HTTP client for component health probes (certificates not verified)
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Agent of a connected node
    #[must_use]
    pub fn agent(&self, address: &str) -> Option<Arc<dyn Agent>> {
        self.lock_agents().get(address).cloned()
    }

    /// Container engine of a connected node
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotConnected` for nodes without an agent.
    pub fn engine(&self, address: &str) -> Result<Arc<dyn ContainerEngine>, EngineError> {
        let agent = self
            .agent(address)
            .ok_or_else(|| EngineError::NotConnected(address.to_string()))?;
        Ok(self.connector.engine(agent))
    }

    /// Drop the agent of a node about to go away (e.g. reboot)
    pub fn release_agent(&self, address: &str) {
        let agent = self.lock_agents().remove(address);
        if let Some(agent) = agent {
            debug!("Releasing agent of {}", address);
            tokio::spawn(async move { agent.close().await });
        }
    }

    async fn etcd_tls(&self) -> Result<EtcdTls, EngineError> {
        self.etcd_credentials
            .get_or_try_init(|| async {
                let broker = self.broker()?;
                let issued = broker
                    .issue(CA_ETCD_CLIENT, &CertRequest::new("system", ENGINE_USER))
                    .await?;
                let ca_pem = broker.ca_certificate(CA_SERVER).await?;
                Ok::<_, EngineError>(EtcdTls {
                    ca_pem,
                    cert_pem: issued.certificate,
                    key_pem: issued.private_key,
                })
            })
            .await
            .cloned()
    }

    /// Admin client of the managed etcd at `endpoints`
    ///
    /// # Errors
    ///
    /// Fails when credentials cannot be issued or no endpoint answers.
    pub async fn etcd(&self, endpoints: &[String]) -> Result<Arc<dyn EtcdAdmin>, EngineError> {
        let tls = self.etcd_tls().await?;
        self.connector.etcd_admin(endpoints, Some(tls)).await
    }

    async fn kube_credentials(&self) -> Result<ClientCredentials, EngineError> {
        self.kube_credentials
            .get_or_try_init(|| async {
                let broker = self.broker()?;
                let issued = broker
                    .issue(CA_KUBERNETES, &CertRequest::new("admin", ENGINE_USER))
                    .await?;
                Ok::<_, EngineError>(ClientCredentials {
                    ca_pem: issued.ca_certificate,
                    cert_pem: issued.certificate,
                    key_pem: issued.private_key,
                })
            })
            .await
            .cloned()
    }

    /// Kubernetes client talking to the API server on `node`
    ///
    /// # Errors
    ///
    /// Fails when credentials cannot be issued or the client cannot be built.
    pub async fn kube(&self, node: &Node) -> Result<kube::Client, EngineError> {
        let mut clients = self.kube_clients.lock().await;
        if let Some(client) = clients.get(&node.address) {
            return Ok(client.clone());
        }

        let credentials = self.kube_credentials().await?;
        let server = format!("https://{}:{APISERVER_PORT}", node.address);
        let client = self.connector.kube_client(&server, &credentials).await?;
        clients.insert(node.address.clone(), client.clone());
        Ok(client)
    }

    /// Run a command on the engine host
    ///
    /// # Errors
    ///
    /// Returns the command failure or a timeout.
    pub async fn run_local(&self, argv: &[String], timeout: Duration) -> Result<String, EngineError> {
        self.connector.run_local(argv, timeout).await
    }

    /// Close every agent
    pub async fn close(self) {
        let agents: Vec<Arc<dyn Agent>> = self.lock_agents().drain().map(|(_, a)| a).collect();
        join_all(agents.iter().map(|agent| agent.close())).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::tests::StaticIssuer;
    use crate::etcd_admin::tests::MockEtcd;
    use kv_store::MockKv;
    use node_agent::{MockAgent, MockEngine};
    use std::collections::HashSet;

    /// Connector backed by mock agents, engines and a mock etcd
    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub(crate) agents: Mutex<HashMap<String, MockAgent>>,
        pub(crate) engines: Mutex<HashMap<String, MockEngine>>,
        pub(crate) unreachable: HashSet<String>,
        pub(crate) etcd: Arc<MockEtcd>,
        pub(crate) local_outputs: Mutex<HashMap<String, Result<String, String>>>,
        pub(crate) local_commands: Mutex<Vec<Vec<String>>>,
    }

    impl MockConnector {
        pub(crate) fn engine_for(&self, address: &str) -> MockEngine {
            self.engines
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .clone()
        }

        /// Stdout (or failure) of local commands whose program is `program`
        pub(crate) fn set_local(&self, program: &str, result: Result<&str, &str>) {
            self.local_outputs.lock().unwrap().insert(
                program.to_string(),
                result.map(str::to_string).map_err(str::to_string),
            );
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect_agent(&self, node: &Node) -> Result<Arc<dyn Agent>, AgentError> {
            if self.unreachable.contains(&node.address) {
                return Err(AgentError::NotConnected(node.address.clone()));
            }
            let agent = self
                .agents
                .lock()
                .unwrap()
                .entry(node.address.clone())
                .or_insert_with(|| MockAgent::new(&node.address))
                .clone();
            Ok(Arc::new(agent))
        }

        fn engine(&self, agent: Arc<dyn Agent>) -> Arc<dyn ContainerEngine> {
            Arc::new(self.engine_for(agent.address()))
        }

        async fn etcd_admin(
            &self,
            _endpoints: &[String],
            _tls: Option<EtcdTls>,
        ) -> Result<Arc<dyn EtcdAdmin>, EngineError> {
            Ok(Arc::clone(&self.etcd) as Arc<dyn EtcdAdmin>)
        }

        async fn kube_client(
            &self,
            server: &str,
            _credentials: &ClientCredentials,
        ) -> Result<kube::Client, EngineError> {
            Err(EngineError::NotConnected(server.to_string()))
        }

        async fn run_local(&self, argv: &[String], _timeout: Duration) -> Result<String, EngineError> {
            self.local_commands.lock().unwrap().push(argv.to_vec());
            let program = argv.first().cloned().unwrap_or_default();
            match self.local_outputs.lock().unwrap().get(&program) {
                Some(Ok(stdout)) => Ok(stdout.clone()),
                Some(Err(e)) => Err(EngineError::CommandFailed(e.clone())),
                None => Ok(String::new()),
            }
        }
    }

    /// Leader key held by the storage of [`mock_infrastructure`]
    pub(crate) const LEADER_KEY: &str = "/leader/test";

    pub(crate) async fn mock_infrastructure(
        cluster: &Cluster,
        connector: Arc<MockConnector>,
    ) -> (Infrastructure, Storage) {
        let storage = Storage::new(Arc::new(MockKv::new()));
        storage
            .kv()
            .put(LEADER_KEY, b"test".to_vec())
            .await
            .expect("leader key");
        let broker = BrokerHandle::new(Some(Arc::new(StaticIssuer::default())));
        let inf = Infrastructure::new(cluster, storage.clone(), connector, broker)
            .await
            .expect("infrastructure");
        (inf, storage)
    }

    fn cluster() -> Cluster {
        Cluster {
            name: "test".to_string(),
            nodes: vec![
                Node {
                    address: "10.0.0.11".to_string(),
                    control_plane: true,
                    ..Default::default()
                },
                Node {
                    address: "10.0.0.14".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_nodes_have_no_agent() {
        let connector = Arc::new(MockConnector {
            unreachable: HashSet::from(["10.0.0.14".to_string()]),
            ..Default::default()
        });
        let (inf, _) = mock_infrastructure(&cluster(), connector).await;

        assert!(inf.agent("10.0.0.11").is_some());
        assert!(inf.agent("10.0.0.14").is_none());
        assert!(matches!(
            inf.engine("10.0.0.14"),
            Err(EngineError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_release_agent() {
        let connector = Arc::new(MockConnector::default());
        let (inf, _) = mock_infrastructure(&cluster(), Arc::clone(&connector)).await;

        inf.release_agent("10.0.0.11");
        assert!(inf.agent("10.0.0.11").is_none());
        assert!(inf.agent("10.0.0.14").is_some());
    }

    #[test]
    fn test_kubeconfig_document_embeds_credentials() {
        let doc = kubeconfig_document(
            "https://10.0.0.11:6443",
            &ClientCredentials {
                ca_pem: "ca".to_string(),
                cert_pem: "cert".to_string(),
                key_pem: "key".to_string(),
            },
        );
        assert_eq!(doc["clusters"][0]["cluster"]["server"], "https://10.0.0.11:6443");
        assert_eq!(
            doc["users"][0]["user"]["client-key-data"],
            STANDARD.encode("key")
        );
        let parsed: Kubeconfig = serde_json::from_value(doc).expect("kubeconfig");
        assert_eq!(parsed.current_context.as_deref(), Some("default"));
    }
}
