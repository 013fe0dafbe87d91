//! Process configuration.
//!
//! Every flag can also be set through a `CLUSTEROPS_*` environment variable.
//! The cluster itself is configured through the document stored at `/cluster`.

use clap::Parser;
use kv_store::EtcdTls;
use node_agent::SshConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Process settings of the cluster engine
#[derive(Parser, Debug, Clone)]
#[command(name = "cluster-engine")]
#[command(about = "Drives bare-metal nodes toward a declared Kubernetes cluster")]
pub struct Config {
    /// etcd endpoints of the engine's own store
    #[arg(
        long,
        env = "CLUSTEROPS_ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub etcd_endpoints: Vec<String>,

    /// CA certificate for the engine's etcd
    #[arg(long, env = "CLUSTEROPS_ETCD_CA")]
    pub etcd_ca: Option<PathBuf>,

    /// Client certificate for the engine's etcd
    #[arg(long, env = "CLUSTEROPS_ETCD_CERT")]
    pub etcd_cert: Option<PathBuf>,

    /// Client key for the engine's etcd
    #[arg(long, env = "CLUSTEROPS_ETCD_KEY")]
    pub etcd_key: Option<PathBuf>,

    /// Seconds between reconcile passes when nothing changes
    #[arg(long, env = "CLUSTEROPS_INTERVAL", default_value_t = 60)]
    pub interval: u64,

    /// TTL of the election session lease in seconds
    #[arg(long, env = "CLUSTEROPS_SESSION_TTL", default_value_t = 60)]
    pub session_ttl: i64,

    /// Upper bound of nodes updated by one operator
    #[arg(long, env = "CLUSTEROPS_MAX_CONCURRENT_UPDATES", default_value_t = 10)]
    pub max_concurrent_updates: usize,

    /// Default SSH user for nodes without one
    #[arg(long, env = "CLUSTEROPS_SSH_USER", default_value = "root")]
    pub ssh_user: String,

    /// SSH private key
    #[arg(long, env = "CLUSTEROPS_SSH_KEY")]
    pub ssh_key: Option<PathBuf>,

    /// SSH port of the nodes
    #[arg(long, env = "CLUSTEROPS_SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// SSH connect timeout in seconds
    #[arg(long, env = "CLUSTEROPS_SSH_TIMEOUT", default_value_t = 10)]
    pub ssh_timeout: u64,

    /// Value published with the leader key
    #[arg(long, env = "CLUSTEROPS_HOSTNAME")]
    pub hostname: Option<String>,

    /// Listen address of the health probe server
    #[arg(long, env = "CLUSTEROPS_PROBE_ADDR", default_value = "0.0.0.0:8080")]
    pub probe_addr: SocketAddr,

    /// Operation records kept in storage
    #[arg(long, env = "CLUSTEROPS_MAX_RECORDS", default_value_t = 1000)]
    pub max_records: usize,
}

impl Config {
    /// Interval between passes, at least one second
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval.max(1))
    }

    /// SSH settings shared by every node connection
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            key_path: self.ssh_key.clone(),
            port: self.ssh_port,
            connect_timeout: Duration::from_secs(self.ssh_timeout),
            ..SshConfig::default()
        }
    }

    /// Hostname published as the leader value
    #[must_use]
    pub fn leader_value(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "cluster-engine".to_string())
    }

    /// Load TLS material for the engine's etcd, if configured
    ///
    /// # Errors
    ///
    /// Fails when only some of the three files are given or one cannot be read.
    pub fn etcd_tls(&self) -> std::io::Result<Option<EtcdTls>> {
        match (&self.etcd_ca, &self.etcd_cert, &self.etcd_key) {
            (None, None, None) => Ok(None),
            (Some(ca), Some(cert), Some(key)) => Ok(Some(EtcdTls {
                ca_pem: std::fs::read_to_string(ca)?,
                cert_pem: std::fs::read_to_string(cert)?,
                key_pem: std::fs::read_to_string(key)?,
            })),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "--etcd-ca, --etcd-cert and --etcd-key must be given together",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["cluster-engine"]);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.max_concurrent_updates, 10);
        assert_eq!(config.max_records, 1000);
        assert_eq!(config.etcd_endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert!(config.etcd_tls().expect("tls").is_none());
    }

    #[test]
    fn test_endpoints_are_comma_separated() {
        let config = Config::parse_from([
            "cluster-engine",
            "--etcd-endpoints",
            "https://10.0.0.1:2379,https://10.0.0.2:2379",
        ]);
        assert_eq!(config.etcd_endpoints.len(), 2);
    }

    #[test]
    fn test_partial_tls_is_rejected() {
        let config = Config::parse_from(["cluster-engine", "--etcd-ca", "/tmp/ca.pem"]);
        assert!(config.etcd_tls().is_err());
    }
}
