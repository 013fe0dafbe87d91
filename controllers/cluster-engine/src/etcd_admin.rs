//! Administration of the managed etcd cluster.
//!
//! The managed etcd (the one backing Kubernetes) is distinct from the
//! engine's own store. Membership changes and health checks go through the
//! [`EtcdAdmin`] trait so the strategy tests never need a live cluster.

use crate::error::EngineError;
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use kv_store::EtcdTls;
use std::time::Duration;
use tracing::debug;

/// Key read from each endpoint to observe its revision
pub const HEALTH_KEY: &str = "health";
/// TTL of the lease granted by the cluster health check
pub const HEALTH_LEASE_TTL: i64 = 10;

/// A member of the managed etcd cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdMember {
    /// Member ID assigned by etcd
    pub id: u64,
    /// Empty until the member has started and joined
    pub name: String,
    /// Peer URLs
    pub peer_urls: Vec<String>,
    /// Client URLs; empty until the member has started
    pub client_urls: Vec<String>,
}

impl EtcdMember {
    /// Member name, or the host of its first peer URL for unstarted members
    #[must_use]
    pub fn member_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        self.peer_urls
            .first()
            .map(|url| url_host(url).to_string())
            .unwrap_or_default()
    }
}

/// Host part of `scheme://host:port/path`
#[must_use]
pub fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}

/// Client URL of a node's etcd
#[must_use]
pub fn client_url(address: &str) -> String {
    format!("https://{address}:{}", cluster_spec::names::ETCD_CLIENT_PORT)
}

/// Peer URL of a node's etcd
#[must_use]
pub fn peer_url(address: &str) -> String {
    format!("https://{address}:{}", cluster_spec::names::ETCD_PEER_PORT)
}

/// Trait for managed etcd administration
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait EtcdAdmin: Send + Sync {
    /// Current members
    async fn member_list(&self) -> Result<Vec<EtcdMember>, EngineError>;

    /// Add a member and return the membership after the change
    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Vec<EtcdMember>, EngineError>;

    /// Remove the member with `id`
    async fn member_remove(&self, id: u64) -> Result<(), EngineError>;

    /// Grant a short lease and return the cluster revision at grant time
    async fn grant_revision(&self) -> Result<i64, EngineError>;

    /// Revision observed by one endpoint with a serializable read
    async fn endpoint_revision(&self, endpoint: &str) -> Result<i64, EngineError>;
}

/// [`EtcdAdmin`] over `etcd-client`
#[derive(Clone)]
pub struct ManagedEtcd {
    client: Client,
    tls: Option<EtcdTls>,
}

impl std::fmt::Debug for ManagedEtcd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedEtcd").finish_non_exhaustive()
    }
}

fn connect_options(tls: Option<&EtcdTls>) -> ConnectOptions {
    let mut options = ConnectOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(10));
    if let Some(tls) = tls {
        options = options.with_tls(tls.options());
    }
    options
}

impl ManagedEtcd {
    /// Connect to the managed etcd
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint accepts the connection.
    pub async fn connect(endpoints: &[String], tls: Option<EtcdTls>) -> Result<Self, EngineError> {
        debug!("Connecting to managed etcd at {:?}", endpoints);
        let client = Client::connect(endpoints, Some(connect_options(tls.as_ref()))).await?;
        Ok(Self { client, tls })
    }
}

fn convert(member: &etcd_client::Member) -> EtcdMember {
    EtcdMember {
        id: member.id(),
        name: member.name().to_string(),
        peer_urls: member.peer_urls().to_vec(),
        client_urls: member.client_urls().to_vec(),
    }
}

#[async_trait]
impl EtcdAdmin for ManagedEtcd {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, EngineError> {
        let mut client = self.client.clone();
        let resp = client.member_list().await?;
        Ok(resp.members().iter().map(convert).collect())
    }

    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Vec<EtcdMember>, EngineError> {
        let mut client = self.client.clone();
        let resp = client.member_add(peer_urls, None).await?;
        Ok(resp.member_list().iter().map(convert).collect())
    }

    async fn member_remove(&self, id: u64) -> Result<(), EngineError> {
        let mut client = self.client.clone();
        client.member_remove(id).await?;
        Ok(())
    }

    async fn grant_revision(&self) -> Result<i64, EngineError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(HEALTH_LEASE_TTL, None).await?;
        resp.header()
            .map(|h| h.revision())
            .ok_or_else(|| EngineError::CommandFailed("lease grant without header".to_string()))
    }

    async fn endpoint_revision(&self, endpoint: &str) -> Result<i64, EngineError> {
        let mut client = Client::connect(
            [endpoint.to_string()],
            Some(connect_options(self.tls.as_ref())),
        )
        .await?;
        let resp = client
            .get(HEALTH_KEY, Some(GetOptions::new().with_serializable()))
            .await?;
        resp.header()
            .map(|h| h.revision())
            .ok_or_else(|| EngineError::CommandFailed(format!("get from {endpoint} without header")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory etcd membership
    #[derive(Debug, Default)]
    pub(crate) struct MockEtcd {
        pub(crate) members: Mutex<Vec<EtcdMember>>,
        pub(crate) revision: i64,
        pub(crate) endpoint_revisions: HashMap<String, i64>,
        pub(crate) next_id: Mutex<u64>,
    }

    #[async_trait]
    impl EtcdAdmin for MockEtcd {
        async fn member_list(&self) -> Result<Vec<EtcdMember>, EngineError> {
            Ok(self.members.lock().unwrap().clone())
        }

        async fn member_add(&self, peer_urls: Vec<String>) -> Result<Vec<EtcdMember>, EngineError> {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            let mut members = self.members.lock().unwrap();
            members.push(EtcdMember {
                id: 1000 + *id,
                name: String::new(),
                peer_urls,
                client_urls: Vec::new(),
            });
            Ok(members.clone())
        }

        async fn member_remove(&self, id: u64) -> Result<(), EngineError> {
            self.members.lock().unwrap().retain(|m| m.id != id);
            Ok(())
        }

        async fn grant_revision(&self) -> Result<i64, EngineError> {
            Ok(self.revision)
        }

        async fn endpoint_revision(&self, endpoint: &str) -> Result<i64, EngineError> {
            self.endpoint_revisions
                .get(endpoint)
                .copied()
                .ok_or_else(|| EngineError::NotConnected(endpoint.to_string()))
        }
    }

    #[test]
    fn test_member_name_falls_back_to_peer_host() {
        let member = EtcdMember {
            id: 1,
            name: String::new(),
            peer_urls: vec!["https://10.0.0.14:2380".to_string()],
            client_urls: Vec::new(),
        };
        assert_eq!(member.member_name(), "10.0.0.14");

        let named = EtcdMember {
            name: "10.0.0.11".to_string(),
            ..member
        };
        assert_eq!(named.member_name(), "10.0.0.11");
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://10.0.0.11:2380"), "10.0.0.11");
        assert_eq!(url_host("http://cp1/path"), "cp1");
        assert_eq!(url_host("10.0.0.11"), "10.0.0.11");
    }
}
