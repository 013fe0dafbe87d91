//! Credential broker.
//!
//! Certificates for etcd, Kubernetes components and the engine's own clients
//! are issued by Vault PKI mounts, one mount per CA. The broker logs in with
//! AppRole and is replaced in place when `/vault` changes.

use async_trait::async_trait;
use cluster_spec::VaultConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

/// CA signing serving certificates of etcd
pub const CA_SERVER: &str = "server";
/// CA signing etcd peer certificates
pub const CA_ETCD_PEER: &str = "etcd-peer";
/// CA signing etcd client certificates
pub const CA_ETCD_CLIENT: &str = "etcd-client";
/// CA of the Kubernetes cluster
pub const CA_KUBERNETES: &str = "kubernetes";

/// Every CA the engine uses
pub const ALL_CAS: [&str; 4] = [CA_SERVER, CA_ETCD_PEER, CA_ETCD_CLIENT, CA_KUBERNETES];

/// Errors returned by the credential broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Request to the broker failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Broker answered with an error status
    #[error("Vault returned {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Broker settings are unusable
    #[error("Invalid broker configuration: {0}")]
    Config(String),

    /// No broker has been configured yet
    #[error("Credential broker is not configured")]
    NotConfigured,
}

/// Certificate request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertRequest {
    /// PKI role to issue with
    pub role: String,
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub alt_names: Vec<String>,
    /// IP subject alternative names
    pub ip_sans: Vec<String>,
    /// Vault TTL string, e.g. `87600h`
    pub ttl: String,
}

impl CertRequest {
    /// Request for `common_name` under `role` with the default TTL
    #[must_use]
    pub fn new(role: &str, common_name: &str) -> Self {
        Self {
            role: role.to_string(),
            common_name: common_name.to_string(),
            ttl: "87600h".to_string(),
            ..Default::default()
        }
    }

    /// Add an IP SAN
    #[must_use]
    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip_sans.push(ip.to_string());
        self
    }

    /// Add a DNS SAN
    #[must_use]
    pub fn with_alt_name(mut self, name: &str) -> Self {
        self.alt_names.push(name.to_string());
        self
    }
}

/// An issued certificate and its private key (PEM)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCert {
    /// Leaf certificate
    pub certificate: String,
    /// Private key of the leaf
    pub private_key: String,
    /// Certificate of the issuing CA
    pub ca_certificate: String,
}

/// Trait for certificate issuance
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Issue a certificate from the CA named `ca`
    async fn issue(&self, ca: &str, request: &CertRequest) -> Result<IssuedCert, BrokerError>;

    /// PEM of the CA named `ca`
    async fn ca_certificate(&self, ca: &str) -> Result<String, BrokerError>;
}

/// Vault PKI mount of a CA
#[must_use]
pub fn pki_mount(ca: &str) -> String {
    format!("clusterops/ca-{ca}")
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    role_id: &'a str,
    secret_id: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Serialize)]
struct IssueRequest<'a> {
    common_name: &'a str,
    #[serde(skip_serializing_if = "String::is_empty")]
    alt_names: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    ip_sans: String,
    ttl: &'a str,
    exclude_cn_from_sans: bool,
}

#[derive(Deserialize)]
struct IssueResponse {
    data: IssueData,
}

#[derive(Deserialize)]
struct IssueData {
    certificate: String,
    private_key: String,
    issuing_ca: String,
}

/// Vault-backed [`CertIssuer`]
#[derive(Debug, Clone)]
pub struct VaultBroker {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl VaultBroker {
    /// Log in to Vault with AppRole
    ///
    /// # Errors
    ///
    /// Returns an error if the CA certificate is invalid or the login is rejected.
    pub async fn connect(config: &VaultConfig) -> Result<Self, BrokerError> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
        if !config.ca_cert.is_empty() {
            let ca = reqwest::Certificate::from_pem(config.ca_cert.as_bytes())
                .map_err(|e| BrokerError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        let http = builder.build()?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();

        let response = http
            .post(format!("{endpoint}/v1/auth/approle/login"))
            .json(&LoginRequest {
                role_id: &config.role_id,
                secret_id: &config.secret_id,
            })
            .send()
            .await?;
        let login: LoginResponse = check(response).await?.json().await?;

        info!("Logged in to Vault at {}", endpoint);
        Ok(Self {
            http,
            endpoint,
            token: login.auth.client_token,
        })
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CertIssuer for VaultBroker {
    async fn issue(&self, ca: &str, request: &CertRequest) -> Result<IssuedCert, BrokerError> {
        let url = format!("{}/v1/{}/issue/{}", self.endpoint, pki_mount(ca), request.role);
        let response = self
            .http
            .post(url)
            .header("X-Vault-Token", &self.token)
            .json(&IssueRequest {
                common_name: &request.common_name,
                alt_names: request.alt_names.join(","),
                ip_sans: request.ip_sans.join(","),
                ttl: &request.ttl,
                exclude_cn_from_sans: true,
            })
            .send()
            .await?;
        let issued: IssueResponse = check(response).await?.json().await?;

        Ok(IssuedCert {
            certificate: issued.data.certificate,
            private_key: issued.data.private_key,
            ca_certificate: issued.data.issuing_ca,
        })
    }

    async fn ca_certificate(&self, ca: &str) -> Result<String, BrokerError> {
        let url = format!("{}/v1/{}/ca/pem", self.endpoint, pki_mount(ca));
        let response = self.http.get(url).send().await?;
        Ok(check(response).await?.text().await?)
    }
}

/// Shared, replaceable broker
///
/// The watcher swaps the inner issuer when the broker configuration changes;
/// holders of the handle see the new issuer on their next call.
#[derive(Clone, Default)]
pub struct BrokerHandle {
    inner: Arc<RwLock<Option<Arc<dyn CertIssuer>>>>,
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("configured", &self.get().is_ok())
            .finish()
    }
}

impl BrokerHandle {
    /// Handle starting with `issuer`, if any
    #[must_use]
    pub fn new(issuer: Option<Arc<dyn CertIssuer>>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(issuer)),
        }
    }

    /// Current issuer
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NotConfigured` before the first successful connect.
    pub fn get(&self) -> Result<Arc<dyn CertIssuer>, BrokerError> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotConfigured)
    }

    /// Swap the issuer used by later passes
    pub fn replace(&self, issuer: Arc<dyn CertIssuer>) {
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(issuer);
    }

    /// Connect to Vault with `config` and swap the issuer in
    ///
    /// # Errors
    ///
    /// Returns the login error; the previous issuer stays in place.
    pub async fn reconnect(&self, config: &VaultConfig) -> Result<(), BrokerError> {
        let broker = VaultBroker::connect(config).await?;
        self.replace(Arc::new(broker));
        Ok(())
    }
}
