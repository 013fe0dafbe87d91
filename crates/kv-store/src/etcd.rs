//! etcd implementation of [`KvClient`]

use crate::error::KvError;
use crate::kv_trait::{Compare, KeyValue, KvClient, TxnOp, WatchEvent, WatchStream};
use etcd_client::{
    Certificate, Client, Compare as EtcdCompare, CompareOp, ConnectOptions, EventType, GetOptions,
    Identity, SortOrder, SortTarget, TlsOptions, Txn, TxnOp as EtcdTxnOp, WatchOptions,
};
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Client certificate material for etcd
#[derive(Debug, Clone)]
pub struct EtcdTls {
    /// PEM of the CA that signed the etcd server certificates
    pub ca_pem: String,
    /// PEM of the client certificate
    pub cert_pem: String,
    /// PEM of the client private key
    pub key_pem: String,
}

impl EtcdTls {
    /// TLS options for `etcd_client::ConnectOptions`
    #[must_use]
    pub fn options(&self) -> TlsOptions {
        TlsOptions::new()
            .ca_certificate(Certificate::from_pem(self.ca_pem.clone()))
            .identity(Identity::from_pem(self.cert_pem.clone(), self.key_pem.clone()))
    }
}

/// Key-value client backed by etcd
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
    endpoints: Vec<String>,
}

impl fmt::Debug for EtcdKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdKv")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl EtcdKv {
    /// Connect to the given endpoints, optionally with mutual TLS
    pub async fn connect(endpoints: &[String], tls: Option<EtcdTls>) -> Result<Self, KvError> {
        if endpoints.is_empty() {
            return Err(KvError::InvalidRequest("no etcd endpoints".to_string()));
        }

        let mut options = ConnectOptions::new().with_connect_timeout(Duration::from_secs(5));
        if let Some(tls) = tls {
            options = options.with_tls(tls.options());
        }

        debug!("Connecting to etcd at {:?}", endpoints);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self {
            client,
            endpoints: endpoints.to_vec(),
        })
    }

    /// Underlying etcd client
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn convert(kv: &etcd_client::KeyValue) -> Result<KeyValue, KvError> {
    Ok(KeyValue {
        key: kv.key_str()?.to_string(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    })
}

fn convert_event(event: &etcd_client::Event) -> Result<Option<WatchEvent>, KvError> {
    let Some(kv) = event.kv() else {
        return Ok(None);
    };
    match event.event_type() {
        EventType::Put => Ok(Some(WatchEvent::Put(convert(kv)?))),
        EventType::Delete => Ok(Some(WatchEvent::Delete {
            key: kv.key_str()?.to_string(),
            mod_revision: kv.mod_revision(),
        })),
    }
}

#[async_trait::async_trait]
impl KvClient for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        resp.kvs().first().map(convert).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = client.get(prefix, Some(options)).await?;
        resp.kvs().iter().map(convert).collect()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, KvError> {
        let compares: Vec<EtcdCompare> = compares
            .into_iter()
            .map(|c| match c {
                Compare::Exists(key) => EtcdCompare::create_revision(key, CompareOp::Greater, 0),
                Compare::Missing(key) => EtcdCompare::create_revision(key, CompareOp::Equal, 0),
                Compare::ModRevision(key, rev) => EtcdCompare::mod_revision(key, CompareOp::Equal, rev),
            })
            .collect();
        let ops: Vec<EtcdTxnOp> = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Put(key, value) => EtcdTxnOp::put(key, value, None),
                TxnOp::Delete(key) => EtcdTxnOp::delete(key, None),
            })
            .collect();

        let mut client = self.client.clone();
        let resp = client.txn(Txn::new().when(compares).and_then(ops)).await?;
        Ok(resp.succeeded())
    }

    async fn revision(&self) -> Result<i64, KvError> {
        let mut client = self.client.clone();
        let resp = client
            .get("/", Some(GetOptions::new().with_count_only()))
            .await?;
        resp.header()
            .map(|h| h.revision())
            .ok_or_else(|| KvError::InvalidRequest("response without header".to_string()))
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, KvError> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;

        // The watcher handle must live as long as the stream.
        let events = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            match stream.message().await {
                Ok(Some(resp)) if resp.canceled() => Some((
                    vec![Err(KvError::Watch(format!(
                        "watch canceled, compact revision {}",
                        resp.compact_revision()
                    )))],
                    None,
                )),
                Ok(Some(resp)) => {
                    let batch: Vec<Result<WatchEvent, KvError>> = resp
                        .events()
                        .iter()
                        .filter_map(|ev| convert_event(ev).transpose())
                        .collect();
                    Some((batch, Some((watcher, stream))))
                }
                Ok(None) => Some((
                    vec![Err(KvError::Watch("watch stream closed".to_string()))],
                    None,
                )),
                Err(e) => Some((vec![Err(KvError::from(e))], None)),
            }
        })
        .flat_map(futures::stream::iter);

        Ok(events.boxed())
    }

    async fn grant_lease(&self, ttl_seconds: i64) -> Result<i64, KvError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_seconds, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: i64, cancel: CancellationToken) -> Result<(), KvError> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        loop {
            keeper.keep_alive().await?;
            let ttl = match stream.message().await? {
                Some(resp) => resp.ttl(),
                None => return Err(KvError::Session("keep-alive stream closed".to_string())),
            };
            if ttl <= 0 {
                return Err(KvError::Session(format!("lease {lease:x} expired")));
            }

            let wait = Duration::from_secs(u64::try_from(ttl / 3).unwrap_or(1).max(1));
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String, KvError> {
        let mut client = self.client.clone();
        let resp = client.campaign(election, value, lease).await?;
        let leader = resp
            .leader()
            .ok_or_else(|| KvError::Session("campaign returned no leader key".to_string()))?;
        Ok(String::from_utf8_lossy(leader.key()).into_owned())
    }
}
