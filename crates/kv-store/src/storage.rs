//! Typed storage facade
//!
//! Every authoritative write made by the engine is a transaction guarded by
//! the existence of the caller's leader key. A replica that lost leadership
//! gets [`KvError::NotLeader`] instead of silently overwriting state.
//!
//! Writes made by external actors (enqueueing, cancelling, toggling queues)
//! are guarded by revision compares instead.

use crate::error::KvError;
use crate::keys::*;
use crate::kv_trait::{Compare, KeyValue, KvClient, TxnOp};
use cluster_spec::names::CONFIG_VERSION;
use cluster_spec::{
    Cluster, Constraints, OperationRecord, RebootQueueEntry, RebootStatus, RepairQueueEntry,
    ResourceDefinition, ServerStatus, VaultConfig, sort_resources,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, KvError>;

/// Maximum operations per transaction when deleting in bulk
const MAX_TXN_OPS: usize = 100;

/// Storage facade over a [`KvClient`]
#[derive(Clone)]
pub struct Storage {
    kv: Arc<dyn KvClient>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T> {
    Ok(serde_json::from_slice(&kv.value)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

impl Storage {
    /// Wrap a client
    #[must_use]
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    /// Underlying client
    #[must_use]
    pub fn kv(&self) -> Arc<dyn KvClient> {
        Arc::clone(&self.kv)
    }

    async fn get_raw(&self, key: &str) -> Result<KeyValue> {
        self.kv
            .get(key)
            .await?
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        decode(&self.get_raw(key).await?)
    }

    async fn get_flag(&self, key: &str) -> Result<bool> {
        match self.kv.get(key).await? {
            Some(kv) => decode(&kv),
            None => Ok(false),
        }
    }

    /// Run a transaction guarded by the leader key
    async fn leader_txn(&self, leader_key: &str, mut compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<()> {
        compares.insert(0, Compare::Exists(leader_key.to_string()));
        if self.kv.txn(compares, ops).await? {
            return Ok(());
        }
        if self.kv.get(leader_key).await?.is_none() {
            return Err(KvError::NotLeader(leader_key.to_string()));
        }
        Err(KvError::Conflict("transaction guard failed".to_string()))
    }

    /// Read a counter and return the next value with a guard on its revision
    async fn next_index(&self, key: &str) -> Result<(i64, Compare)> {
        match self.kv.get(key).await? {
            Some(kv) => {
                let current: i64 = decode(&kv)?;
                Ok((current + 1, Compare::ModRevision(key.to_string(), kv.mod_revision)))
            }
            None => Ok((1, Compare::Missing(key.to_string()))),
        }
    }

    // Cluster configuration

    /// Cluster document
    pub async fn get_cluster(&self) -> Result<Cluster> {
        self.get_json(KEY_CLUSTER).await
    }

    /// Replace the cluster document
    pub async fn put_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.kv.put(KEY_CLUSTER, encode(cluster)?).await
    }

    /// Cluster constraints
    pub async fn get_constraints(&self) -> Result<Constraints> {
        self.get_json(KEY_CONSTRAINTS).await
    }

    /// Replace the cluster constraints
    pub async fn put_constraints(&self, constraints: &Constraints) -> Result<()> {
        self.kv.put(KEY_CONSTRAINTS, encode(constraints)?).await
    }

    /// Layout version applied to nodes; a fresh store is at the current version
    pub async fn get_config_version(&self) -> Result<String> {
        match self.kv.get(KEY_CONFIG_VERSION).await? {
            Some(kv) => Ok(String::from_utf8_lossy(&kv.value).into_owned()),
            None => Ok(CONFIG_VERSION.to_string()),
        }
    }

    /// Record the layout version after an upgrade
    pub async fn put_config_version(&self, leader_key: &str, version: &str) -> Result<()> {
        self.leader_txn(
            leader_key,
            vec![],
            vec![TxnOp::Put(
                KEY_CONFIG_VERSION.to_string(),
                version.as_bytes().to_vec(),
            )],
        )
        .await
    }

    // Credentials

    /// Credential broker settings
    pub async fn get_vault_config(&self) -> Result<VaultConfig> {
        self.get_json(KEY_VAULT).await
    }

    /// Replace the credential broker settings
    pub async fn put_vault_config(&self, config: &VaultConfig) -> Result<()> {
        self.kv.put(KEY_VAULT, encode(config)?).await
    }

    /// PEM of the named CA
    pub async fn get_ca_certificate(&self, name: &str) -> Result<String> {
        let kv = self.get_raw(&ca_key(name)).await?;
        Ok(String::from_utf8_lossy(&kv.value).into_owned())
    }

    /// Store the PEM of a named CA
    pub async fn put_ca_certificate(&self, name: &str, pem: &str) -> Result<()> {
        self.kv.put(&ca_key(name), pem.as_bytes().to_vec()).await
    }

    /// Service account signing certificate and key
    pub async fn get_service_account_data(&self) -> Result<(String, String)> {
        let cert = self.get_raw(KEY_SERVICE_ACCOUNT_CERT).await?;
        let key = self.get_raw(KEY_SERVICE_ACCOUNT_KEY).await?;
        Ok((
            String::from_utf8_lossy(&cert.value).into_owned(),
            String::from_utf8_lossy(&key.value).into_owned(),
        ))
    }

    /// Store the service account key pair unless one already exists
    pub async fn put_service_account_data(&self, leader_key: &str, cert: &str, key: &str) -> Result<()> {
        self.leader_txn(
            leader_key,
            vec![Compare::Missing(KEY_SERVICE_ACCOUNT_CERT.to_string())],
            vec![
                TxnOp::Put(KEY_SERVICE_ACCOUNT_CERT.to_string(), cert.as_bytes().to_vec()),
                TxnOp::Put(KEY_SERVICE_ACCOUNT_KEY.to_string(), key.as_bytes().to_vec()),
            ],
        )
        .await
    }

    // Operation records

    /// Allocate the next record id and store a new running record
    pub async fn register_record(
        &self,
        leader_key: &str,
        operation: &str,
        targets: Vec<String>,
    ) -> Result<OperationRecord> {
        loop {
            let (id, guard) = self.next_index(KEY_RECORD_ID).await?;
            let record = OperationRecord::new(id, operation, targets.clone());
            let ops = vec![
                TxnOp::Put(KEY_RECORD_ID.to_string(), encode(&id)?),
                TxnOp::Put(record_key(id), encode(&record)?),
            ];
            match self.leader_txn(leader_key, vec![guard], ops).await {
                Ok(()) => return Ok(record),
                Err(KvError::Conflict(_)) => {
                    debug!("Record id {} taken, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Overwrite an existing record
    pub async fn update_record(&self, leader_key: &str, record: &OperationRecord) -> Result<()> {
        let key = record_key(record.id);
        self.leader_txn(
            leader_key,
            vec![Compare::Exists(key.clone())],
            vec![TxnOp::Put(key, encode(record)?)],
        )
        .await
    }

    /// Record by id
    pub async fn get_record(&self, id: i64) -> Result<OperationRecord> {
        self.get_json(&record_key(id)).await
    }

    /// Newest `count` records, newest first
    pub async fn get_records(&self, count: usize) -> Result<Vec<OperationRecord>> {
        let kvs = self.kv.get_prefix(KEY_RECORDS_PREFIX).await?;
        kvs.iter().rev().take(count).map(decode).collect()
    }

    /// Highest record id issued so far
    pub async fn get_last_record_id(&self) -> Result<i64> {
        match self.kv.get(KEY_RECORD_ID).await? {
            Some(kv) => decode(&kv),
            None => Ok(0),
        }
    }

    /// Delete all but the newest `keep` records
    pub async fn delete_old_records(&self, leader_key: &str, keep: usize) -> Result<usize> {
        let kvs = self.kv.get_prefix(KEY_RECORDS_PREFIX).await?;
        if kvs.len() <= keep {
            return Ok(0);
        }

        let stale: Vec<String> = kvs[..kvs.len() - keep].iter().map(|kv| kv.key.clone()).collect();
        for chunk in stale.chunks(MAX_TXN_OPS) {
            let ops = chunk.iter().cloned().map(TxnOp::Delete).collect();
            self.leader_txn(leader_key, vec![], ops).await?;
        }
        debug!("Deleted {} old operation records", stale.len());
        Ok(stale.len())
    }

    // Server status

    /// Last published server status
    pub async fn get_status(&self) -> Result<ServerStatus> {
        self.get_json(KEY_STATUS).await
    }

    /// Publish the server status
    pub async fn put_status(&self, leader_key: &str, status: &ServerStatus) -> Result<()> {
        self.leader_txn(
            leader_key,
            vec![],
            vec![TxnOp::Put(KEY_STATUS.to_string(), encode(status)?)],
        )
        .await
    }

    /// Hostname of the current leader
    pub async fn get_leader_hostname(&self) -> Result<String> {
        let kvs = self.kv.get_prefix(&format!("{KEY_LEADER}/")).await?;
        kvs.iter()
            .min_by_key(|kv| kv.create_revision)
            .map(|kv| String::from_utf8_lossy(&kv.value).into_owned())
            .ok_or_else(|| KvError::NotFound(KEY_LEADER.to_string()))
    }

    // Reboot queue

    /// Reboot queue in index order
    pub async fn get_reboots_entries(&self) -> Result<Vec<RebootQueueEntry>> {
        let kvs = self.kv.get_prefix(KEY_REBOOTS_PREFIX).await?;
        kvs.iter().map(decode).collect()
    }

    /// Reboot queue entry by index
    pub async fn get_reboots_entry(&self, index: i64) -> Result<RebootQueueEntry> {
        self.get_json(&reboots_key(index)).await
    }

    /// Append an entry to the reboot queue, assigning its index
    pub async fn register_reboots_entry(&self, entry: &mut RebootQueueEntry) -> Result<()> {
        let existing = self.get_reboots_entries().await?;
        if existing.iter().any(|e| e.node == entry.node) {
            return Err(KvError::InvalidRequest(format!(
                "node {} is already in the reboot queue",
                entry.node
            )));
        }

        loop {
            let (index, guard) = self.next_index(KEY_REBOOTS_WRITE_INDEX).await?;
            entry.index = index;
            let ops = vec![
                TxnOp::Put(KEY_REBOOTS_WRITE_INDEX.to_string(), encode(&index)?),
                TxnOp::Put(reboots_key(index), encode(entry)?),
            ];
            if self.kv.txn(vec![guard], ops).await? {
                info!("Enqueued reboot of {} as entry {}", entry.node, index);
                return Ok(());
            }
        }
    }

    /// Update an existing entry
    ///
    /// Fails with [`KvError::NotFound`] if the entry was dequeued meanwhile and
    /// with [`KvError::Conflict`] if it was cancelled meanwhile.
    pub async fn update_reboots_entry(&self, leader_key: &str, entry: &RebootQueueEntry) -> Result<()> {
        let key = reboots_key(entry.index);
        loop {
            let kv = self.get_raw(&key).await?;
            let stored: RebootQueueEntry = decode(&kv)?;
            if stored.status == RebootStatus::Cancelled && entry.status != RebootStatus::Cancelled {
                return Err(KvError::Conflict(format!("reboot entry {} was cancelled", entry.index)));
            }
            let guard = Compare::ModRevision(key.clone(), kv.mod_revision);
            match self
                .leader_txn(leader_key, vec![guard], vec![TxnOp::Put(key.clone(), encode(entry)?)])
                .await
            {
                Err(KvError::Conflict(_)) => continue,
                result => return result,
            }
        }
    }

    /// Remove an entry from the reboot queue
    pub async fn delete_reboots_entry(&self, leader_key: &str, index: i64) -> Result<()> {
        self.leader_txn(leader_key, vec![], vec![TxnOp::Delete(reboots_key(index))])
            .await
    }

    /// Mark an entry cancelled; the leader removes it on its next tick
    pub async fn cancel_reboots_entry(&self, index: i64) -> Result<()> {
        let key = reboots_key(index);
        loop {
            let kv = self.get_raw(&key).await?;
            let mut entry: RebootQueueEntry = decode(&kv)?;
            entry.status = RebootStatus::Cancelled;
            let ok = self
                .kv
                .txn(
                    vec![Compare::ModRevision(key.clone(), kv.mod_revision)],
                    vec![TxnOp::Put(key.clone(), encode(&entry)?)],
                )
                .await?;
            if ok {
                return Ok(());
            }
        }
    }

    /// Whether the reboot queue is switched off
    pub async fn is_reboot_queue_disabled(&self) -> Result<bool> {
        self.get_flag(KEY_REBOOTS_DISABLED).await
    }

    /// Switch the reboot queue on or off
    pub async fn enable_reboot_queue(&self, enabled: bool) -> Result<()> {
        self.kv.put(KEY_REBOOTS_DISABLED, encode(&!enabled)?).await
    }

    // Repair queue

    /// Repair queue in index order
    pub async fn get_repairs_entries(&self) -> Result<Vec<RepairQueueEntry>> {
        let kvs = self.kv.get_prefix(KEY_REPAIRS_PREFIX).await?;
        kvs.iter().map(decode).collect()
    }

    /// Repair queue entry by index
    pub async fn get_repairs_entry(&self, index: i64) -> Result<RepairQueueEntry> {
        self.get_json(&repairs_key(index)).await
    }

    /// Append an entry to the repair queue, assigning its index
    pub async fn register_repairs_entry(&self, entry: &mut RepairQueueEntry) -> Result<()> {
        let existing = self.get_repairs_entries().await?;
        if existing
            .iter()
            .any(|e| e.address == entry.address && !e.has_finished())
        {
            return Err(KvError::InvalidRequest(format!(
                "machine {} already has an unfinished repair",
                entry.address
            )));
        }

        loop {
            let (index, guard) = self.next_index(KEY_REPAIRS_WRITE_INDEX).await?;
            entry.index = index;
            let ops = vec![
                TxnOp::Put(KEY_REPAIRS_WRITE_INDEX.to_string(), encode(&index)?),
                TxnOp::Put(repairs_key(index), encode(entry)?),
            ];
            if self.kv.txn(vec![guard], ops).await? {
                info!(
                    "Enqueued repair {} of {} as entry {}",
                    entry.operation, entry.address, index
                );
                return Ok(());
            }
        }
    }

    /// Update an existing entry
    ///
    /// Fails with [`KvError::NotFound`] if the entry was dequeued meanwhile and
    /// with [`KvError::Conflict`] if it was marked deleted meanwhile.
    pub async fn update_repairs_entry(&self, leader_key: &str, entry: &RepairQueueEntry) -> Result<()> {
        let key = repairs_key(entry.index);
        loop {
            let kv = self.get_raw(&key).await?;
            let stored: RepairQueueEntry = decode(&kv)?;
            if stored.deleted && !entry.deleted {
                return Err(KvError::Conflict(format!("repair entry {} was deleted", entry.index)));
            }
            let guard = Compare::ModRevision(key.clone(), kv.mod_revision);
            match self
                .leader_txn(leader_key, vec![guard], vec![TxnOp::Put(key.clone(), encode(entry)?)])
                .await
            {
                Err(KvError::Conflict(_)) => continue,
                result => return result,
            }
        }
    }

    /// Remove an entry from the repair queue
    pub async fn delete_repairs_entry(&self, leader_key: &str, index: i64) -> Result<()> {
        self.leader_txn(leader_key, vec![], vec![TxnOp::Delete(repairs_key(index))])
            .await
    }

    /// Flag an entry for removal; the leader dequeues it on its next tick
    pub async fn mark_repairs_entry_deleted(&self, index: i64) -> Result<()> {
        let key = repairs_key(index);
        loop {
            let kv = self.get_raw(&key).await?;
            let mut entry: RepairQueueEntry = decode(&kv)?;
            entry.deleted = true;
            let ok = self
                .kv
                .txn(
                    vec![Compare::ModRevision(key.clone(), kv.mod_revision)],
                    vec![TxnOp::Put(key.clone(), encode(&entry)?)],
                )
                .await?;
            if ok {
                return Ok(());
            }
        }
    }

    /// Flag every finished entry for removal
    pub async fn delete_finished_repairs_entries(&self) -> Result<usize> {
        let finished: Vec<i64> = self
            .get_repairs_entries()
            .await?
            .into_iter()
            .filter(|e| e.has_finished() && !e.deleted)
            .map(|e| e.index)
            .collect();
        for index in &finished {
            self.mark_repairs_entry_deleted(*index).await?;
        }
        Ok(finished.len())
    }

    /// Whether the repair queue is switched off
    pub async fn is_repair_queue_disabled(&self) -> Result<bool> {
        self.get_flag(KEY_REPAIRS_DISABLED).await
    }

    /// Switch the repair queue on or off
    pub async fn enable_repair_queue(&self, enabled: bool) -> Result<()> {
        self.kv.put(KEY_REPAIRS_DISABLED, encode(&!enabled)?).await
    }

    // Resource definitions

    /// User resource definitions in apply order
    pub async fn get_all_resources(&self) -> Result<Vec<ResourceDefinition>> {
        let kvs = self.kv.get_prefix(KEY_RESOURCE_PREFIX).await?;
        let mut resources = Vec::with_capacity(kvs.len());
        for kv in &kvs {
            let def = ResourceDefinition::parse(&kv.value, kv.mod_revision)
                .map_err(|e| KvError::InvalidRequest(format!("{}: {e}", kv.key)))?;
            resources.push(def);
        }
        sort_resources(&mut resources);
        Ok(resources)
    }

    /// Store a JSON resource definition, returning its key
    pub async fn put_resource(&self, definition: &[u8]) -> Result<String> {
        let def = ResourceDefinition::parse(definition, 0)
            .map_err(|e| KvError::InvalidRequest(e.to_string()))?;
        self.kv.put(&def.key, definition.to_vec()).await?;
        Ok(def.key)
    }

    /// Remove a resource definition
    pub async fn delete_resource(&self, key: &str) -> Result<()> {
        self.kv.delete(key).await
    }
}
