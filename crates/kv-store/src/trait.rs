//! KvClient trait for mocking
//!
//! This trait abstracts the key-value store so the engine can run against
//! etcd in production and an in-memory store in unit tests.

use crate::error::KvError;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// A stored key with its revisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Key
    pub key: String,
    /// Raw value
    pub value: Vec<u8>,
    /// Revision that created the key
    pub create_revision: i64,
    /// Revision of the last write to the key
    pub mod_revision: i64,
}

/// Transaction guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// Key exists (create revision > 0)
    Exists(String),
    /// Key does not exist
    Missing(String),
    /// Key was last modified at exactly this revision
    ModRevision(String, i64),
}

/// Transaction operation run when every guard holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Write a key
    Put(String, Vec<u8>),
    /// Remove a key
    Delete(String),
}

/// Change observed by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was written
    Put(KeyValue),
    /// A key was removed
    Delete {
        /// Removed key
        key: String,
        /// Revision of the removal
        mod_revision: i64,
    },
}

impl WatchEvent {
    /// Key the event is about
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    /// Store revision of the event
    #[must_use]
    pub fn revision(&self) -> i64 {
        match self {
            Self::Put(kv) => kv.mod_revision,
            Self::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Stream of watch events in revision order
pub type WatchStream = BoxStream<'static, Result<WatchEvent, KvError>>;

/// Trait for key-value store operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait KvClient: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError>;

    /// Read every key under a prefix, sorted by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError>;

    /// Write one key unconditionally
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Remove one key unconditionally
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Run `ops` atomically if every compare holds; returns whether it did
    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, KvError>;

    /// Current store revision
    async fn revision(&self) -> Result<i64, KvError>;

    /// Watch a prefix starting at `start_revision` (inclusive)
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, KvError>;

    /// Grant a lease, returning its id
    async fn grant_lease(&self, ttl_seconds: i64) -> Result<i64, KvError>;

    /// Keep a lease alive until it expires or `cancel` fires.
    ///
    /// Returns an error when the lease is lost.
    async fn keep_alive(&self, lease: i64, cancel: CancellationToken) -> Result<(), KvError>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: i64) -> Result<(), KvError>;

    /// Campaign for leadership of `election`; resolves once elected with the
    /// leader key
    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String, KvError>;
}
