//! Key-value storage for the clusterops engine
//!
//! A thin async client abstraction over an etcd-compatible store plus the
//! typed [`Storage`] facade the engine reads and writes every tick.
//!
//! # Example
//!
//! ```no_run
//! use kv_store::{EtcdKv, Storage};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kv = EtcdKv::connect(&["http://127.0.0.1:2379".to_string()], None).await?;
//! let storage = Storage::new(Arc::new(kv));
//!
//! let cluster = storage.get_cluster().await?;
//! let entries = storage.get_reboots_entries().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Leader-gated writes**: every authoritative write is a transaction
//!   conditioned on the leader key still existing
//! - **Sessions**: lease keep-alive and leader election
//! - **Watch**: revision-ordered change streams for the engine's watcher

pub mod error;
pub mod etcd;
pub mod keys;
#[path = "trait.rs"]
pub mod kv_trait;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod session;
pub mod storage;

pub use error::KvError;
pub use etcd::{EtcdKv, EtcdTls};
pub use kv_trait::{Compare, KeyValue, KvClient, TxnOp, WatchEvent, WatchStream};
#[cfg(feature = "test-util")]
pub use mock::MockKv;
pub use session::Session;
pub use storage::Storage;
