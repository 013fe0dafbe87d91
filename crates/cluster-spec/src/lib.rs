//! Cluster specification types
//!
//! Data model shared by the clusterops engine, its storage layer and node agents:
//! - the desired [`Cluster`] document and its option groups
//! - reboot and repair policies and their queue entries
//! - operation records and the server status written by the leader
//! - resource definitions applied to the managed Kubernetes cluster

pub mod broker;
pub mod cluster;
pub mod constraints;
pub mod error;
pub mod images;
pub mod names;
pub mod options;
pub mod reboot;
pub mod record;
pub mod repair;
pub mod resource;
pub mod status;
pub mod validate;

pub use broker::*;
pub use cluster::*;
pub use constraints::*;
pub use error::*;
pub use options::*;
pub use reboot::*;
pub use record::*;
pub use repair::*;
pub use resource::*;
pub use status::*;
pub use validate::validate;
