//! Cluster lifecycle engine
//!
//! Drives a set of bare-metal nodes toward the Kubernetes cluster declared
//! in the engine's store. One replica at a time holds leadership; the leader
//! repeatedly gathers the cluster status, decides the next operators and
//! runs them, recording every command.
//!
//! # Layout
//!
//! - [`controller`]: election and the reconcile loop
//! - [`status`]: snapshot of nodes, etcd and Kubernetes
//! - [`strategy`]: picks the operators of one pass
//! - [`op`]: operators and the commanders they are made of
//! - [`reboot`] and [`repair`]: queue deciders
//! - [`infrastructure`]: per-pass connections to nodes and APIs

pub mod backoff;
pub mod broker;
pub mod config;
pub mod controller;
pub mod error;
pub mod etcd_admin;
pub mod infrastructure;
pub mod k8s;
pub mod nodefilter;
pub mod op;
pub mod probes;
pub mod reboot;
pub mod repair;
pub mod static_resources;
pub mod status;
pub mod strategy;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use controller::{Controller, Settings};
pub use error::EngineError;
pub use infrastructure::DefaultConnector;
pub use probes::ProbeState;
